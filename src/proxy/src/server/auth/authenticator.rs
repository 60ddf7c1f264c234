use crate::backend::{BackendTls, TokenIssuer};
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::basic::{
    client_handshake_response, initial_handshake, server_err_message,
};
use crate::protocol::mysql::constants::{MAX_SESSION_TOKEN_LEN, SCRAMBLE_SIZE};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::conn::PacketConn;
use crate::protocol::mysql::packet::writers::{self, HandshakeResponseParams};
use crate::server::auth::{advertise_to_client, forward_to_backend};
use crate::server::default_capabilities;
use crate::server::session::SessionState;

use mysql_common::constants::CapabilityFlags;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ServerConfig;
use tracing::debug;

/// caching_sha2_password "fast auth succeeded" marker: the terminating OK
/// follows immediately, the client does not get a turn.
const FAST_AUTH_OK: u8 = 0x03;

/// Conducts the MySQL connection phase on both transport sides, bridging
/// them into one negotiated session.
///
/// The authentication phase involves client, proxy and backend. The proxy
/// reads the backend greeting first and forwards it, capability-masked, to
/// the client, so the client signs against the backend's own scramble and
/// the auth response passes through unmodified. Only when the client picks a
/// different plugin does the proxy inject an AuthSwitchRequest to obtain a
/// response the backend can verify.
pub struct ProxyAuthenticator {
    pub proxy_allowed: CapabilityFlags,
    pub frontend_tls: Option<Arc<ServerConfig>>,
}

impl ProxyAuthenticator {
    pub fn new(frontend_tls: Option<Arc<ServerConfig>>) -> Self {
        Self {
            proxy_allowed: default_capabilities(),
            frontend_tls,
        }
    }

    /// Executed once per logical session. On success the returned
    /// [`SessionState`] carries everything a later reattach needs, including
    /// a freshly minted session token.
    pub async fn authenticate_first_time<C, B>(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        backend_tls: Option<&BackendTls>,
        issuer: &dyn TokenIssuer,
    ) -> Result<SessionState>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        backend.reset_seq();
        client.reset_seq();

        let greeting_pkt = backend.must_read_packet().await?;
        let (_, greeting) = initial_handshake(&greeting_pkt)
            .map_err(|e| ProxyError::Handshake(format!("malformed backend greeting: {e:?}")))?;
        if greeting.protocol_version != 10 {
            return Err(ProxyError::Handshake(format!(
                "unsupported backend protocol version {}",
                greeting.protocol_version
            )));
        }
        let mut salt = [0u8; SCRAMBLE_SIZE];
        let salt_len = greeting.auth_plugin_data.len().min(SCRAMBLE_SIZE);
        salt[..salt_len].copy_from_slice(&greeting.auth_plugin_data[..salt_len]);

        let advertised = advertise_to_client(
            greeting.capabilities,
            self.proxy_allowed,
            self.frontend_tls.is_some(),
        );
        writers::write_initial_handshake(
            client,
            greeting.connection_id,
            &salt,
            &greeting.server_version,
            advertised,
            greeting.default_collation,
            greeting.status_flags,
            &greeting.auth_plugin_name,
        )
        .await?;

        let mut response_pkt = client.must_read_packet().await?;
        let (_, mut response) = client_handshake_response(&response_pkt, false)
            .map_err(|e| ProxyError::Handshake(format!("malformed handshake response: {e:?}")))?;
        if response.client_flag.contains(CapabilityFlags::CLIENT_SSL) {
            let Some(tls_conf) = self.frontend_tls.clone() else {
                writers::write_err_packet(
                    ErrorKind::ER_ACCESS_DENIED_ERROR,
                    b"ssl is not enabled on this listener",
                    client,
                )
                .await?;
                return Err(ProxyError::Handshake(
                    "client requested ssl but the listener has no tls config".to_string(),
                ));
            };
            client.upgrade_tls_server(tls_conf).await?;
            response_pkt = client.must_read_packet().await?;
            let (_, full_response) = client_handshake_response(&response_pkt, true).map_err(|e| {
                ProxyError::Handshake(format!("malformed handshake response after tls: {e:?}"))
            })?;
            response = full_response;
        }
        if !response.client_flag.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            writers::write_err_packet(
                ErrorKind::ER_ACCESS_DENIED_ERROR,
                b"CLIENT_PROTOCOL_41 is required",
                client,
            )
            .await?;
            return Err(ProxyError::Handshake(
                "client does not speak protocol 4.1".to_string(),
            ));
        }

        // The scramble the client signed is the backend's own, so its auth
        // response passes through untouched unless the plugins diverge.
        let mut auth_response = response.auth_response.clone();
        let mut auth_plugin = response.auth_plugin.clone();
        if auth_plugin != greeting.auth_plugin_name {
            debug!(
                client_plugin = %String::from_utf8_lossy(&auth_plugin),
                backend_plugin = %String::from_utf8_lossy(&greeting.auth_plugin_name),
                "switching client auth plugin"
            );
            writers::write_auth_switch_request(
                client,
                &greeting.auth_plugin_name,
                &greeting.auth_plugin_data,
            )
            .await?;
            let switch_response = client.must_read_packet().await?;
            auth_response = switch_response.to_vec();
            auth_plugin = greeting.auth_plugin_name.clone();
        }

        let forwarded = forward_to_backend(
            response.client_flag,
            greeting.capabilities,
            self.proxy_allowed,
            backend_tls.is_some(),
        );
        if let Some(tls) = backend_tls {
            writers::write_ssl_request(
                backend,
                forwarded,
                response.max_packet_len,
                response.collation as u8,
            )
            .await?;
            let server_name = ServerName::try_from(tls.server_name.clone()).map_err(|_| {
                ProxyError::Tls(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid backend tls server name",
                ))
            })?;
            backend
                .upgrade_tls_client(Arc::clone(&tls.config), server_name)
                .await?;
        }
        writers::write_handshake_response(
            backend,
            &HandshakeResponseParams {
                capabilities: forwarded,
                max_packet_len: response.max_packet_len,
                collation: response.collation as u8,
                username: response.username.as_deref().unwrap_or_default(),
                auth_response: &auth_response,
                database: response.database.as_deref(),
                auth_plugin: &auth_plugin,
                connect_attributes: response.connect_attributes.as_deref(),
            },
        )
        .await?;

        self.relay_auth_result(client, backend, forwarded).await?;

        let effective = response.client_flag & greeting.capabilities & self.proxy_allowed;
        let mut session =
            SessionState::from_first_handshake(&response, effective, &auth_plugin, salt);
        let token = issuer.mint(&session).await?;
        if token.len() > MAX_SESSION_TOKEN_LEN {
            return Err(ProxyError::Protocol(format!(
                "issuer minted a {} byte token, limit is {MAX_SESSION_TOKEN_LEN}",
                token.len()
            )));
        }
        session.token = Some(token);
        Ok(session)
    }

    /// Relays auth-more-data and switch exchanges until the backend settles
    /// the handshake with OK or ERR. Every backend packet is forwarded to the
    /// client verbatim, terminal ones included.
    async fn relay_auth_result<C, B>(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        capabilities: CapabilityFlags,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        loop {
            let pkt = backend.must_read_packet().await?;
            client.write_packet(&pkt, true).await?;
            if pkt.is_ok_packet() {
                return Ok(());
            }
            if pkt.is_err_packet() {
                let message = server_err_message(capabilities, &pkt)
                    .unwrap_or_else(|| "authentication failed".to_string());
                return Err(ProxyError::Handshake(message));
            }
            if pkt.is_auth_more_data_packet() && pkt.len() == 2 && pkt[1] == FAST_AUTH_OK {
                continue;
            }
            let client_pkt = client.must_read_packet().await?;
            backend.write_packet(&client_pkt, true).await?;
        }
    }

    /// Executed on reconnect: replays the session shadow state against a
    /// fresh backend, presenting the issuer's token in place of the user's
    /// credentials. The issuer contract rules out a plugin switch here; a
    /// backend that asks for one fails the reattach.
    pub async fn authenticate_second_time<B>(
        &self,
        backend: &mut PacketConn<B>,
        session: &SessionState,
        issuer: &dyn TokenIssuer,
        backend_tls: Option<&BackendTls>,
    ) -> Result<()>
    where
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        backend.reset_seq();
        let greeting_pkt = backend.must_read_packet().await?;
        let (_, greeting) = initial_handshake(&greeting_pkt)
            .map_err(|e| ProxyError::Handshake(format!("malformed backend greeting: {e:?}")))?;

        let token = session.token.as_ref().ok_or_else(|| {
            ProxyError::Handshake("session has no token to reattach with".to_string())
        })?;
        if token.len() > MAX_SESSION_TOKEN_LEN {
            return Err(ProxyError::Protocol(format!(
                "session token of {} bytes exceeds the {MAX_SESSION_TOKEN_LEN} byte limit",
                token.len()
            )));
        }

        let mut capabilities = (session.capabilities & greeting.capabilities)
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        capabilities &= !CapabilityFlags::CLIENT_SSL;
        if session.database.is_empty() {
            capabilities &= !CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        } else {
            capabilities |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        if session.attrs.is_empty() {
            capabilities &= !CapabilityFlags::CLIENT_CONNECT_ATTRS;
        }

        if let Some(tls) = backend_tls {
            capabilities |= CapabilityFlags::CLIENT_SSL;
            writers::write_ssl_request(
                backend,
                capabilities,
                session.max_packet_len,
                session.collation as u8,
            )
            .await?;
            let server_name = ServerName::try_from(tls.server_name.clone()).map_err(|_| {
                ProxyError::Tls(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid backend tls server name",
                ))
            })?;
            backend
                .upgrade_tls_client(Arc::clone(&tls.config), server_name)
                .await?;
        }
        writers::write_handshake_response(
            backend,
            &HandshakeResponseParams {
                capabilities,
                max_packet_len: session.max_packet_len,
                collation: session.collation as u8,
                username: session.username.as_bytes(),
                auth_response: token,
                database: (!session.database.is_empty()).then_some(session.database.as_bytes()),
                auth_plugin: issuer.plugin_name().as_bytes(),
                connect_attributes: (!session.attrs.is_empty()).then_some(session.attrs.as_slice()),
            },
        )
        .await?;

        let reply = backend.must_read_packet().await?;
        if reply.is_ok_packet() {
            return Ok(());
        }
        if reply.is_err_packet() {
            let message = server_err_message(capabilities, &reply)
                .unwrap_or_else(|| "token authentication failed".to_string());
            return Err(ProxyError::Handshake(message));
        }
        if reply.first() == Some(&0xfe) {
            return Err(ProxyError::AuthPluginUnsupported(
                issuer.plugin_name().to_string(),
            ));
        }
        Err(ProxyError::Protocol(format!(
            "unexpected packet tag {:#04x} during session reattach",
            reply.first().copied().unwrap_or(0)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StaticTokenIssuer, DEFAULT_TOKEN_PLUGIN};
    use crate::protocol::mysql::basic::HandshakeResponse;
    use mysql_common::constants::StatusFlags;
    use tokio::io::duplex;

    const BACKEND_SALT: &[u8; SCRAMBLE_SIZE] = b"bbbbbbbbbbbbbbbbbbbb";

    fn backend_caps() -> CapabilityFlags {
        default_capabilities() | CapabilityFlags::CLIENT_COMPRESS
    }

    async fn run_fake_backend<S>(
        stream: S,
        plugin: &str,
        pre_ok_exchanges: Vec<(Vec<u8>, bool)>,
    ) -> HandshakeResponse
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut conn = PacketConn::new(stream);
        writers::write_initial_handshake(
            &mut conn,
            42,
            BACKEND_SALT,
            b"8.0.36",
            backend_caps(),
            45,
            StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            plugin.as_bytes(),
        )
        .await
        .unwrap();
        let response_pkt = conn.must_read_packet().await.unwrap();
        let (_, response) = client_handshake_response(&response_pkt, true).unwrap();
        for (more_data, expect_client_turn) in pre_ok_exchanges {
            conn.write_packet(&more_data, true).await.unwrap();
            if expect_client_turn {
                conn.must_read_packet().await.unwrap();
            }
        }
        writers::write_ok_packet(&mut conn, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT)
            .await
            .unwrap();
        response
    }

    #[tokio::test]
    async fn test_first_time_auth_with_plugin_switch() {
        let (client_end, proxy_client_end) = duplex(4096);
        let (backend_end, proxy_backend_end) = duplex(4096);
        let mut client = PacketConn::new(proxy_client_end);
        let mut backend = PacketConn::new(proxy_backend_end);

        let fake_backend = tokio::spawn(run_fake_backend(
            backend_end,
            "caching_sha2_password",
            vec![],
        ));

        let fake_client = tokio::spawn(async move {
            let mut conn = PacketConn::new(client_end);
            let greeting_pkt = conn.must_read_packet().await.unwrap();
            let (_, greeting) = initial_handshake(&greeting_pkt).unwrap();
            // the client insists on its own plugin
            writers::write_handshake_response(
                &mut conn,
                &HandshakeResponseParams {
                    capabilities: CapabilityFlags::CLIENT_PROTOCOL_41
                        | CapabilityFlags::CLIENT_SECURE_CONNECTION
                        | CapabilityFlags::CLIENT_PLUGIN_AUTH
                        | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
                        | CapabilityFlags::CLIENT_CONNECT_WITH_DB,
                    max_packet_len: 1 << 24,
                    collation: 45,
                    username: b"alice",
                    auth_response: &[0x11; 20],
                    database: Some(b"shop"),
                    auth_plugin: b"mysql_native_password",
                    connect_attributes: None,
                },
            )
            .await
            .unwrap();

            let switch_pkt = conn.must_read_packet().await.unwrap();
            assert_eq!(switch_pkt[0], 0xfe);
            let body = &switch_pkt[1..];
            let nul = body.iter().position(|&b| b == 0).unwrap();
            assert_eq!(&body[..nul], b"caching_sha2_password");
            assert_eq!(&body[nul + 1..body.len() - 1], BACKEND_SALT);

            conn.write_packet(&[0x22; 32], true).await.unwrap();
            let ok = conn.must_read_packet().await.unwrap();
            assert!(ok.is_ok_packet());
            greeting
        });

        let authenticator = ProxyAuthenticator::new(None);
        let issuer = StaticTokenIssuer::default();
        let session = authenticator
            .authenticate_first_time(&mut client, &mut backend, None, &issuer)
            .await
            .unwrap();

        let backend_view = fake_backend.await.unwrap();
        let client_view = fake_client.await.unwrap();

        assert_eq!(session.username, "alice");
        assert_eq!(session.database, "shop");
        assert_eq!(session.auth_plugin, "caching_sha2_password");
        assert_eq!(session.salt, *BACKEND_SALT);
        assert!(session.token.is_some());
        // the re-signed response reached the backend under the backend plugin
        assert_eq!(backend_view.auth_response, vec![0x22; 32]);
        assert_eq!(backend_view.auth_plugin, b"caching_sha2_password");
        // nothing outside proxy_allowed ∩ backend_advertised reached the client
        let allowed = default_capabilities() & backend_caps();
        assert_eq!(
            client_view.capabilities & !allowed,
            CapabilityFlags::empty()
        );
        assert!(!client_view
            .capabilities
            .contains(CapabilityFlags::CLIENT_COMPRESS));
    }

    #[tokio::test]
    async fn test_first_time_auth_fast_auth_marker_needs_no_client_turn() {
        let (client_end, proxy_client_end) = duplex(4096);
        let (backend_end, proxy_backend_end) = duplex(4096);
        let mut client = PacketConn::new(proxy_client_end);
        let mut backend = PacketConn::new(proxy_backend_end);

        let fake_backend = tokio::spawn(run_fake_backend(
            backend_end,
            "caching_sha2_password",
            vec![(vec![0x01, 0x03], false)],
        ));

        let fake_client = tokio::spawn(async move {
            let mut conn = PacketConn::new(client_end);
            let _ = conn.must_read_packet().await.unwrap();
            writers::write_handshake_response(
                &mut conn,
                &HandshakeResponseParams {
                    capabilities: CapabilityFlags::CLIENT_PROTOCOL_41
                        | CapabilityFlags::CLIENT_SECURE_CONNECTION
                        | CapabilityFlags::CLIENT_PLUGIN_AUTH
                        | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
                    max_packet_len: 1 << 24,
                    collation: 45,
                    username: b"alice",
                    auth_response: &[0x11; 32],
                    database: None,
                    auth_plugin: b"caching_sha2_password",
                    connect_attributes: None,
                },
            )
            .await
            .unwrap();
            let more_data = conn.must_read_packet().await.unwrap();
            assert_eq!(&*more_data, &[0x01, 0x03]);
            let ok = conn.must_read_packet().await.unwrap();
            assert!(ok.is_ok_packet());
        });

        let authenticator = ProxyAuthenticator::new(None);
        let issuer = StaticTokenIssuer::default();
        let session = authenticator
            .authenticate_first_time(&mut client, &mut backend, None, &issuer)
            .await
            .unwrap();
        fake_backend.await.unwrap();
        fake_client.await.unwrap();
        assert_eq!(session.auth_plugin, "caching_sha2_password");
        assert_eq!(session.database, "");
    }

    #[tokio::test]
    async fn test_first_time_auth_full_auth_round_trip() {
        let (client_end, proxy_client_end) = duplex(4096);
        let (backend_end, proxy_backend_end) = duplex(4096);
        let mut client = PacketConn::new(proxy_client_end);
        let mut backend = PacketConn::new(proxy_backend_end);

        // perform-full-authentication: the client answers with its password
        let fake_backend = tokio::spawn(run_fake_backend(
            backend_end,
            "caching_sha2_password",
            vec![(vec![0x01, 0x04], true)],
        ));

        let fake_client = tokio::spawn(async move {
            let mut conn = PacketConn::new(client_end);
            let _ = conn.must_read_packet().await.unwrap();
            writers::write_handshake_response(
                &mut conn,
                &HandshakeResponseParams {
                    capabilities: CapabilityFlags::CLIENT_PROTOCOL_41
                        | CapabilityFlags::CLIENT_SECURE_CONNECTION
                        | CapabilityFlags::CLIENT_PLUGIN_AUTH
                        | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
                    max_packet_len: 1 << 24,
                    collation: 45,
                    username: b"alice",
                    auth_response: &[0x11; 32],
                    database: None,
                    auth_plugin: b"caching_sha2_password",
                    connect_attributes: None,
                },
            )
            .await
            .unwrap();
            let more_data = conn.must_read_packet().await.unwrap();
            assert_eq!(&*more_data, &[0x01, 0x04]);
            conn.write_packet(b"cleartext-password\0", true).await.unwrap();
            let ok = conn.must_read_packet().await.unwrap();
            assert!(ok.is_ok_packet());
        });

        let authenticator = ProxyAuthenticator::new(None);
        let issuer = StaticTokenIssuer::default();
        authenticator
            .authenticate_first_time(&mut client, &mut backend, None, &issuer)
            .await
            .unwrap();
        fake_backend.await.unwrap();
        fake_client.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_time_auth_replays_token() {
        let (backend_end, proxy_backend_end) = duplex(4096);
        let mut backend = PacketConn::new(proxy_backend_end);

        let fake_backend = tokio::spawn(run_fake_backend(
            backend_end,
            "caching_sha2_password",
            vec![],
        ));

        let session = SessionState {
            username: "alice".to_string(),
            database: "shop".to_string(),
            collation: 45,
            capabilities: default_capabilities(),
            auth_plugin: "caching_sha2_password".to_string(),
            token: Some(vec![0x74; 512]),
            ..SessionState::default()
        };
        let authenticator = ProxyAuthenticator::new(None);
        let issuer = StaticTokenIssuer::default();
        authenticator
            .authenticate_second_time(&mut backend, &session, &issuer, None)
            .await
            .unwrap();

        let backend_view = fake_backend.await.unwrap();
        assert_eq!(backend_view.username.as_deref(), Some(&b"alice"[..]));
        assert_eq!(backend_view.database.as_deref(), Some(&b"shop"[..]));
        assert_eq!(backend_view.auth_response, vec![0x74; 512]);
        assert_eq!(backend_view.auth_plugin, DEFAULT_TOKEN_PLUGIN.as_bytes());
    }

    #[tokio::test]
    async fn test_second_time_auth_rejects_plugin_switch() {
        let (backend_end, proxy_backend_end) = duplex(4096);
        let mut backend = PacketConn::new(proxy_backend_end);

        let fake_backend = tokio::spawn(async move {
            let mut conn = PacketConn::new(backend_end);
            writers::write_initial_handshake(
                &mut conn,
                42,
                BACKEND_SALT,
                b"8.0.36",
                backend_caps(),
                45,
                StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                b"caching_sha2_password",
            )
            .await
            .unwrap();
            let _ = conn.must_read_packet().await.unwrap();
            writers::write_auth_switch_request(
                &mut conn,
                b"mysql_native_password",
                BACKEND_SALT,
            )
            .await
            .unwrap();
        });

        let session = SessionState {
            username: "alice".to_string(),
            capabilities: default_capabilities(),
            token: Some(vec![0x74; 64]),
            ..SessionState::default()
        };
        let authenticator = ProxyAuthenticator::new(None);
        let issuer = StaticTokenIssuer::default();
        let err = authenticator
            .authenticate_second_time(&mut backend, &session, &issuer, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::AuthPluginUnsupported(_)));
        fake_backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_time_auth_without_token_fails() {
        let (backend_end, proxy_backend_end) = duplex(4096);
        let mut backend = PacketConn::new(proxy_backend_end);

        let fake_backend = tokio::spawn(async move {
            let mut conn = PacketConn::new(backend_end);
            writers::write_initial_handshake(
                &mut conn,
                42,
                BACKEND_SALT,
                b"8.0.36",
                backend_caps(),
                45,
                StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                b"caching_sha2_password",
            )
            .await
            .unwrap();
        });

        let authenticator = ProxyAuthenticator::new(None);
        let issuer = StaticTokenIssuer::default();
        let err = authenticator
            .authenticate_second_time(&mut backend, &SessionState::default(), &issuer, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
        fake_backend.await.unwrap();
    }
}
