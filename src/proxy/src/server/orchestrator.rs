use crate::backend::{dial, BackendAddr, BackendSelector, TokenIssuer};
use crate::error::{ProxyError, Result};
use crate::log_err_packet;
use crate::protocol::mysql::basic::com_change_user;
use crate::protocol::mysql::charset::charset_name;
use crate::protocol::mysql::constants::{CommandCode, MAX_SESSION_TOKEN_LEN};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::conn::{KeepaliveConfig, PacketConn};
use crate::protocol::mysql::packet::writers;
use crate::protocol::mysql::packet::Packet;
use crate::protocol::proxy_header::read_proxy_header;
use crate::server::auth::authenticator::ProxyAuthenticator;
use crate::server::forwarder::change_user_forward::ChangeUserForwarder;
use crate::server::forwarder::query_forward::QueryForwarder;
use crate::server::forwarder::stmt_prepare_forward::StmtPrepareForwarder;
use crate::server::forwarder::{ComForwarder, GenericComForwarder};
use crate::server::session::SessionState;
use crate::server::{default_capabilities, ShutdownMessage};

use mysql_common::constants::CapabilityFlags;
use num_traits::FromPrimitive;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct OrchestratorOptions {
    pub proxy_allowed: CapabilityFlags,
    pub frontend_tls: Option<Arc<ServerConfig>>,
    pub keepalive: Option<KeepaliveConfig>,
    pub redirect_retries: u32,
    pub expect_proxy_header: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            proxy_allowed: default_capabilities(),
            frontend_tls: None,
            keepalive: None,
            redirect_retries: 3,
            expect_proxy_header: false,
        }
    }
}

/// Asks a running session to re-bind to a different backend. Takes effect at
/// the session's next command boundary; `None` lets the selector pick.
#[derive(Clone)]
pub struct RedirectHandle {
    tx: Arc<watch::Sender<Option<BackendAddr>>>,
}

impl RedirectHandle {
    pub fn request(&self, target: Option<BackendAddr>) {
        let _ = self.tx.send(target);
    }
}

/// Owns the two `PacketConn`s of one logical session, drives the handshake,
/// then forwards commands until either side closes, shutdown fires, or a
/// redirect exhausts its retry budget.
pub struct SessionOrchestrator<C> {
    conn_id: u64,
    client: PacketConn<C>,
    backend: PacketConn<TcpStream>,
    session: SessionState,
    selector: Arc<dyn BackendSelector>,
    issuer: Arc<dyn TokenIssuer>,
    options: OrchestratorOptions,
    redirect_rx: watch::Receiver<Option<BackendAddr>>,
    // keeps the redirect channel open even if every external handle is dropped
    _redirect_handle: RedirectHandle,
    pending_redirect: Option<Option<BackendAddr>>,
    shutdown_rx: watch::Receiver<ShutdownMessage>,
}

impl<C> SessionOrchestrator<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Accepts a client, attaches a backend and completes the first-time
    /// handshake. A dial failure is surfaced to the client as a synthesized
    /// ERR before the error propagates.
    pub async fn connect(
        conn_id: u64,
        client_stream: C,
        selector: Arc<dyn BackendSelector>,
        issuer: Arc<dyn TokenIssuer>,
        options: OrchestratorOptions,
        shutdown_rx: watch::Receiver<ShutdownMessage>,
    ) -> Result<(Self, RedirectHandle)> {
        let mut client = PacketConn::new(client_stream);
        if options.expect_proxy_header {
            if let Some(header) = read_proxy_header(&mut client).await? {
                debug!(conn_id, source = %header.source, "decoded PROXY protocol preamble");
                client.set_proxy_peer(header.source);
            }
        }

        let backend_addr = selector.next(&SessionState::default()).await?;
        let mut backend = match Self::dial_backend(&backend_addr, &options).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = writers::write_err_packet(
                    ErrorKind::ER_PROXY_NO_BACKEND,
                    b"no backend available",
                    &mut client,
                )
                .await;
                let _ = client.shutdown().await;
                return Err(e);
            }
        };

        let authenticator = ProxyAuthenticator {
            proxy_allowed: options.proxy_allowed,
            frontend_tls: options.frontend_tls.clone(),
        };
        let session = authenticator
            .authenticate_first_time(
                &mut client,
                &mut backend,
                backend_addr.tls.as_ref(),
                issuer.as_ref(),
            )
            .await?;
        info!(
            conn_id,
            user = %session.username,
            backend = %backend_addr.addr,
            tls = client.is_tls(),
            "session established"
        );

        let (redirect_tx, redirect_rx) = watch::channel(None);
        let handle = RedirectHandle {
            tx: Arc::new(redirect_tx),
        };
        Ok((
            Self {
                conn_id,
                client,
                backend,
                session,
                selector,
                issuer,
                options,
                redirect_rx,
                _redirect_handle: handle.clone(),
                pending_redirect: None,
                shutdown_rx,
            },
            handle,
        ))
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    async fn dial_backend(
        addr: &BackendAddr,
        options: &OrchestratorOptions,
    ) -> Result<PacketConn<TcpStream>> {
        let stream = dial(&addr.addr).await?;
        let mut conn = PacketConn::new(stream);
        if let Some(keepalive) = &options.keepalive {
            // soft failure: the session works without keepalive tuning
            if let Err(e) = conn.set_keepalive(keepalive) {
                warn!(backend = %addr.addr, error = %e, "failed to apply keepalive");
            }
        }
        Ok(conn)
    }

    /// Runs the command phase to completion and tears both sides down.
    pub async fn run(mut self) -> Result<()> {
        let result = self.command_loop().await;
        let _ = self.client.shutdown().await;
        let _ = self.backend.shutdown().await;
        match result {
            Err(e) if e.is_interrupt() => Ok(()),
            other => other,
        }
    }

    fn poll_redirect_request(&mut self) {
        if self.redirect_rx.has_changed().unwrap_or(false) {
            self.pending_redirect = Some(self.redirect_rx.borrow_and_update().clone());
        }
    }

    fn shutdown_requested(&self) -> bool {
        matches!(*self.shutdown_rx.borrow(), ShutdownMessage::Cancel(_))
    }

    async fn command_loop(&mut self) -> Result<()> {
        loop {
            // command boundary: both sides quiescent, counters rewound
            self.client.reset_seq();
            self.backend.reset_seq();

            self.poll_redirect_request();
            if self.pending_redirect.is_some() && self.client.buffered() == 0 {
                let target = self.pending_redirect.take().unwrap_or(None);
                self.redirect_at_boundary(target).await?;
                continue;
            }
            if self.shutdown_requested() {
                debug!(conn_id = self.conn_id, "shutdown at command boundary");
                return Ok(());
            }

            let command_pkt = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => return Ok(()),
                changed = self.redirect_rx.changed() => {
                    if changed.is_ok() {
                        self.pending_redirect =
                            Some(self.redirect_rx.borrow_and_update().clone());
                    }
                    continue;
                }
                pkt = self.client.read_packet() => match pkt? {
                    Some(pkt) => pkt,
                    None => {
                        debug!(conn_id = self.conn_id, "client closed connection");
                        return Ok(());
                    }
                },
            };
            if command_pkt.is_empty() {
                return Err(ProxyError::Protocol("empty command packet".to_string()));
            }

            match CommandCode::from_u8(command_pkt[0]) {
                Some(CommandCode::ComQuit) => {
                    let _ = self.backend.write_packet(&command_pkt, true).await;
                    debug!(conn_id = self.conn_id, "client quit");
                    return Ok(());
                }
                Some(CommandCode::ComInitDB) => {
                    self.session.database =
                        String::from_utf8_lossy(&command_pkt[1..]).into_owned();
                    self.write_command(&command_pkt).await?;
                    GenericComForwarder
                        .forward(&mut self.client, &mut self.backend, &self.session)
                        .await?;
                }
                Some(CommandCode::ComChangeUser) => {
                    if self.pending_redirect.is_some() {
                        // unsound to re-bind mid-credential-change; the client
                        // can retry once the boundary clears
                        writers::write_err_packet(
                            ErrorKind::ER_UNKNOWN_COM_ERROR,
                            b"session redirect in progress, retry",
                            &mut self.client,
                        )
                        .await?;
                        continue;
                    }
                    self.write_command(&command_pkt).await?;
                    let ok = ChangeUserForwarder
                        .forward(&mut self.client, &mut self.backend, &self.session)
                        .await?;
                    if ok.is_some() {
                        self.apply_change_user(&command_pkt);
                    }
                }
                Some(CommandCode::ComStmtSendLongData) => {
                    // no response is expected
                    self.write_command(&command_pkt).await?;
                }
                Some(code @ (CommandCode::ComStmtPrepare | CommandCode::ComStmtClose)) => {
                    self.write_command(&command_pkt).await?;
                    StmtPrepareForwarder {
                        com_code: code,
                        request: command_pkt.clone(),
                    }
                    .forward(&mut self.client, &mut self.backend, &self.session)
                    .await?;
                }
                Some(
                    code @ (CommandCode::ComQuery
                    | CommandCode::ComStmtExecute
                    | CommandCode::ComProcessInfo
                    | CommandCode::ComFieldList
                    | CommandCode::ComStmtFetch),
                ) => {
                    self.write_command(&command_pkt).await?;
                    QueryForwarder { com_code: code }
                        .forward(&mut self.client, &mut self.backend, &self.session)
                        .await?;
                }
                _ => {
                    self.write_command(&command_pkt).await?;
                    GenericComForwarder
                        .forward(&mut self.client, &mut self.backend, &self.session)
                        .await?;
                }
            }

            if self.client.seq() != self.backend.seq() {
                warn!(
                    conn_id = self.conn_id,
                    client_seq = self.client.seq(),
                    backend_seq = self.backend.seq(),
                    "sequence counters diverged after command cycle"
                );
            }
        }
    }

    /// Writes one command to the backend. Losing the backend here is the one
    /// transport failure that is recoverable: the session is still at a
    /// command boundary, so a single redirect is attempted before the write
    /// is retried against the fresh backend.
    async fn write_command(&mut self, command_pkt: &Packet) -> Result<()> {
        match self.backend.write_packet(command_pkt, true).await {
            Ok(()) => Ok(()),
            Err(e @ (ProxyError::WriteConn(_) | ProxyError::FlushConn(_))) => {
                warn!(
                    conn_id = self.conn_id,
                    error = %e,
                    "backend lost at command boundary, redirecting once"
                );
                self.redirect_at_boundary(None).await?;
                self.backend.reset_seq();
                self.backend.write_packet(command_pkt, true).await
            }
            Err(other) => Err(other),
        }
    }

    fn apply_change_user(&mut self, command_pkt: &[u8]) {
        match com_change_user(command_pkt, self.session.capabilities) {
            Ok((_, change_user)) => {
                self.session.username =
                    String::from_utf8_lossy(&change_user.username).into_owned();
                self.session.database =
                    String::from_utf8_lossy(&change_user.database).into_owned();
                if change_user.collation != 0 {
                    self.session.collation = change_user.collation;
                }
                if !change_user.auth_plugin.is_empty() {
                    self.session.auth_plugin =
                        String::from_utf8_lossy(&change_user.auth_plugin).into_owned();
                }
            }
            Err(e) => {
                warn!(
                    conn_id = self.conn_id,
                    "COM_CHANGE_USER succeeded but its payload did not parse: {e:?}"
                );
            }
        }
    }

    /// Re-binds the session to a fresh backend while the client sits idle at
    /// a command boundary. The client observes nothing unless every attempt
    /// fails, in which case it receives a proxy-synthesized ERR.
    async fn redirect_at_boundary(&mut self, target: Option<BackendAddr>) -> Result<()> {
        let token = self.issuer.mint(&self.session).await?;
        if token.len() > MAX_SESSION_TOKEN_LEN {
            return Err(ProxyError::Protocol(format!(
                "issuer minted a {} byte token, limit is {MAX_SESSION_TOKEN_LEN}",
                token.len()
            )));
        }
        self.session.token = Some(token);

        let _ = self.backend.shutdown().await;

        let max_attempts = self.options.redirect_retries.max(1);
        let mut target = target;
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let backend_addr = match target.take() {
                Some(addr) => addr,
                None => match self.selector.next(&self.session).await {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(conn_id = self.conn_id, error = %e, "backend selection failed");
                        if attempts >= max_attempts {
                            return self.fail_redirect(attempts).await;
                        }
                        continue;
                    }
                },
            };
            match self.attach_backend(&backend_addr).await {
                Ok(backend) => {
                    self.backend = backend;
                    self.replay_session_state().await?;
                    info!(
                        conn_id = self.conn_id,
                        backend = %backend_addr.addr,
                        attempts,
                        "session redirected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        conn_id = self.conn_id,
                        backend = %backend_addr.addr,
                        error = %e,
                        "redirect attempt failed"
                    );
                    if attempts >= max_attempts {
                        return self.fail_redirect(attempts).await;
                    }
                }
            }
        }
    }

    async fn fail_redirect(&mut self, attempts: u32) -> Result<()> {
        let _ = writers::write_err_packet(
            ErrorKind::ER_PROXY_REDIRECT_FAILED,
            b"no backend accepted the session",
            &mut self.client,
        )
        .await;
        Err(ProxyError::RedirectFailed { attempts })
    }

    async fn attach_backend(&self, addr: &BackendAddr) -> Result<PacketConn<TcpStream>> {
        let mut backend = Self::dial_backend(addr, &self.options).await?;
        let authenticator = ProxyAuthenticator {
            proxy_allowed: self.options.proxy_allowed,
            frontend_tls: self.options.frontend_tls.clone(),
        };
        authenticator
            .authenticate_second_time(
                &mut backend,
                &self.session,
                self.issuer.as_ref(),
                addr.tls.as_ref(),
            )
            .await?;
        Ok(backend)
    }

    /// Identity, database and attributes travel inside the reattach
    /// handshake; the negotiated charset does not, so it is replayed as a
    /// statement before the client gets the connection back.
    async fn replay_session_state(&mut self) -> Result<()> {
        if let Some(charset) = charset_name(self.session.collation) {
            self.backend.reset_seq();
            writers::write_com_query(
                &mut self.backend,
                format!("SET NAMES {charset}").as_bytes(),
            )
            .await?;
            let reply = self.backend.must_read_packet().await?;
            if reply.is_err_packet() {
                log_err_packet!(self.session.capabilities, reply, "SET NAMES replay ERR");
            }
        }
        Ok(())
    }
}
