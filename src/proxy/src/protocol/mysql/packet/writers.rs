use crate::error::Result;
use crate::protocol::mysql::constants::{
    CommandCode, AUTH_PLUGIN_DATA_PART_1_LENGTH, SCRAMBLE_SIZE,
};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::conn::PacketConn;

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::WriteMysqlExt;
use tokio::io::{AsyncRead, AsyncWrite};

// Writing into a Vec cannot fail, so the io::Result is discarded.
fn put_lenenc_int(buf: &mut Vec<u8>, n: u64) {
    let _ = buf.write_lenenc_int(n);
}

fn put_lenenc_str(buf: &mut Vec<u8>, s: &[u8]) {
    let _ = buf.write_lenenc_str(s);
}

/// Fields of a handshake response the proxy forwards or synthesizes. The
/// capability mask decides which optional trailing sections are emitted, so
/// the caller must have reconciled it first.
pub struct HandshakeResponseParams<'a> {
    pub capabilities: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u8,
    pub username: &'a [u8],
    pub auth_response: &'a [u8],
    pub database: Option<&'a [u8]>,
    pub auth_plugin: &'a [u8],
    pub connect_attributes: Option<&'a [(String, String)]>,
}

pub async fn write_err_packet<S: AsyncRead + AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    conn: &mut PacketConn<S>,
) -> Result<()> {
    let mut payload = Vec::with_capacity(9 + msg.len());
    payload.push(0xff);
    payload.extend_from_slice(&(err as u16).to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(err.sqlstate());
    payload.extend_from_slice(msg);
    conn.write_packet(&payload, true).await
}

pub async fn write_eof_packet<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PacketConn<S>,
    status: StatusFlags,
) -> Result<()> {
    let mut payload = vec![0xfe, 0x00, 0x00];
    payload.extend_from_slice(&status.bits().to_le_bytes());
    conn.write_packet(&payload, true).await
}

pub async fn write_ok_packet<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PacketConn<S>,
    affected_rows: u64,
    last_insert_id: u64,
    status: StatusFlags,
) -> Result<()> {
    let mut payload = Vec::with_capacity(11);
    payload.push(0x00); // OK packet type
    put_lenenc_int(&mut payload, affected_rows);
    put_lenenc_int(&mut payload, last_insert_id);
    payload.extend_from_slice(&status.bits().to_le_bytes());
    payload.extend_from_slice(&[0x00, 0x00]); // no warnings
    conn.write_packet(&payload, true).await
}

/// Protocol::HandshakeV10, the greeting the proxy presents to its client.
/// The capability mask has already been reconciled against the backend's
/// advertisement; the salt and plugin come from the backend greeting so the
/// client signs against the scramble the backend will verify.
pub async fn write_initial_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PacketConn<S>,
    conn_id: u32,
    scramble: &[u8; SCRAMBLE_SIZE],
    server_version: &[u8],
    capabilities: CapabilityFlags,
    default_collation: u8,
    status: StatusFlags,
    auth_plugin: &[u8],
) -> Result<()> {
    let mut payload = Vec::with_capacity(128);
    payload.push(10); // protocol 10

    payload.extend_from_slice(server_version);
    payload.push(0x00);
    payload.extend_from_slice(&conn_id.to_le_bytes());

    let capability_bytes = capabilities.bits().to_le_bytes();
    payload.extend_from_slice(&scramble[0..AUTH_PLUGIN_DATA_PART_1_LENGTH]); // auth-plugin-data-part-1
    payload.push(0x00); // filler
    payload.extend_from_slice(&capability_bytes[..2]); // lower 2 bytes of the capability flags

    payload.push(default_collation);
    payload.extend_from_slice(&status.bits().to_le_bytes());
    payload.extend_from_slice(&capability_bytes[2..4]); // upper 2 bytes of the capability flags

    payload.push((scramble.len() + 1) as u8); // auth-plugin-data length
    payload.extend_from_slice(&[0x00; 10][..]); // 10 bytes filler
    // part 2 of the auth plugin data, NUL terminated
    payload.extend_from_slice(&scramble[AUTH_PLUGIN_DATA_PART_1_LENGTH..]);
    payload.push(0x00);

    payload.extend_from_slice(auth_plugin);
    payload.push(0x00);
    conn.write_packet(&payload, true).await
}

/// The short SSLRequest sent to a backend before upgrading that side to TLS:
/// the first 32 bytes of a HandshakeResponse41 and nothing else.
pub async fn write_ssl_request<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PacketConn<S>,
    capabilities: CapabilityFlags,
    max_packet_len: u32,
    collation: u8,
) -> Result<()> {
    let mut payload = Vec::with_capacity(32);
    payload.extend_from_slice(&capabilities.bits().to_le_bytes());
    payload.extend_from_slice(&max_packet_len.to_le_bytes());
    payload.push(collation);
    payload.extend_from_slice(&[0x00; 23][..]);
    conn.write_packet(&payload, true).await
}

/// Protocol::HandshakeResponse41. Connect attributes are written in the
/// order the client sent them.
pub async fn write_handshake_response<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PacketConn<S>,
    params: &HandshakeResponseParams<'_>,
) -> Result<()> {
    let caps = params.capabilities;
    let mut payload = Vec::with_capacity(128);
    payload.extend_from_slice(&caps.bits().to_le_bytes());
    payload.extend_from_slice(&params.max_packet_len.to_le_bytes());
    payload.push(params.collation);
    payload.extend_from_slice(&[0x00; 23][..]);

    payload.extend_from_slice(params.username);
    payload.push(0x00);

    if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        put_lenenc_str(&mut payload, params.auth_response);
    } else if caps.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        payload.push(params.auth_response.len() as u8);
        payload.extend_from_slice(params.auth_response);
    } else {
        payload.extend_from_slice(params.auth_response);
        payload.push(0x00);
    }

    if caps.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        payload.extend_from_slice(params.database.unwrap_or_default());
        payload.push(0x00);
    }
    if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        payload.extend_from_slice(params.auth_plugin);
        payload.push(0x00);
    }
    if caps.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
        let mut attrs = Vec::new();
        for (key, value) in params.connect_attributes.unwrap_or_default() {
            put_lenenc_str(&mut attrs, key.as_bytes());
            put_lenenc_str(&mut attrs, value.as_bytes());
        }
        put_lenenc_int(&mut payload, attrs.len() as u64);
        payload.extend_from_slice(&attrs);
    }
    conn.write_packet(&payload, true).await
}

/// Mid-handshake instruction to the client to re-sign its auth response with
/// a different plugin against the given salt.
pub async fn write_auth_switch_request<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PacketConn<S>,
    auth_plugin: &[u8],
    salt: &[u8],
) -> Result<()> {
    let mut payload = Vec::with_capacity(2 + auth_plugin.len() + salt.len() + 2);
    payload.push(0xfe);
    payload.extend_from_slice(auth_plugin);
    payload.push(0x00);
    payload.extend_from_slice(salt);
    payload.push(0x00);
    conn.write_packet(&payload, true).await
}

pub async fn write_com_query<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PacketConn<S>,
    statement: &[u8],
) -> Result<()> {
    let mut payload = Vec::with_capacity(1 + statement.len());
    payload.push(CommandCode::ComQuery as u8);
    payload.extend_from_slice(statement);
    conn.write_packet(&payload, true).await
}

pub async fn write_com_init_db<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PacketConn<S>,
    database: &[u8],
) -> Result<()> {
    let mut payload = Vec::with_capacity(1 + database.len());
    payload.push(CommandCode::ComInitDB as u8);
    payload.extend_from_slice(database);
    conn.write_packet(&payload, true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::basic::{client_handshake_response, initial_handshake};
    use crate::protocol::mysql::charset::DEFAULT_COLLATION_ID;
    use crate::protocol::mysql::constants::AuthPluginName;
    use crate::server::default_capabilities;
    use tokio::io::duplex;

    fn test_salt() -> [u8; SCRAMBLE_SIZE] {
        let mut salt = [0u8; SCRAMBLE_SIZE];
        salt.copy_from_slice(b";X,po_k}>o6^Wz!/kM}N");
        salt
    }

    #[tokio::test]
    async fn test_initial_handshake_round_trips_through_parser() {
        let (a, b) = duplex(4096);
        let mut tx = PacketConn::new(a);
        let mut rx = PacketConn::new(b);

        let caps = default_capabilities() | CapabilityFlags::CLIENT_SSL;
        let salt = test_salt();
        write_initial_handshake(
            &mut tx,
            8,
            &salt,
            b"8.0.36",
            caps,
            DEFAULT_COLLATION_ID,
            StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            AuthPluginName::AuthNativePassword.as_ref().as_bytes(),
        )
        .await
        .unwrap();

        let pkt = rx.read_packet().await.unwrap().unwrap();
        let (_, greeting) = initial_handshake(&pkt).unwrap();
        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, b"8.0.36");
        assert_eq!(greeting.connection_id, 8);
        assert_eq!(greeting.capabilities, caps);
        assert_eq!(greeting.auth_plugin_data, &salt[..]);
        assert_eq!(greeting.auth_plugin_name, b"mysql_native_password");
    }

    #[tokio::test]
    async fn test_handshake_response_round_trips_through_parser() {
        let (a, b) = duplex(4096);
        let mut tx = PacketConn::new(a);
        let mut rx = PacketConn::new(b);

        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_CONNECT_ATTRS;
        let attrs = vec![
            ("_client_name".to_string(), "libmysql".to_string()),
            ("_os".to_string(), "Linux".to_string()),
        ];
        write_handshake_response(
            &mut tx,
            &HandshakeResponseParams {
                capabilities: caps,
                max_packet_len: 16 * 1024 * 1024,
                collation: 45,
                username: b"alice",
                auth_response: &[0x74; 32],
                database: Some(b"shop"),
                auth_plugin: b"caching_sha2_password",
                connect_attributes: Some(&attrs),
            },
        )
        .await
        .unwrap();

        let pkt = rx.read_packet().await.unwrap().unwrap();
        let (_, resp) = client_handshake_response(&pkt, true).unwrap();
        assert_eq!(resp.username.as_deref(), Some(&b"alice"[..]));
        assert_eq!(resp.auth_response, vec![0x74; 32]);
        assert_eq!(resp.database.as_deref(), Some(&b"shop"[..]));
        assert_eq!(resp.auth_plugin, b"caching_sha2_password");
        assert_eq!(resp.connect_attributes.unwrap(), attrs);
    }

    #[tokio::test]
    async fn test_err_packet_layout() {
        let (a, b) = duplex(256);
        let mut tx = PacketConn::new(a);
        let mut rx = PacketConn::new(b);
        write_err_packet(
            ErrorKind::ER_PROXY_NO_BACKEND,
            b"no backend available",
            &mut tx,
        )
        .await
        .unwrap();
        let pkt = rx.read_packet().await.unwrap().unwrap();
        assert_eq!(pkt[0], 0xff);
        assert_eq!(u16::from_le_bytes([pkt[1], pkt[2]]), 9005);
        assert_eq!(pkt[3], b'#');
        assert_eq!(&pkt[4..9], b"HY000");
        assert_eq!(&pkt[9..], b"no backend available");
    }
}
