use crate::protocol::mysql::basic::HandshakeResponse;
use crate::protocol::mysql::constants::SCRAMBLE_SIZE;

use mysql_common::constants::CapabilityFlags;

/// Shadow state of one logical client session, owned by its orchestrator.
///
/// Everything needed to re-bind the session to a fresh backend without the
/// client noticing: identity, selected database, negotiated capabilities and
/// the short-lived token standing in for the original credentials.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub username: String,
    pub database: String,
    pub collation: u16,
    /// Connect attributes in the order the client sent them.
    pub attrs: Vec<(String, String)>,
    /// `client_chosen ∩ backend_advertised ∩ proxy_allowed`, fixed at the
    /// first handshake.
    pub capabilities: CapabilityFlags,
    pub auth_plugin: String,
    pub salt: [u8; SCRAMBLE_SIZE],
    pub max_packet_len: u32,
    /// Minted by the issuer; valid only until the next mint.
    pub token: Option<Vec<u8>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            username: String::new(),
            database: String::new(),
            collation: 0,
            attrs: Vec::new(),
            capabilities: CapabilityFlags::empty(),
            auth_plugin: String::new(),
            salt: [0; SCRAMBLE_SIZE],
            max_packet_len: 16 * 1024 * 1024,
            token: None,
        }
    }
}

impl SessionState {
    pub fn from_first_handshake(
        response: &HandshakeResponse,
        effective_capabilities: CapabilityFlags,
        auth_plugin: &[u8],
        salt: [u8; SCRAMBLE_SIZE],
    ) -> Self {
        Self {
            username: response.db_user_string(),
            database: response
                .database
                .as_deref()
                .map(|db| String::from_utf8_lossy(db).into_owned())
                .unwrap_or_default(),
            collation: response.collation,
            attrs: response.connect_attributes.clone().unwrap_or_default(),
            capabilities: effective_capabilities,
            auth_plugin: String::from_utf8_lossy(auth_plugin).into_owned(),
            salt,
            max_packet_len: response.max_packet_len,
            token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_first_handshake() {
        let response = HandshakeResponse {
            client_flag: CapabilityFlags::CLIENT_PROTOCOL_41,
            max_packet_len: 1 << 24,
            collation: 45,
            username: Some(b"alice".to_vec()),
            auth_response: vec![1, 2, 3],
            auth_plugin: b"mysql_native_password".to_vec(),
            database: Some(b"shop".to_vec()),
            connect_attributes: Some(vec![("_os".to_string(), "Linux".to_string())]),
        };
        let session = SessionState::from_first_handshake(
            &response,
            CapabilityFlags::CLIENT_PROTOCOL_41,
            b"caching_sha2_password",
            [7; SCRAMBLE_SIZE],
        );
        assert_eq!(session.username, "alice");
        assert_eq!(session.database, "shop");
        assert_eq!(session.collation, 45);
        assert_eq!(session.auth_plugin, "caching_sha2_password");
        assert_eq!(session.attrs.len(), 1);
        assert!(session.token.is_none());
    }
}
