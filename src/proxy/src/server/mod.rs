use mysql_common::constants::CapabilityFlags;
use std::sync::OnceLock;

pub mod auth;
pub mod forwarder;
pub mod orchestrator;
pub mod proxy_cli_args;
pub mod session;

/// Logs a backend ERR packet without aborting on a malformed one.
#[macro_export]
macro_rules! log_err_packet {
    ($capabilities:expr, $packet:expr, $context:expr) => {
        match $crate::protocol::mysql::basic::server_err_message($capabilities, &$packet) {
            Some(message) => tracing::warn!("{} {:?}", $context, message),
            None => tracing::warn!("{} unparsable ERR packet", $context),
        }
    };
}

/// Version string presented when no backend greeting is available to echo
/// (tests, synthesized errors before the backend dial).
pub const DEFAULT_SERVER_VERSION: &[u8] = b"8.0.36-mybridge";

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ShutdownMessage {
    // only use in initialize.
    Init,
    Cancel(String),
}

pub static DEFAULT_CAPABILITIES_ONCE: OnceLock<CapabilityFlags> = OnceLock::new();

// The bits the proxy is willing to carry end-to-end. CLIENT_COMPRESS and
// CLIENT_SSL are deliberately absent: compression would break byte-faithful
// forwarding, and the SSL bit is added per listener policy.
//
// CLIENT_QUERY_ATTRIBUTES new capability flag.
// MariaDB 10.6: not include this attribute.
// MySQL 8.0.34: default include this attribute.
// COM_QUERY: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_query.html
pub fn default_capabilities() -> CapabilityFlags {
    *DEFAULT_CAPABILITIES_ONCE.get_or_init(|| {
        CapabilityFlags::CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
            | CapabilityFlags::CLIENT_FOUND_ROWS
            | CapabilityFlags::CLIENT_IGNORE_SIGPIPE
            | CapabilityFlags::CLIENT_IGNORE_SPACE
            | CapabilityFlags::CLIENT_INTERACTIVE
            | CapabilityFlags::CLIENT_LOCAL_FILES
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_MULTI_STATEMENTS
            | CapabilityFlags::CLIENT_NO_SCHEMA
            | CapabilityFlags::CLIENT_ODBC
            | CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
            | CapabilityFlags::CLIENT_REMEMBER_OPTIONS
            | CapabilityFlags::CLIENT_RESERVED
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_SESSION_TRACK
            | CapabilityFlags::CLIENT_TRANSACTIONS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capabilities_exclude_compression_and_ssl() {
        let caps = default_capabilities();
        assert!(!caps.contains(CapabilityFlags::CLIENT_COMPRESS));
        assert!(!caps.contains(CapabilityFlags::CLIENT_SSL));
        assert!(caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41));
        assert!(caps.contains(CapabilityFlags::CLIENT_LOCAL_FILES));
    }
}
