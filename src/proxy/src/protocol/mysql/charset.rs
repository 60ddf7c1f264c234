use std::collections::HashMap;
use std::sync::OnceLock;

pub const UTF8_GENERAL_CI: u16 = 33;
pub const UTF8_MB4_GENERAL_CI: u16 = 45;
pub const BINARY: u16 = 63;

/// Collation advertised in a synthesized initial handshake when the backend
/// greeting is not available (tests, direct server mode).
pub const DEFAULT_COLLATION_ID: u8 = UTF8_GENERAL_CI as u8;

pub fn collation_names() -> &'static HashMap<&'static str, u16> {
    static COLLATIONS: OnceLock<HashMap<&'static str, u16>> = OnceLock::new();
    COLLATIONS.get_or_init(|| {
        HashMap::from([
            ("latin1_swedish_ci", 8_u16),
            ("utf8_general_ci", UTF8_GENERAL_CI),
            ("utf8mb4_general_ci", UTF8_MB4_GENERAL_CI),
            ("binary", BINARY),
            ("utf8mb4_0900_ai_ci", 255),
        ])
    })
}

/// Maps a collation id to the charset name usable in `SET NAMES`.
/// Only the charsets the proxy replays on reconnect are covered.
pub fn charset_name(collation: u16) -> Option<&'static str> {
    match collation {
        8 | 5 | 47 => Some("latin1"),
        33 | 83 | 192..=215 => Some("utf8"),
        45 | 46 | 224..=247 | 255..=309 => Some("utf8mb4"),
        63 => Some("binary"),
        _ => None,
    }
}
