use num_derive::{FromPrimitive, ToPrimitive};
use strum_macros::AsRefStr;

// max packet payload length.
// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// auth-plugin-data-part-1 The first 8 bytes of the scramble; the rest is
/// carried in auth-plugin-data-part-2 of the initial handshake.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;

/// The length of the random number required for password scrambling.
/// (auth-plugin-data-part-1 + auth-plugin-data-part-2)
pub const SCRAMBLE_SIZE: usize = 20;

/// Upper bound on the opaque session token replayed during reattach.
pub const MAX_SESSION_TOKEN_LEN: usize = 512;

#[derive(Debug, PartialEq, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    AuthMoreDataHeader = 0x01,
    LocalInFileHeader = 0xfb,
    EOFHeader = 0xfe,
    ErrHeader = 0xff,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

#[cfg(test)]
mod test {
    use crate::protocol::mysql::constants::*;

    #[test]
    pub fn max_packet_size_test() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    pub fn auth_plugin_names_test() {
        assert_eq!(
            AuthPluginName::AuthNativePassword.as_ref(),
            "mysql_native_password"
        );
        assert_eq!(
            AuthPluginName::AuthCachingSha2Password.as_ref(),
            "caching_sha2_password"
        );
    }

    #[test]
    pub fn command_code_test() {
        use num_traits::FromPrimitive;
        assert_eq!(CommandCode::from_u8(0x03), Some(CommandCode::ComQuery));
        assert_eq!(CommandCode::from_u8(0x11), Some(CommandCode::ComChangeUser));
        assert_eq!(CommandCode::from_u8(0xf0), None);
    }
}
