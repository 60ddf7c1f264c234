pub mod conn;
pub mod writers;

use crate::protocol::mysql::constants::HeaderInfo;
use std::ops::Deref;

/// `Packet` Represents one logical payload of the MySql wire protocol, already
/// reassembled across 16M chunks.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        let pkt_len = self.0.len();
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && pkt_len <= 5
    }

    /// Packet header is 0xfe and the length distinguishes it from a classic
    /// EOF: the OK packet terminating a result set when CLIENT_DEPRECATE_EOF
    /// is in effect. See [MySQL](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_ok_packet.html)
    pub fn is_result_set_eof_packet(&self) -> bool {
        let pkt_len = self.0.len();
        !self.0.is_empty()
            && self.0[0] == (HeaderInfo::EOFHeader as u8)
            && (7..0xFFFFFF).contains(&pkt_len)
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::LocalInFileHeader as u8)
    }

    /// Auth switch request / classic EOF share the 0xfe tag; during the
    /// connection phase length alone disambiguates.
    pub fn is_auth_switch_packet(&self) -> bool {
        self.0.len() > 5 && self.0[0] == (HeaderInfo::EOFHeader as u8)
    }

    pub fn is_auth_more_data_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::AuthMoreDataHeader as u8)
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::mysql::packet::*;

    #[test]
    fn test_packet_shapes() {
        assert!(Packet::from_vec(vec![0x00, 0x00, 0x00, 0x02, 0x00]).is_ok_packet());
        assert!(Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00]).is_eof_packet());
        assert!(Packet::from_vec(vec![0xff, 0x15, 0x04]).is_err_packet());
        assert!(Packet::from_vec(vec![0xfb, b'/', b'x']).is_local_in_file_packet());
        assert!(!Packet::from_vec(vec![]).is_ok_packet());
    }

    #[test]
    fn test_eof_vs_result_set_terminator() {
        // classic EOF: 0xfe, warnings, status
        let eof = Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00]);
        assert!(eof.is_eof_packet());
        assert!(!eof.is_result_set_eof_packet());
        // deprecate-EOF terminator is an OK packet tagged 0xfe, at least 7 bytes
        let ok_eof = Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert!(!ok_eof.is_eof_packet());
        assert!(ok_eof.is_result_set_eof_packet());
    }
}
