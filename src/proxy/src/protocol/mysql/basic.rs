use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::ParseBuf;
use mysql_common::proto::MyDeserialize;
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};
use winnow::Parser;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    /// header
    pub header: u8,
    /// affected rows in update/insert
    pub affected_rows: u64,
    /// insert_id in update/insert
    pub last_insert_id: u64,
    /// StatusFlags associated with this query
    pub status_flags: StatusFlags,
    /// Warnings
    pub warnings: u16,
    /// Extra information
    pub info: String,
    /// session state change information
    pub session_state_info: String,
}

/// Protocol::HandshakeV10, the greeting a backend opens the connection with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: Vec<u8>,
    pub connection_id: u32,
    pub capabilities: CapabilityFlags,
    pub default_collation: u8,
    pub status_flags: StatusFlags,
    /// auth-plugin-data part 1 and part 2 concatenated, trailing NUL trimmed.
    pub auth_plugin_data: Vec<u8>,
    pub auth_plugin_name: Vec<u8>,
}

/// `HandshakeResponse` represents the client's reply to the initial
/// handshake. Connect attributes keep the order the client sent them in so
/// they can be replayed verbatim on reconnect.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
    pub connect_attributes: Option<Vec<(String, String)>>,
}

impl HandshakeResponse {
    pub fn db_user_string(&self) -> String {
        match &self.username {
            Some(username) => String::from_utf8_lossy(username).to_string(),
            None => "_NONE".to_string(),
        }
    }
}

/// `COM_CHANGE_USER`, parsed only as far as the shadow state needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeUser {
    pub username: Vec<u8>,
    pub auth_response: Vec<u8>,
    pub database: Vec<u8>,
    pub collation: u16,
    pub auth_plugin: Vec<u8>,
}

fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(input)
}

// Trailing strings of a handshake payload: NUL terminated, except that some
// clients omit the terminator on the last field of the packet.
fn null_terminated_or_rest(i: &[u8]) -> (&[u8], &[u8]) {
    match i.iter().position(|&b| b == 0) {
        Some(pos) => (&i[pos + 1..], &i[..pos]),
        None => (&b""[..], i),
    }
}

pub fn eof_server_status(i: &[u8]) -> IResult<&[u8], StatusFlags> {
    let status_flag_slice = &i[3..i.len()];
    let (i, status_flags_code) = le_u16.parse_peek(status_flag_slice)?;
    Ok((i, StatusFlags::from_bits_truncate(status_flags_code)))
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

pub fn ok_packet(i: &[u8], capabilities: CapabilityFlags) -> IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;

    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (info, session_state_info) =
        if !i.is_empty() && capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            let (i, info_size) = read_length_encoded_number(i)?;
            let (i, info) = take(info_size).parse_peek(i)?;

            let session_state_info =
                if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) {
                    let (i, s_t_size) = read_length_encoded_number(i)?;
                    let (_i, session_state_info) = take(s_t_size).parse_peek(i)?;
                    std::str::from_utf8(session_state_info).unwrap_or("")
                } else {
                    ""
                };
            (
                std::str::from_utf8(info).unwrap_or("").to_string(),
                session_state_info.to_string(),
            )
        } else {
            ("".to_string(), "".to_string())
        };

    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state_info,
        },
    ))
}

/// Extracts the human-readable message of a backend ERR packet for logging
/// and for the handshake error surfaced to the caller.
pub fn server_err_message(capabilities: CapabilityFlags, packet: &[u8]) -> Option<String> {
    mysql_common::packets::ErrPacket::deserialize(capabilities, &mut ParseBuf(packet))
        .ok()
        .map(|err| String::from_utf8_lossy(err.server_error().message_ref()).into_owned())
}

pub fn initial_handshake(i: &[u8]) -> IResult<&[u8], InitialHandshake> {
    let (i, protocol_version) = le_u8.parse_peek(i)?;
    let (i, server_version) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, connection_id) = le_u32.parse_peek(i)?;
    let (i, salt_part_1) = take(8u8).parse_peek(i)?;
    let (i, _filler) = take(1u8).parse_peek(i)?;
    let (i, capability_low) = le_u16.parse_peek(i)?;
    let (i, default_collation) = le_u8.parse_peek(i)?;
    let (i, status_flags) = le_u16.parse_peek(i)?;
    let (i, capability_high) = le_u16.parse_peek(i)?;
    let (i, auth_data_len) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(10u8).parse_peek(i)?;

    let capabilities =
        CapabilityFlags::from_bits_truncate((capability_high as u32) << 16 | capability_low as u32);

    let mut auth_plugin_data = salt_part_1.to_vec();
    let (i, salt_part_2) = if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        // $len = MAX(13, auth-plugin-data length - 8), usually 12 bytes + NUL
        let part_2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        take(part_2_len).parse_peek(i)?
    } else {
        (i, &b""[..])
    };
    auth_plugin_data.extend_from_slice(salt_part_2);
    if auth_plugin_data.last() == Some(&0) {
        auth_plugin_data.pop();
    }

    let (i, auth_plugin_name) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            null_terminated_or_rest(i)
        } else {
            (i, &b""[..])
        };

    Ok((
        i,
        InitialHandshake {
            protocol_version,
            server_version: server_version.to_vec(),
            connection_id,
            capabilities,
            default_collation,
            status_flags: StatusFlags::from_bits_truncate(status_flags),
            auth_plugin_data,
            auth_plugin_name: auth_plugin_name.to_vec(),
        },
    ))
}

pub fn client_handshake_response(
    i: &[u8],
    is_after_tls: bool,
) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let mut capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        // HandshakeResponse41
        let (i, cap2) = le_u16.parse_peek(i)?;
        let cap = (cap2 as u32) << 16 | capability_flags as u32;

        capabilities = CapabilityFlags::from_bits_truncate(cap);

        let (i, max_packet_len) = le_u32.parse_peek(i)?;
        let (i, collation) = take(1u8).parse_peek(i)?;

        let (i, _) = take(23u8).parse_peek(i)?;

        if !is_after_tls && capabilities.contains(CapabilityFlags::CLIENT_SSL) {
            // SSLRequest: the rest of the response arrives after the upgrade
            return Ok((
                i,
                HandshakeResponse {
                    client_flag: capabilities,
                    max_packet_len,
                    collation: u16::from(collation[0]),
                    username: None,
                    auth_response: vec![],
                    auth_plugin: vec![],
                    database: None,
                    connect_attributes: None,
                },
            ));
        }

        let (i, username) = {
            let (i, user) = take_until(0.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, Some(user.to_owned()))
        };
        let (i, auth_response) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
                let (i, size) = read_length_encoded_number(i)?;
                take(size).parse_peek(i)?
            } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                let (i, size) = le_u8.parse_peek(i)?;
                take(size).parse_peek(i)?
            } else {
                take_until(0.., "\0").parse_peek(i)?
            };

        let (i, db) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty() {
                let (i, db) = null_terminated_or_rest(i);
                (i, Some(db))
            } else {
                (i, None)
            };

        let (i, auth_plugin) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
                let (i, auth_plugin) = null_terminated_or_rest(i);
                (i, auth_plugin)
            } else {
                (i, &b""[..])
            };

        let (i, connect_attributes) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
                let (i, data_len) = read_length_encoded_number(i)?;
                let (i, data) = take(data_len).parse_peek(i)?;
                let mut input = data;
                let mut connect_attributes = Vec::new();
                while !input.is_empty() {
                    let (remaining, k) = read_length_encoded_string(input)?;
                    let (remaining, v) = read_length_encoded_string(remaining)?;
                    connect_attributes.push((
                        String::from_utf8_lossy(k).into_owned(),
                        String::from_utf8_lossy(v).into_owned(),
                    ));
                    input = remaining;
                }
                (i, Some(connect_attributes))
            } else {
                (i, None)
            };

        Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: u16::from(collation[0]),
                username,
                auth_response: auth_response.to_vec(),
                auth_plugin: auth_plugin.to_vec(),
                database: db.map(|c| c.to_vec()),
                connect_attributes,
            },
        ))
    } else {
        // HandshakeResponse320
        let (i, max_packet_len_v1) = le_u16.parse_peek(i)?;
        let (i, max_packet_len_v2) = le_u8.parse_peek(i)?;
        let max_packet_len = (max_packet_len_v2 as u32) << 16 | max_packet_len_v1 as u32;
        let (i, username) = take_until(0.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;

        let (i, auth_response, db) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
                let (i, auth_response) = take_until(0.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;

                let (i, db) = take_until(0.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;

                (i, auth_response, Some(db))
            } else {
                (&b""[..], i, None)
            };

        Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: 0,
                username: Some(username.to_vec()),
                auth_response: auth_response.to_vec(),
                auth_plugin: vec![],
                database: db.map(|c| c.to_vec()),
                connect_attributes: None,
            },
        ))
    }
}

pub fn com_change_user(i: &[u8], capabilities: CapabilityFlags) -> IResult<&[u8], ChangeUser> {
    let (i, _com) = le_u8.parse_peek(i)?;
    let (i, username) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, auth_response) = if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        let (i, size) = le_u8.parse_peek(i)?;
        take(size).parse_peek(i)?
    } else {
        let (i, auth_response) = take_until(0.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;
        (i, auth_response)
    };
    let (i, database) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, collation) = if i.is_empty() {
        (i, 0)
    } else {
        le_u16.parse_peek(i)?
    };
    let (i, auth_plugin) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            null_terminated_or_rest(i)
        } else {
            (i, &b""[..])
        };
    // connect attributes may follow; the shadow state does not track them here

    Ok((
        i,
        ChangeUser {
            username: username.to_vec(),
            auth_response: auth_response.to_vec(),
            database: database.to_vec(),
            collation,
            auth_plugin: auth_plugin.to_vec(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use crate::protocol::mysql::basic::*;
    use crate::protocol::mysql::charset::collation_names;
    use mysql_common::constants::CapabilityFlags;

    #[test]
    pub fn test_handshake_parse() {
        let bytes = &[
            0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c, 0x74, 0x00, 0x14, 0xf7,
            0xd1, 0x6c, 0xe9, 0x0d, 0x2f, 0x34, 0xb0, 0x2f, 0xd8, 0x1d, 0x18, 0xc7, 0xa4, 0xe8,
            0x98, 0x97, 0x67, 0xeb, 0xad, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c, 0x74, 0x00, 0x6d,
            0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61, 0x74, 0x69, 0x76, 0x65, 0x5f, 0x70, 0x61,
            0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
        ];
        let handshake_rs = client_handshake_response(bytes, false);
        assert!(handshake_rs.is_ok());
        let handshake = handshake_rs.unwrap().1;
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_RESULTS));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert_eq!(
            handshake.collation,
            *collation_names().get("utf8_general_ci").unwrap()
        );
        assert_eq!(handshake.username.unwrap(), &b"default"[..]);
        assert_eq!(handshake.database.unwrap(), &b"default"[..]);
        assert_eq!(handshake.auth_plugin, &b"mysql_native_password"[..]);
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[test]
    pub fn test_handshake_parse_with_ssl() {
        let bytes = &[
            0x85, 0xae, 0x3f, 0x20, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x6a, 0x6f, 0x6e, 0x00, 0x00, 0x05,
        ];
        let (_, ssl_request) = client_handshake_response(bytes, false).unwrap();
        assert!(ssl_request
            .client_flag
            .contains(CapabilityFlags::CLIENT_SSL));
        // the username half is withheld until the stream is upgraded
        assert!(ssl_request.username.is_none());

        let (_, handshake) = client_handshake_response(bytes, true).unwrap();
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_RESULTS));
        assert!(!handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(!handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert!(handshake.client_flag.contains(CapabilityFlags::CLIENT_SSL));
        assert_eq!(
            handshake.collation,
            *collation_names().get("utf8_general_ci").unwrap()
        );
        assert_eq!(handshake.username.unwrap(), &b"jon"[..]);
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[test]
    pub fn test_length_encoded_number() {
        assert_eq!(read_length_encoded_number(&[0x05]).unwrap().1, 5);
        assert_eq!(
            read_length_encoded_number(&[0xfc, 0x34, 0x12]).unwrap().1,
            0x1234
        );
        assert_eq!(
            read_length_encoded_number(&[0xfd, 0x56, 0x34, 0x12]).unwrap().1,
            0x123456
        );
        assert_eq!(read_length_encoded_number(&[0xfb]).unwrap().1, 0);
    }

    #[test]
    pub fn test_ok_packet_parse() {
        let bytes = &[0x00, 0x01, 0x00, 0x02, 0x08, 0x00, 0x00];
        let (_, ok) = ok_packet(bytes, CapabilityFlags::CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(ok.header, 0x00);
        assert_eq!(ok.affected_rows, 1);
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_QUERY_WAS_SLOW));
    }

    #[test]
    pub fn test_com_change_user_parse() {
        let mut bytes = vec![0x11];
        bytes.extend_from_slice(b"bob\0");
        bytes.push(3);
        bytes.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        bytes.extend_from_slice(b"inventory\0");
        bytes.extend_from_slice(&45_u16.to_le_bytes());
        bytes.extend_from_slice(b"mysql_native_password\0");

        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        let (_, change_user) = com_change_user(&bytes, caps).unwrap();
        assert_eq!(change_user.username, b"bob");
        assert_eq!(change_user.auth_response, &[0xaa, 0xbb, 0xcc]);
        assert_eq!(change_user.database, b"inventory");
        assert_eq!(change_user.collation, 45);
        assert_eq!(change_user.auth_plugin, b"mysql_native_password");
    }
}
