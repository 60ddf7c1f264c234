//! PROXY protocol v1/v2 preamble, optionally consumed on the client side
//! before any MySQL framing. It conveys the original client address through
//! an intermediate TCP load balancer.
//! See: https://www.haproxy.org/download/1.8/doc/proxy-protocol.txt

use crate::error::{ProxyError, Result};
use crate::protocol::mysql::packet::conn::PacketConn;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};

pub const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\x00\r\nQUIT\n";

/// v1 text preambles are at most 107 bytes including CRLF.
const V1_MAX_HEADER_LEN: usize = 107;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

/// Consumes one preamble from the connection. `Ok(None)` means the preamble
/// was well-formed but carries no usable address (v1 `UNKNOWN`, v2 `LOCAL`
/// health checks, non-INET families); the socket address stays authoritative.
pub async fn read_proxy_header<S>(conn: &mut PacketConn<S>) -> Result<Option<ProxyHeader>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = conn.peek_exact(1).await?[0];
    match first {
        b'\r' => read_v2(conn).await,
        b'P' => read_v1(conn).await,
        other => Err(ProxyError::Protocol(format!(
            "expected PROXY protocol preamble, got leading byte {other:#04x}"
        ))),
    }
}

fn malformed(what: &str) -> ProxyError {
    ProxyError::Protocol(format!("malformed PROXY protocol preamble: {what}"))
}

async fn read_v1<S>(conn: &mut PacketConn<S>) -> Result<Option<ProxyHeader>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line_len = loop {
        if let Some(pos) = conn
            .buffered_slice()
            .windows(2)
            .position(|w| w == b"\r\n")
        {
            break pos;
        }
        if conn.buffered() > V1_MAX_HEADER_LEN {
            return Err(malformed("v1 line exceeds 107 bytes"));
        }
        if conn.fill_some().await? == 0 {
            return Err(ProxyError::ReadConn(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside PROXY protocol preamble",
            )));
        }
    };
    let line = conn.buffered_slice()[..line_len].to_vec();
    conn.consume(line_len + 2);

    let text = std::str::from_utf8(&line).map_err(|_| malformed("v1 line is not ascii"))?;
    let mut fields = text.split(' ');
    if fields.next() != Some("PROXY") {
        return Err(malformed("missing PROXY magic"));
    }
    match fields.next() {
        Some("TCP4") | Some("TCP6") => {
            let mut next_field = |what: &str| fields.next().ok_or_else(|| malformed(what));
            let src_ip: IpAddr = next_field("source address")?
                .parse()
                .map_err(|_| malformed("source address"))?;
            let dst_ip: IpAddr = next_field("destination address")?
                .parse()
                .map_err(|_| malformed("destination address"))?;
            let src_port: u16 = next_field("source port")?
                .parse()
                .map_err(|_| malformed("source port"))?;
            let dst_port: u16 = next_field("destination port")?
                .parse()
                .map_err(|_| malformed("destination port"))?;
            Ok(Some(ProxyHeader {
                source: SocketAddr::new(src_ip, src_port),
                destination: SocketAddr::new(dst_ip, dst_port),
            }))
        }
        Some("UNKNOWN") => Ok(None),
        _ => Err(malformed("unsupported v1 protocol family")),
    }
}

async fn read_v2<S>(conn: &mut PacketConn<S>) -> Result<Option<ProxyHeader>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let fixed = conn.peek_exact(16).await?;
    if fixed[..12] != V2_SIGNATURE {
        return Err(malformed("bad v2 signature"));
    }
    let ver_cmd = fixed[12];
    let family = fixed[13];
    let len = u16::from_be_bytes([fixed[14], fixed[15]]) as usize;
    if ver_cmd >> 4 != 0x2 {
        return Err(malformed("bad v2 version"));
    }

    let frame = conn.peek_exact(16 + len).await?.to_vec();
    conn.consume(16 + len);

    match ver_cmd & 0x0f {
        // LOCAL: the sender connected on its own behalf
        0x0 => return Ok(None),
        0x1 => {}
        _ => return Err(malformed("bad v2 command")),
    }

    let addrs = &frame[16..];
    match family >> 4 {
        // AF_INET: src4 dst4 sport dport
        0x1 => {
            if addrs.len() < 12 {
                return Err(malformed("short v2 INET address block"));
            }
            let src_ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let dst_ip = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
            let src_port = u16::from_be_bytes([addrs[8], addrs[9]]);
            let dst_port = u16::from_be_bytes([addrs[10], addrs[11]]);
            Ok(Some(ProxyHeader {
                source: SocketAddr::new(IpAddr::V4(src_ip), src_port),
                destination: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            }))
        }
        // AF_INET6: src16 dst16 sport dport
        0x2 => {
            if addrs.len() < 36 {
                return Err(malformed("short v2 INET6 address block"));
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&addrs[..16]);
            dst.copy_from_slice(&addrs[16..32]);
            let src_port = u16::from_be_bytes([addrs[32], addrs[33]]);
            let dst_port = u16::from_be_bytes([addrs[34], addrs[35]]);
            Ok(Some(ProxyHeader {
                source: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
                destination: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
            }))
        }
        // AF_UNSPEC / AF_UNIX: no usable address
        _ => Ok(None),
    }
}
