use crate::error::{ProxyError, Result};
use crate::protocol::mysql::constants::{MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};
use crate::protocol::mysql::packet::Packet;

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Notify;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long a liveness probe is allowed to sit on the socket.
const PEER_CHECK_TIMEOUT: Duration = Duration::from_millis(1);

/// OS-level TCP keepalive knobs, applied through `socket2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    pub idle: Duration,
    pub intvl: Duration,
    pub cnt: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle: Duration::from_secs(1800),
            intvl: Duration::from_secs(75),
            cnt: 9,
        }
    }
}

/// The transport under a [`PacketConn`]: plaintext at first, swapped for a
/// TLS stream when the session upgrades mid-handshake.
pub enum Transport<S> {
    Plain(S),
    ServerTls(Box<server::TlsStream<S>>),
    ClientTls(Box<client::TlsStream<S>>),
    /// Placeholder while an upgrade is in flight. Any IO on it is a bug.
    Detached,
}

impl<S> Transport<S> {
    fn socket(&self) -> Option<&S> {
        match self {
            Transport::Plain(s) => Some(s),
            Transport::ServerTls(t) => Some(t.get_ref().0),
            Transport::ClientTls(t) => Some(t.get_ref().0),
            Transport::Detached => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::ServerTls(_) | Transport::ClientTls(_))
    }
}

fn detached_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "transport detached")
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for Transport<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Detached => Poll::Ready(Err(detached_err())),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Transport<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::Detached => Poll::Ready(Err(detached_err())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Detached => Poll::Ready(Err(detached_err())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Detached => Poll::Ready(Err(detached_err())),
        }
    }
}

struct Interrupt {
    flag: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            if self.flag.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            if self.flag.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Lets a supervisor unblock a pending read on a [`PacketConn`] it does not
/// own, without tearing down the transport.
#[derive(Clone)]
pub struct InterruptHandle(Arc<Interrupt>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.trigger();
    }
}

/// A framed, buffered, sequence-tracking duplex channel carrying MySQL
/// packets over one transport connection.
///
/// Reads and writes share one sequence counter: the sequence byte in the next
/// outgoing header always equals the current value, every chunk read or
/// written advances it by one, and `reset_seq` rewinds it to 0 at a command
/// boundary. The counter is per-connection, never end-to-end, so a proxy
/// recomputes it independently on each side.
pub struct PacketConn<S> {
    transport: Transport<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
    seq: u8,
    in_bytes: u64,
    out_bytes: u64,
    interrupt: Arc<Interrupt>,
    applied_keepalive: Option<KeepaliveConfig>,
    proxy_peer: Option<SocketAddr>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            transport: Transport::Plain(stream),
            read_buf: Vec::with_capacity(READ_BUFFER_SIZE),
            read_pos: 0,
            write_buf: Vec::with_capacity(READ_BUFFER_SIZE),
            seq: 0,
            in_bytes: 0,
            out_bytes: 0,
            interrupt: Arc::new(Interrupt::new()),
            applied_keepalive: None,
            proxy_peer: None,
        }
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn in_bytes(&self) -> u64 {
        self.in_bytes
    }

    pub fn out_bytes(&self) -> u64 {
        self.out_bytes
    }

    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Effective client address decoded from a PROXY protocol preamble, when
    /// one was consumed on this connection.
    pub fn proxy_peer(&self) -> Option<SocketAddr> {
        self.proxy_peer
    }

    pub fn set_proxy_peer(&mut self, peer: SocketAddr) {
        self.proxy_peer = Some(peer);
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupt))
    }

    /// Unblocks any in-flight read promptly without closing the transport.
    pub fn graceful_close(&self) {
        self.interrupt.trigger();
    }

    pub(crate) fn buffered(&self) -> usize {
        self.read_buf.len() - self.read_pos
    }

    pub(crate) fn buffered_slice(&self) -> &[u8] {
        &self.read_buf[self.read_pos..]
    }

    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.read_pos += n;
    }

    /// One buffered read from the transport. Returns 0 on EOF. Cancel safe:
    /// `read_buf` only grows by what was actually received.
    pub(crate) async fn fill_some(&mut self) -> Result<usize> {
        if self.read_pos == self.read_buf.len() {
            self.read_buf.clear();
            self.read_pos = 0;
        }
        self.read_buf.reserve(READ_BUFFER_SIZE);
        let read = tokio::select! {
            biased;
            _ = self.interrupt.wait() => {
                return Err(ProxyError::ReadConn(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "read interrupted by graceful close",
                )));
            }
            read = self.transport.read_buf(&mut self.read_buf) => {
                read.map_err(ProxyError::ReadConn)?
            }
        };
        self.in_bytes += read as u64;
        Ok(read)
    }

    /// Buffers until `n` bytes are available and returns them without
    /// consuming.
    pub(crate) async fn peek_exact(&mut self, n: usize) -> Result<&[u8]> {
        while self.buffered() < n {
            if self.fill_some().await? == 0 {
                return Err(ProxyError::ReadConn(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed with {} unhandled bytes", self.buffered()),
                )));
            }
        }
        Ok(&self.read_buf[self.read_pos..self.read_pos + n])
    }

    /// Reads the next logical payload. `Ok(None)` means the peer closed the
    /// connection cleanly at a packet boundary.
    ///
    /// A sequence byte that does not match the locally expected value is
    /// unrecoverable: the peers have desynchronized and the caller must close
    /// this channel.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.buffered() == 0 && self.fill_some().await? == 0 {
            return Ok(None);
        }
        let mut payload = Vec::new();
        loop {
            let (len, seq) = {
                let header = self.peek_exact(PACKET_HEADER_LEN).await?;
                (LittleEndian::read_u24(header) as usize, header[3])
            };
            if seq != self.seq {
                return Err(ProxyError::InvalidSequence {
                    got: seq,
                    expected: self.seq,
                });
            }
            // Buffer the whole frame before consuming anything so a caller
            // cancelling this future at an await point never loses framing.
            let frame = self.peek_exact(PACKET_HEADER_LEN + len).await?;
            payload.extend_from_slice(&frame[PACKET_HEADER_LEN..]);
            self.consume(PACKET_HEADER_LEN + len);
            self.seq = self.seq.wrapping_add(1);
            if len < MAX_PAYLOAD_LEN {
                return Ok(Some(Packet::from_vec(payload)));
            }
        }
    }

    /// Like [`read_packet`](Self::read_packet) but a clean close is an error;
    /// used wherever the dialog still expects a reply.
    pub async fn must_read_packet(&mut self) -> Result<Packet> {
        self.read_packet().await?.ok_or_else(|| {
            ProxyError::ReadConn(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "peer terminated connection",
            ))
        })
    }

    /// Frames and emits one payload, splitting at the `MAX_PAYLOAD_LEN`
    /// boundary. A payload whose length is an exact multiple of
    /// `MAX_PAYLOAD_LEN` (the empty payload included) gets a zero-length
    /// trailer so the peer can detect termination.
    pub async fn write_packet(&mut self, payload: &[u8], flush: bool) -> Result<()> {
        let mut rest = payload;
        loop {
            let chunk_len = rest.len().min(MAX_PAYLOAD_LEN);
            let mut header = [0u8; PACKET_HEADER_LEN];
            LittleEndian::write_u24(&mut header, chunk_len as u32);
            header[3] = self.seq;
            self.seq = self.seq.wrapping_add(1);
            self.write_buf.extend_from_slice(&header);
            self.write_buf.extend_from_slice(&rest[..chunk_len]);
            rest = &rest[chunk_len..];
            if chunk_len < MAX_PAYLOAD_LEN {
                break;
            }
        }
        if flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Drains the write buffer to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            let buf = std::mem::take(&mut self.write_buf);
            self.transport
                .write_all(&buf)
                .await
                .map_err(ProxyError::WriteConn)?;
            self.out_bytes += buf.len() as u64;
        }
        self.transport.flush().await.map_err(ProxyError::FlushConn)
    }

    /// Writes straight to the transport, bypassing MySQL framing. Only for
    /// bytes that must not be interleaved with packets (PROXY preamble).
    pub async fn direct_write(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport
            .write_all(bytes)
            .await
            .map_err(ProxyError::WriteConn)?;
        self.transport.flush().await.map_err(ProxyError::FlushConn)?;
        self.out_bytes += bytes.len() as u64;
        Ok(())
    }

    /// Non-destructive liveness probe: costs up to 1 ms, never consumes
    /// payload bytes (anything received is stashed in the read buffer).
    /// A hint only, not a correctness input.
    pub async fn is_peer_active(&mut self) -> bool {
        if self.buffered() > 0 {
            return true;
        }
        match tokio::time::timeout(PEER_CHECK_TIMEOUT, self.fill_some()).await {
            // deadline expired with no data: idle but open
            Err(_elapsed) => true,
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
        }
    }

    /// Performs the TLS handshake in place, server role. The write buffer is
    /// flushed first; the read buffer must be empty (the peer speaks TLS
    /// next, not MySQL framing).
    pub async fn upgrade_tls_server(&mut self, config: Arc<ServerConfig>) -> Result<()> {
        self.pre_upgrade_check().await?;
        match std::mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Plain(stream) => {
                let tls = TlsAcceptor::from(config)
                    .accept(stream)
                    .await
                    .map_err(ProxyError::Tls)?;
                self.transport = Transport::ServerTls(Box::new(tls));
                Ok(())
            }
            other => {
                self.transport = other;
                Err(ProxyError::Tls(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "tls already negotiated on this connection",
                )))
            }
        }
    }

    /// Performs the TLS handshake in place, client role.
    pub async fn upgrade_tls_client(
        &mut self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        self.pre_upgrade_check().await?;
        match std::mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Plain(stream) => {
                let tls = TlsConnector::from(config)
                    .connect(server_name, stream)
                    .await
                    .map_err(ProxyError::Tls)?;
                self.transport = Transport::ClientTls(Box::new(tls));
                Ok(())
            }
            other => {
                self.transport = other;
                Err(ProxyError::Tls(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "tls already negotiated on this connection",
                )))
            }
        }
    }

    async fn pre_upgrade_check(&mut self) -> Result<()> {
        if self.buffered() != 0 {
            return Err(ProxyError::Tls(io::Error::new(
                io::ErrorKind::InvalidData,
                "unread plaintext bytes pending before tls upgrade",
            )));
        }
        self.flush().await
    }

    /// Closes the transport; all errors on the way out are collected under
    /// the close error.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            let buf = std::mem::take(&mut self.write_buf);
            self.transport
                .write_all(&buf)
                .await
                .map_err(ProxyError::CloseConn)?;
            self.out_bytes += buf.len() as u64;
        }
        self.transport
            .shutdown()
            .await
            .map_err(ProxyError::CloseConn)
    }

    /// Applies OS keepalive settings. Idempotent: reapplying the last config
    /// is a no-op.
    pub fn set_keepalive(&mut self, cfg: &KeepaliveConfig) -> io::Result<()>
    where
        S: AsFd,
    {
        if self.applied_keepalive.as_ref() == Some(cfg) {
            return Ok(());
        }
        let sock = self
            .transport
            .socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport detached"))?;
        let sock_ref = socket2::SockRef::from(sock);
        if cfg.enabled {
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(cfg.idle)
                .with_interval(cfg.intvl)
                .with_retries(cfg.cnt);
            sock_ref.set_tcp_keepalive(&keepalive)?;
            sock_ref.set_keepalive(true)?;
        } else {
            sock_ref.set_keepalive(false)?;
        }
        self.applied_keepalive = Some(*cfg);
        Ok(())
    }
}
