pub mod change_user_forward;
pub mod query_forward;
pub mod stmt_prepare_forward;

use crate::error::Result;
use crate::protocol::mysql::packet::conn::PacketConn;
use crate::protocol::mysql::packet::Packet;
use crate::server::session::SessionState;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Reads one packet from `src` and replays it on `dest` under `dest`'s own
/// sequence counter. Both counters advance by the same amount because the
/// payload length is identical, which is what keeps the two sides of a
/// session in lockstep.
pub(crate) async fn copy_packet<S, D>(
    src: &mut PacketConn<S>,
    dest: &mut PacketConn<D>,
    flush: bool,
) -> Result<Packet>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
    D: AsyncRead + AsyncWrite + Send + Unpin,
{
    let pkt = src.must_read_packet().await?;
    dest.write_packet(&pkt, flush).await?;
    Ok(pkt)
}

/// Forwarding logic for one command's response dialog. The command packet
/// itself has already been written to the backend when `forward` runs.
#[async_trait]
pub trait ComForwarder<C, B>: Send + Sync
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn forward(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        session: &SessionState,
    ) -> Result<Option<Packet>>;
}

/// Single-packet responses (COM_PING and friends).
pub(crate) struct GenericComForwarder;

#[async_trait]
impl<C, B> ComForwarder<C, B> for GenericComForwarder
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn forward(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        _session: &SessionState,
    ) -> Result<Option<Packet>> {
        copy_packet(backend, client, true).await.map(Some)
    }
}
