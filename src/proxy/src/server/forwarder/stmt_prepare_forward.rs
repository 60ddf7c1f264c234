use crate::error::{ProxyError, Result};
use crate::log_err_packet;
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::conn::PacketConn;
use crate::protocol::mysql::packet::Packet;
use crate::server::forwarder::{copy_packet, ComForwarder};
use crate::server::session::SessionState;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use mysql_common::constants::CapabilityFlags;
use tokio::io::{AsyncRead, AsyncWrite};

/// `COM_STMT_PREPARE` responses carry a fixed packet count derived from the
/// prepare-OK header, so the response is forwarded by counting rather than
/// by scanning for a terminator. `COM_STMT_CLOSE` has no response at all.
pub struct StmtPrepareForwarder {
    pub com_code: CommandCode,
    pub request: Packet,
}

impl StmtPrepareForwarder {
    async fn forward_prepare_stmt<C, B>(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        capabilities: CapabilityFlags,
    ) -> Result<Option<Packet>>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let response_pkt = copy_packet(backend, client, false).await?;
        let is_client_deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
        if response_pkt.is_err_packet() {
            log_err_packet!(capabilities, response_pkt, "stmt_prepare_forward ERR");
            client.flush().await?;
            Ok(None)
        } else if response_pkt.is_ok_packet() {
            if response_pkt.len() < 9 {
                return Err(ProxyError::Protocol(
                    "short COM_STMT_PREPARE_OK packet".to_string(),
                ));
            }
            let columns = LittleEndian::read_u16(&response_pkt[5..]);
            let params = LittleEndian::read_u16(&response_pkt[7..]);
            let mut expected_packets = columns + params;
            if !is_client_deprecate_eof {
                if columns > 0 {
                    expected_packets += 1;
                }
                if params > 0 {
                    expected_packets += 1;
                }
            }
            for _ in 0..expected_packets {
                copy_packet(backend, client, false).await?;
            }
            client.flush().await?;
            Ok(None)
        } else {
            Err(ProxyError::Protocol(format!(
                "unexpected COM_STMT_PREPARE response tag {:#04x}",
                response_pkt.first().copied().unwrap_or(0)
            )))
        }
    }

    fn forward_close_stmt(&self) -> Result<Option<Packet>> {
        // no response packet is expected
        let _stmt_id = LittleEndian::read_u32(&self.request[1..5]);
        Ok(None)
    }
}

#[async_trait]
impl<C, B> ComForwarder<C, B> for StmtPrepareForwarder
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn forward(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        session: &SessionState,
    ) -> Result<Option<Packet>> {
        match self.com_code {
            CommandCode::ComStmtPrepare => {
                self.forward_prepare_stmt(client, backend, session.capabilities)
                    .await
            }
            CommandCode::ComStmtClose => self.forward_close_stmt(),
            other => Err(ProxyError::Protocol(format!(
                "StmtPrepareForwarder cannot handle {other:?}"
            ))),
        }
    }
}
