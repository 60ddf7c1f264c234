use crate::error::{ProxyError, Result};
use crate::log_err_packet;
use crate::protocol::mysql::basic::{eof_server_status, ok_packet, read_length_encoded_number};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::conn::PacketConn;
use crate::protocol::mysql::packet::Packet;
use crate::server::forwarder::{copy_packet, ComForwarder};
use crate::server::session::SessionState;

use async_trait::async_trait;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use tokio::io::{AsyncRead, AsyncWrite};

/// Response forwarding for the text protocol and the statement execution
/// path: OK/ERR, result sets (both EOF dialects, cursors, multi-resultset)
/// and the `LOCAL INFILE` sub-dialog.
pub struct QueryForwarder {
    pub com_code: CommandCode,
}

impl QueryForwarder {
    async fn forward_query<C, B>(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        capabilities: CapabilityFlags,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        loop {
            let response_pkt = copy_packet(backend, client, false).await?;
            let status_flags = if response_pkt.is_ok_packet() {
                client.flush().await?;
                let (_, ok_pkt) = ok_packet(&response_pkt, capabilities)
                    .map_err(|e| ProxyError::Protocol(format!("malformed OK packet: {e:?}")))?;
                ok_pkt.status_flags
            } else if response_pkt.is_err_packet() {
                log_err_packet!(capabilities, response_pkt, "forward_query ERR");
                client.flush().await?;
                return Ok(());
            } else if response_pkt.is_local_in_file_packet() {
                self.forward_local_infile(client, backend, capabilities)
                    .await?
            } else {
                self.forward_result_set(&response_pkt, client, backend, capabilities)
                    .await?
            };
            if !status_flags.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
                break;
            }
        }
        Ok(())
    }

    /// The column-count packet has already been forwarded; streams column
    /// definitions and rows through to the terminator.
    async fn forward_result_set<C, B>(
        &self,
        column_count_pkt: &Packet,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        capabilities: CapabilityFlags,
    ) -> Result<StatusFlags>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (input, metadata_follows) =
            if capabilities.contains(CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA) {
                (&column_count_pkt[1..], column_count_pkt[0] == 1)
            } else {
                (&column_count_pkt[..], true)
            };
        let (_, column_count) = read_length_encoded_number(input)
            .map_err(|e| ProxyError::Protocol(format!("malformed column count: {e:?}")))?;

        if metadata_follows {
            for _ in 0..column_count {
                copy_packet(backend, client, false).await?;
            }
        }
        let client_deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
        if !client_deprecate_eof && metadata_follows {
            let eof_pkt = copy_packet(backend, client, false).await?;
            if !eof_pkt.is_eof_packet() {
                return Err(ProxyError::Protocol(
                    "missing EOF after column definitions".to_string(),
                ));
            }
            let (_, status_flags) = eof_server_status(&eof_pkt)
                .map_err(|e| ProxyError::Protocol(format!("malformed EOF packet: {e:?}")))?;
            // rows arrive via COM_STMT_FETCH, not inline
            if status_flags.contains(StatusFlags::SERVER_STATUS_CURSOR_EXISTS) {
                client.flush().await?;
                return Ok(status_flags);
            }
        }
        self.forward_until_result_end(client, backend, capabilities)
            .await
    }

    async fn forward_until_result_end<C, B>(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        capabilities: CapabilityFlags,
    ) -> Result<StatusFlags>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let client_deprecate_eof = capabilities.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
        loop {
            let response_pkt = copy_packet(backend, client, false).await?;

            if response_pkt.is_err_packet() {
                log_err_packet!(capabilities, response_pkt, "forward_until_result_end ERR");
                client.flush().await?;
                break;
            }
            if !client_deprecate_eof {
                if response_pkt.is_eof_packet() {
                    client.flush().await?;
                    let (_, status_flags) = eof_server_status(&response_pkt).map_err(|e| {
                        ProxyError::Protocol(format!("malformed EOF packet: {e:?}"))
                    })?;
                    return Ok(status_flags);
                }
            } else if response_pkt.is_result_set_eof_packet() {
                let (_, ok_pkt) = ok_packet(&response_pkt, capabilities)
                    .map_err(|e| ProxyError::Protocol(format!("malformed OK packet: {e:?}")))?;
                client.flush().await?;
                return Ok(ok_pkt.status_flags);
            }
        }
        Ok(StatusFlags::default())
    }

    /// `LOCAL INFILE` sub-dialog: the backend's 0xFB request has already been
    /// copied toward the client. The client streams file payload packets,
    /// terminated by an empty one, then the backend settles with OK or ERR.
    async fn forward_local_infile<C, B>(
        &self,
        client: &mut PacketConn<C>,
        backend: &mut PacketConn<B>,
        capabilities: CapabilityFlags,
    ) -> Result<StatusFlags>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        B: AsyncRead + AsyncWrite + Send + Unpin,
    {
        client.flush().await?;
        loop {
            let chunk = copy_packet(client, backend, true).await?;
            if chunk.is_empty() {
                break;
            }
        }
        let terminator = copy_packet(backend, client, true).await?;
        if terminator.is_ok_packet() {
            let (_, ok_pkt) = ok_packet(&terminator, capabilities)
                .map_err(|e| ProxyError::Protocol(format!("malformed OK packet: {e:?}")))?;
            Ok(ok_pkt.status_flags)
        } else {
            if terminator.is_err_packet() {
                log_err_packet!(capabilities, terminator, "local infile ERR");
            }
            Ok(StatusFlags::default())
        }
    }
}

#[async_trait]
impl<C, B> ComForwarder<C, B> for QueryForwarder
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
        let capabilities = session.capabilities;
        match self.com_code {
            CommandCode::ComQuery | CommandCode::ComStmtExecute | CommandCode::ComProcessInfo => {
                self.forward_query(client, backend, capabilities).await?;
            }
            CommandCode::ComFieldList | CommandCode::ComStmtFetch => {
                self.forward_until_result_end(client, backend, capabilities)
                    .await?;
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "QueryForwarder cannot handle {other:?}"
                )));
            }
        }
        Ok(None)
    }
}
