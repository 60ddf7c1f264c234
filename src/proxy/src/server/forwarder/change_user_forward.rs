use crate::error::{ProxyError, Result};
use crate::log_err_packet;
use crate::protocol::mysql::packet::conn::PacketConn;
use crate::protocol::mysql::packet::Packet;
use crate::server::forwarder::{copy_packet, ComForwarder};
use crate::server::session::SessionState;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// `COM_CHANGE_USER` re-runs a trimmed authentication dialog over the live
/// connection: the backend may ask the client to switch plugins and to
/// answer auth-more-data rounds before settling with OK or ERR. The OK is
/// handed back so the orchestrator can update its shadow state.
pub struct ChangeUserForwarder;

#[async_trait]
impl<C, B> ComForwarder<C, B> for ChangeUserForwarder
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
        loop {
            let response_pkt = copy_packet(backend, client, true).await?;

            if response_pkt.is_err_packet() {
                log_err_packet!(session.capabilities, response_pkt, "change_user ERR");
                return Err(ProxyError::Handshake(
                    "backend rejected COM_CHANGE_USER".to_string(),
                ));
            }
            if response_pkt.is_ok_packet() {
                return Ok(Some(response_pkt));
            }
            // caching_sha2 fast-auth marker precedes the OK with no client turn
            if response_pkt.is_auth_more_data_packet()
                && response_pkt.len() == 2
                && response_pkt[1] == 0x03
            {
                continue;
            }
            // plugin switch or more-data challenge: the client answers
            let client_pkt = copy_packet(client, backend, true).await?;
            if client_pkt.is_err_packet() {
                log_err_packet!(session.capabilities, client_pkt, "change_user client ERR");
                return Err(ProxyError::Handshake(
                    "client aborted COM_CHANGE_USER".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_change_user_auth_switch_ping_pong() {
        let (client_end, proxy_client_end) = duplex(16 * 1024);
        let (backend_end, proxy_backend_end) = duplex(16 * 1024);
        let mut client = PacketConn::new(proxy_client_end);
        let mut backend = PacketConn::new(proxy_backend_end);
        let mut fake_client = PacketConn::new(client_end);
        let mut fake_backend = PacketConn::new(backend_end);
        client.set_seq(1);
        backend.set_seq(1);
        fake_client.set_seq(1);
        fake_backend.set_seq(1);

        let backend_task = tokio::spawn(async move {
            let mut switch = vec![0xfe];
            switch.extend_from_slice(b"mysql_native_password\0");
            switch.extend_from_slice(b"aaaaaaaaaaaaaaaaaaaa\0");
            fake_backend.write_packet(&switch, true).await.unwrap();
            let signed = fake_backend.must_read_packet().await.unwrap();
            assert_eq!(&*signed, &[0x33; 20]);
            fake_backend
                .write_packet(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00], true)
                .await
                .unwrap();
        });

        let client_task = tokio::spawn(async move {
            let switch = fake_client.must_read_packet().await.unwrap();
            assert_eq!(switch[0], 0xfe);
            fake_client.write_packet(&[0x33; 20], true).await.unwrap();
            let ok = fake_client.must_read_packet().await.unwrap();
            assert!(ok.is_ok_packet());
        });

        let session = SessionState::default();
        let ok = ChangeUserForwarder
            .forward(&mut client, &mut backend, &session)
            .await
            .unwrap()
            .unwrap();
        assert!(ok.is_ok_packet());
        assert_eq!(client.seq(), backend.seq());
        backend_task.await.unwrap();
        client_task.await.unwrap();
    }
}
