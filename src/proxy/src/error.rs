use std::io;

use thiserror::Error;

/// Error vocabulary of the proxy core.
///
/// Transport-level variants keep the underlying [`io::Error`] as a source so
/// the outermost message stays user-facing while the chain carries the
/// diagnostic detail.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to read from connection")]
    ReadConn(#[source] io::Error),
    #[error("failed to write to connection")]
    WriteConn(#[source] io::Error),
    #[error("failed to flush connection")]
    FlushConn(#[source] io::Error),
    #[error("failed to close connection")]
    CloseConn(#[source] io::Error),
    #[error("packet sequence out of order: got {got}, expected {expected}")]
    InvalidSequence { got: u8, expected: u8 },
    #[error("tls handshake failed")]
    Tls(#[source] io::Error),
    #[error("failed to connect to backend {addr}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("auth plugin {0:?} is not accepted for session reattach")]
    AuthPluginUnsupported(String),
    #[error("redirect failed after {attempts} attempt(s)")]
    RedirectFailed { attempts: u32 },
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ProxyError {
    /// A read that was unblocked by a graceful close, as opposed to a real
    /// transport failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, ProxyError::ReadConn(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
