//! The seams through which the session core reaches the outside world:
//! backend selection and session-token issuance. Both are narrow interfaces;
//! discovery, load balancing policy and credential management live behind
//! them.

use crate::error::{ProxyError, Result};
use crate::protocol::mysql::constants::MAX_SESSION_TOKEN_LEN;
use crate::server::session::SessionState;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ClientConfig;

/// TLS policy for one backend address.
#[derive(Clone)]
pub struct BackendTls {
    pub config: Arc<ClientConfig>,
    /// Name presented for SNI and certificate verification.
    pub server_name: String,
}

/// A dialable backend plus its TLS policy.
#[derive(Clone)]
pub struct BackendAddr {
    pub addr: String,
    pub tls: Option<BackendTls>,
}

impl BackendAddr {
    pub fn plain(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
        }
    }
}

impl fmt::Debug for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendAddr")
            .field("addr", &self.addr)
            .field("tls", &self.tls.as_ref().map(|t| t.server_name.as_str()))
            .finish()
    }
}

/// Yields the next backend a session should attach to. Called once at session
/// start and again for every redirect attempt.
#[async_trait]
pub trait BackendSelector: Send + Sync {
    async fn next(&self, session: &SessionState) -> Result<BackendAddr>;
}

/// Mints and names the opaque tokens a cooperating backend accepts in place
/// of the user's credentials during reattach. The issuer guarantees the
/// backend will not answer a token handshake with an auth plugin switch.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn mint(&self, session: &SessionState) -> Result<Vec<u8>>;
    fn plugin_name(&self) -> &str;
}

/// Fixed backend list with random balancing.
pub struct StaticSelector {
    backends: VecDeque<BackendAddr>,
    rand: Mutex<StdRng>,
}

impl StaticSelector {
    pub fn new(backends: VecDeque<BackendAddr>) -> Self {
        Self {
            backends,
            rand: Mutex::new(StdRng::from_entropy()),
        }
    }
}

#[async_trait]
impl BackendSelector for StaticSelector {
    async fn next(&self, _session: &SessionState) -> Result<BackendAddr> {
        if self.backends.is_empty() {
            return Err(ProxyError::Handshake("no backend configured".to_string()));
        }
        let idx = {
            let mut rand = self.rand.lock().expect("selector rng poisoned");
            rand.gen_range(0..self.backends.len())
        };
        Ok(self.backends[idx].clone())
    }
}

pub const DEFAULT_TOKEN_PLUGIN: &str = "mybridge_session_token";

/// Locally minted random tokens. Real deployments plug in an issuer whose
/// tokens the backend fleet can verify.
pub struct StaticTokenIssuer {
    plugin_name: String,
}

impl Default for StaticTokenIssuer {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_TOKEN_PLUGIN.to_string(),
        }
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn mint(&self, _session: &SessionState) -> Result<Vec<u8>> {
        let mut token = vec![0u8; 48];
        StdRng::from_entropy().fill(token.as_mut_slice());
        debug_assert!(token.len() <= MAX_SESSION_TOKEN_LEN);
        Ok(token)
    }

    fn plugin_name(&self) -> &str {
        &self.plugin_name
    }
}

pub async fn dial(addr: &str) -> Result<TcpStream> {
    let map_err = |e| ProxyError::Dial {
        addr: addr.to_string(),
        source: e,
    };
    let stream = TcpStream::connect(addr).await.map_err(map_err)?;
    stream.set_nodelay(true).map_err(map_err)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_selector_yields_configured_backend() {
        let selector = StaticSelector::new(VecDeque::from(vec![BackendAddr::plain(
            "127.0.0.1:3306",
        )]));
        let addr = selector.next(&SessionState::default()).await.unwrap();
        assert_eq!(addr.addr, "127.0.0.1:3306");
    }

    #[tokio::test]
    async fn test_static_selector_empty_list_errors() {
        let selector = StaticSelector::new(VecDeque::new());
        assert!(selector.next(&SessionState::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_static_issuer_token_fits_limit() {
        let issuer = StaticTokenIssuer::default();
        let token = issuer.mint(&SessionState::default()).await.unwrap();
        assert!(!token.is_empty());
        assert!(token.len() <= MAX_SESSION_TOKEN_LEN);
        assert_eq!(issuer.plugin_name(), DEFAULT_TOKEN_PLUGIN);
    }
}
