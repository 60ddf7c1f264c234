use crate::backend::BackendAddr;
use crate::protocol::mysql::packet::conn::KeepaliveConfig;

use anyhow::Context;
use clap::Parser;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls::ServerConfig;

#[derive(Parser, Default, Debug, Clone)]
#[clap(
    name = "mybridge",
    version = "0.1.0",
    about = "session-migrating proxy for mysql compatible databases."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKS", default_value_t = 4)]
    pub works: usize,
    #[clap(long, value_name = "PORT", default_value_t = 3310)]
    pub port: u16,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
    /// Comma separated list of backend addresses to proxy.
    #[clap(long, value_name = "ADDR", value_delimiter = ',')]
    pub backend_addr: Vec<String>,
    #[clap(long, value_name = "RETRIES", default_value_t = 3)]
    pub redirect_retries: u32,
    #[clap(long, value_name = "CERT_PATH")]
    pub tls_cert: Option<PathBuf>,
    #[clap(long, value_name = "KEY_PATH")]
    pub tls_key: Option<PathBuf>,
    /// Expect a PROXY protocol v1/v2 preamble on accepted connections.
    #[clap(long, default_value_t = false)]
    pub proxy_protocol: bool,
    #[clap(long, default_value_t = false)]
    pub keepalive: bool,
    #[clap(long, value_name = "SECS", default_value_t = 1800)]
    pub keepalive_idle_secs: u64,
    #[clap(long, value_name = "SECS", default_value_t = 75)]
    pub keepalive_intvl_secs: u64,
    #[clap(long, value_name = "COUNT", default_value_t = 9)]
    pub keepalive_cnt: u32,
}

impl ProxyServerArgs {
    pub fn static_backend_list(&self) -> VecDeque<BackendAddr> {
        if self.backend_addr.is_empty() {
            return VecDeque::from(vec![BackendAddr::plain("127.0.0.1:3306")]);
        }
        self.backend_addr
            .iter()
            .map(|addr| BackendAddr::plain(addr.clone()))
            .collect()
    }

    pub fn keepalive_config(&self) -> Option<KeepaliveConfig> {
        self.keepalive.then(|| KeepaliveConfig {
            enabled: true,
            idle: Duration::from_secs(self.keepalive_idle_secs),
            intvl: Duration::from_secs(self.keepalive_intvl_secs),
            cnt: self.keepalive_cnt,
        })
    }

    pub fn frontend_tls(&self) -> anyhow::Result<Option<Arc<ServerConfig>>> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some(load_server_tls(cert, key)?)),
            (None, None) => Ok(None),
            _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
        }
    }
}

pub fn load_server_tls(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("reading tls certificate from '{}'", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("parsing tls certificate '{}'", cert_path.display()))?;
    let key_file = File::open(key_path)
        .with_context(|| format!("reading tls private key from '{}'", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("parsing tls private key '{}'", key_path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in '{}'", key_path.display()))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building tls server config")?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_list_defaults_to_localhost() {
        let args = ProxyServerArgs::default();
        let backends = args.static_backend_list();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].addr, "127.0.0.1:3306");
    }

    #[test]
    fn test_backend_list_from_args() {
        let args = ProxyServerArgs {
            backend_addr: vec!["10.0.0.1:3306".to_string(), "10.0.0.2:3306".to_string()],
            ..ProxyServerArgs::default()
        };
        let backends = args.static_backend_list();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[1].addr, "10.0.0.2:3306");
    }

    #[test]
    fn test_keepalive_config_disabled_by_default() {
        assert!(ProxyServerArgs::default().keepalive_config().is_none());
        let args = ProxyServerArgs {
            keepalive: true,
            keepalive_idle_secs: 60,
            keepalive_intvl_secs: 10,
            keepalive_cnt: 3,
            ..ProxyServerArgs::default()
        };
        let cfg = args.keepalive_config().unwrap();
        assert_eq!(cfg.idle, Duration::from_secs(60));
        assert_eq!(cfg.cnt, 3);
    }

    #[test]
    fn test_tls_args_must_pair() {
        let args = ProxyServerArgs {
            tls_cert: Some(PathBuf::from("/tmp/cert.pem")),
            ..ProxyServerArgs::default()
        };
        assert!(args.frontend_tls().is_err());
    }
}
