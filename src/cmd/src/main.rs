use clap::Parser;
use proxy::backend::{StaticSelector, StaticTokenIssuer};
use proxy::server::orchestrator::{OrchestratorOptions, SessionOrchestrator};
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::server::ShutdownMessage;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("ProxySrv receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg = format!("ProxySrv receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn main() -> anyhow::Result<()> {
    let proxy_config = ProxyServerArgs::parse();
    let log_level_string = proxy_config.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let works = proxy_config.works;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("MYBRIDGE")
        .worker_threads(works)
        .build()?;

    info!("ProxySrv running config args={:?}", proxy_config);
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    runtime.block_on(async {
        let selector = Arc::new(StaticSelector::new(proxy_config.static_backend_list()));
        let issuer = Arc::new(StaticTokenIssuer::default());
        let options = OrchestratorOptions {
            frontend_tls: proxy_config.frontend_tls()?,
            keepalive: proxy_config.keepalive_config(),
            redirect_retries: proxy_config.redirect_retries,
            expect_proxy_header: proxy_config.proxy_protocol,
            ..OrchestratorOptions::default()
        };

        let port = proxy_config.port;
        let tcp_listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        info!("ProxySrv listening on 0.0.0.0:{port}");
        let conn_id = AtomicU64::new(0);
        loop {
            tokio::select! {
                shutdown_msg = shutdown_signal() => {
                    let _ = shutdown_tx.send(shutdown_msg);
                    break;
                }
                rs = tcp_listener.accept() => {
                    match rs {
                        Ok((stream, peer_addr)) => {
                            let _ = stream.set_nodelay(true);
                            let new_id = conn_id.fetch_add(1, Ordering::Relaxed);
                            let selector = Arc::clone(&selector);
                            let issuer = Arc::clone(&issuer);
                            let options = options.clone();
                            let shutdown_rx = shutdown_rx.clone();
                            tokio::spawn(async move {
                                let connected = SessionOrchestrator::connect(
                                    new_id,
                                    stream,
                                    selector,
                                    issuer,
                                    options,
                                    shutdown_rx,
                                )
                                .await;
                                match connected {
                                    Ok((orchestrator, _redirect)) => {
                                        if let Err(e) = orchestrator.run().await {
                                            warn!(conn_id = new_id, client = %peer_addr, error = %e, "session ended with error");
                                        }
                                    }
                                    Err(e) => {
                                        warn!(conn_id = new_id, client = %peer_addr, error = %e, "session setup failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!("ProxySrv accept connection err. cause by {e:?}");
                        }
                    }
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
