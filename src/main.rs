//! tunnelpool - Entry Point
//!
//! Starts the CONNECT front door with graceful shutdown support.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunnelpool::config::LogConfig;
use tunnelpool::proxy::{ProxyServer, Upstream};
use tunnelpool::{tls, Config, EphemeralCa, ServerPool, TunnelingAgent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    init_tracing(&config.log);

    info!("Starting tunnelpool");

    let ca = Arc::new(EphemeralCa::generate().context("generating interception CA")?);
    info!("Interception CA ready; trust this certificate:\n{}", ca.cert_pem());

    let upstream = match &config.upstream {
        Some(upstream) => {
            let agent = TunnelingAgent::new(
                upstream.tunnel_kind(),
                upstream.agent_options(&config.agent),
            )
            .context("creating tunneling agent")?;
            info!(
                "Forwarding through upstream proxy {}:{} ({:?})",
                upstream.host,
                upstream.port,
                agent.kind()
            );
            Upstream::Tunnel(agent)
        }
        None => {
            let roots = Arc::new(tls::native_roots().context("loading platform roots")?);
            let connector = tls::connector_for(roots, &Default::default())?;
            info!("Forwarding directly to origins");
            Upstream::Direct(connector)
        }
    };

    let pool = ServerPool::new(config.servers.clone(), ca);
    let proxy_server = ProxyServer::new(config.proxy.clone(), pool.clone(), upstream);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Proxy listening on {}", config.proxy_addr());

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;
    pool.destroy();
    tokio::time::sleep(config.servers.close_delay).await;

    info!("tunnelpool stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tunnelpool={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
