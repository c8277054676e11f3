use anyhow::Result;
use clap::Parser;
use nitmproxy::{CliArgs, ListenerStore, ProxyConfig, ProxyMaster, ProxyServer};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    info!("Starting {} {}", nitmproxy::NAME, nitmproxy::VERSION);

    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_yaml_file(path)?,
        None => ProxyConfig::from_env()?,
    };
    config.apply_cli(&args)?;
    if config.insecure {
        warn!("Upstream certificate validation is disabled");
    }
    info!(
        mode = ?config.mode,
        unsafe_access = %config.unsafe_access,
        tls = ?config.tls_protocols,
        "Configuration loaded"
    );

    let master = ProxyMaster::builder(config)
        .listeners(ListenerStore::new())
        .build()?;

    ProxyServer::new(Arc::new(master))
        .run(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
