// binance-nats-bridge: bridges Binance combined WebSocket market-data
// streams onto a NATS subject for downstream consumers.

use std::path::PathBuf;

use tracing::{error, info};

use bridge::config::{BridgeConfig, ConfigError};
use bridge::{Healthy, Lifecycle, Ready, Supervisor};

const DEFAULT_CONFIG_PATH: &str = "bridge.toml";
const STOP_DEADLINE_SECS: u64 = 10;

fn load_config() -> Result<BridgeConfig, ConfigError> {
    let path = std::env::var("BRIDGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    if path.exists() {
        BridgeConfig::from_path(&path)
    } else {
        info!(path = %path.display(), "no config file found, using defaults");
        Ok(BridgeConfig::default())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "binance-nats-bridge starting");

    let cfg = match load_config() {
        Ok(cfg) => {
            info!(
                upstream_url = %cfg.upstream.url,
                subscriptions = cfg.upstream.subscriptions.len(),
                bus_subject = %cfg.bus.subject,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let supervisor = Supervisor::new(cfg);

    if let Err(e) = supervisor.start().await {
        error!(error = %e, "failed to start bridge");
        std::process::exit(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    supervisor
        .stop(std::time::Duration::from_secs(STOP_DEADLINE_SECS))
        .await;

    let exit_code = if supervisor.is_healthy() { 0 } else { 1 };
    info!(ready = supervisor.is_ready(), exit_code, "bridge stopped");
    std::process::exit(exit_code);
}
