//! Hearth Daemon
//!
//! Exposes the hub's local web interface through the MyHearth relay:
//! opens an outbound TLS tunnel, authenticates with the stored
//! credentials, and serves proxied web requests until shut down.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use hearth_daemon::bridge::LocalWebBridge;
use hearth_daemon::storage::Database;
use hearth_daemon::tunnel::{CredentialsLock, TunnelConfig, TunnelManager};

#[derive(Parser, Debug)]
#[command(name = "hearth-daemon")]
#[command(version, about = "Hearth daemon - remote access tunnel for the hub web interface")]
struct Args {
    /// Database file path
    #[arg(long, env = "HEARTH_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Base URL of the hub's local web interface
    #[arg(long, default_value = "http://127.0.0.1:8080", env = "HEARTH_WEB_URL")]
    web_url: String,

    /// Relay hostname
    #[arg(long, default_value = "relay.myhearth.io", env = "HEARTH_RELAY_HOST")]
    relay_host: String,

    /// Relay TCP port
    #[arg(long, default_value_t = 9999, env = "HEARTH_RELAY_PORT")]
    relay_port: u16,

    /// Path to a CA certificate (PEM) to verify the relay against.
    /// When unset, the relay certificate is accepted without validation.
    #[arg(long, env = "HEARTH_RELAY_CA_CERT")]
    relay_ca_cert: Option<PathBuf>,

    /// Bitmask of relay subsystems this daemon serves
    #[arg(long, default_value_t = hearth_proto::SUBSYSTEM_HTTP, env = "HEARTH_SUBSYSTEMS")]
    subsystems: u32,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "HEARTH_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "HEARTH_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("hearth_daemon={}", args.log_level);
    hearth_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        relay = %format!("{}:{}", args.relay_host, args.relay_port),
        "Starting hearth-daemon"
    );

    let db = if let Some(path) = &args.db_path {
        info!(path = %path.display(), "Opening database");
        Database::open(path).await?
    } else {
        let default_path = default_db_path()?;
        info!(path = %default_path.display(), "Opening database (default path)");
        Database::open(&default_path).await?
    };

    let bridge = Arc::new(LocalWebBridge::new(&args.web_url)?);

    let mut config = TunnelConfig::new(
        args.relay_host,
        args.relay_port,
        env!("CARGO_PKG_VERSION").to_string(),
    );
    config.allowed_subsystems = args.subsystems;
    if args.relay_ca_cert.is_some() {
        config.relay_ca_cert = args.relay_ca_cert;
        config.insecure_skip_verify = false;
    }

    let mut manager = TunnelManager::new(config, db, bridge, CredentialsLock::default());
    manager.start().await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    manager.stop().await;
    info!("Daemon stopped");
    Ok(())
}

/// Default database path: ~/.hearth/hearth.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".hearth").join("hearth.db"))
}
