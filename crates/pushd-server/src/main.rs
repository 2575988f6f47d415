use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pushd_server::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "pushd", about = "push notification broker")]
struct Args {
    /// Path to the JSON config file (falls back to PUSHD_CONFIG, then
    /// ./config.json).
    #[arg(long, default_value = "")]
    config: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let debug = args.debug || env_true("PUSHD_DEBUG");
    init_logging(debug);

    let config_path = resolve_config_path(&args.config);
    let config = match ServerConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_error", path = %config_path.display(), error = %err);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (addr, mut serve_task) = match pushd_server::start(config, shutdown_rx).await {
        Ok(started) => started,
        Err(err) => {
            error!(event = "bind_error", error = %err);
            std::process::exit(1);
        }
    };
    info!(event = "server_start", addr = %addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(event = "shutdown_signal");
            let _ = shutdown_tx.send(true);
            let _ = serve_task.await;
        }
        result = &mut serve_task => {
            if let Err(err) = result {
                error!(event = "server_task_failed", error = %err);
            }
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_config_path(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var("PUSHD_CONFIG") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    PathBuf::from("config.json")
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
