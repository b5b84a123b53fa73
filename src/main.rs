// src/main.rs

//! The main entry point for the etcdkeeper supervisor.

use anyhow::Result;
use etcdkeeper::config::Config;
use etcdkeeper::supervisor;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("etcdkeeper version {VERSION}");
        return Ok(());
    }

    // The configuration path can be provided via --config; otherwise it
    // defaults to "etcdkeeper.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("etcdkeeper.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = supervisor::run(config).await {
        error!("supervisor runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
