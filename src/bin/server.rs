//! Voting server binary
//!
//! Reads its configuration from the environment, logs to the configured
//! file, opens the TLS websocket port, and runs the session orchestrator
//! until killed. Every run is from scratch; there is no persisted state.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ovnet::{tls, ServerConfig, VoteServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    init_logging(&config.logfile_path)?;
    println!("SERVER IS ALIVE");
    info!("server is alive");

    let acceptor = tls::server_acceptor(&config.cert_path, &config.key_path)?;
    info!(
        hostname = %config.hostname,
        port = config.port,
        "TLS context established; opening public port"
    );
    let listener = TcpListener::bind((config.hostname.as_str(), config.port))
        .await
        .with_context(|| format!("bind {}:{}", config.hostname, config.port))?;

    let server = VoteServer::new(config.question, config.participants);
    server.serve(listener, Some(acceptor)).await?;
    Ok(())
}

fn init_logging(path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("create log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
