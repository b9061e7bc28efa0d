//! SSH Honeypot - an interactive-shell SSH honeypot
//!
//! Accepts any password, emulates a minimal shell and records:
//! - Every authentication attempt (passwords and public keys)
//! - Every command typed into the fake shell
//! - URLs and IP paths found in commands, queued for download

mod cli;
mod config;
mod db;
mod handlers;
mod logging;
mod session;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();
    let config = config::Config::load(&cli)?;
    logging::init(&config.logging)?;

    info!("Starting SSH honeypot...");
    let config = Arc::new(config);

    // Initialize the download queue
    let db = db::Database::new(&config.queue).await?;
    db.run_migrations().await?;
    let pending = db.pending_count().await?;
    info!(channel = db.channel(), pending, "Download queue initialized");
    let (queue, writer) = db::write_buffer::start_write_buffer(Arc::new(db));

    let services = session::SessionServices::new(config.clone(), Arc::new(queue))?;

    tokio::select! {
        result = handlers::start(config, services) => {
            if let Err(e) = &result {
                error!("SSH handler failed: {:#}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    // Live sessions still hold senders; one flush interval is enough for the last batch
    let _ = tokio::time::timeout(std::time::Duration::from_millis(500), writer).await;
    Ok(())
}
