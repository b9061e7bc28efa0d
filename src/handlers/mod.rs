//! Protocol handlers module

pub mod keys;
pub mod ssh;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::session::SessionServices;

/// Start the SSH listener; returns only on a fatal listener error.
pub async fn start(config: Arc<Config>, services: SessionServices) -> Result<()> {
    let host_key = keys::load_or_generate_host_key(&config.server.host_key_path)?;
    info!(
        banner = %config.emulation.ssh_banner,
        pseudo_commands = services.commands.entry_count(),
        "Starting SSH handler"
    );
    ssh::serve(config, services, host_key).await
}
