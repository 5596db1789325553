//! Server command: `berth serve`.

use std::path::Path;

use anyhow::{Result, bail};
use berth::config::BerthConfig;
use tracing::warn;

pub async fn cmd_serve(
    config_path: &Path,
    bind: Option<String>,
    dev: bool,
    verbose: bool,
) -> Result<()> {
    let mut config = BerthConfig::load_with_env(config_path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    // Held until shutdown so buffered file logs are flushed.
    let _guard = berth::logging::init_logging(&config.logging, verbose)?;

    let problems = config.validate();
    if config.server.bind.parse::<std::net::SocketAddr>().is_err() {
        bail!("Invalid bind address '{}'", config.server.bind);
    }
    for problem in &problems {
        warn!("config: {}", problem);
    }
    if config.agent.tokens.is_empty() {
        warn!("no agent tokens configured; LOCAL workspaces will run on the engine");
    }

    berth::server::start_server(config, dev).await
}
