pub mod config;
pub mod containers;
pub mod reconcile;
pub mod serve;
pub mod task;
pub mod token;

use anyhow::Context;
use preview_core::config::Config;
use preview_server::AppState;
use std::path::Path;

/// Load the config under `root` and open the store and provider for it.
pub(crate) fn open_state(root: &Path) -> anyhow::Result<AppState> {
    let config = Config::load(root).context("failed to load config")?;
    config.ensure_valid().context("invalid config")?;
    AppState::open(root, config)
}

/// Run an async command body on a fresh runtime.
pub(crate) fn block_on<F, T>(fut: F) -> anyhow::Result<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(fut)
}
