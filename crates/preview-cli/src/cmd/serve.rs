use super::open_state;
use std::path::Path;

pub fn run(root: &Path, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let state = open_state(root)?;
    let port = port.unwrap_or(state.config.server.port);
    let bind = bind.unwrap_or_else(|| state.config.server.bind.clone());

    tracing::info!(
        root = %root.display(),
        provider = ?state.config.provider.kind,
        "starting preview server"
    );

    super::block_on(async move { preview_server::serve(state, &bind, port).await })
}
