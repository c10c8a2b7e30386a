pub mod containers;
pub mod health;
pub mod qr_code;
pub mod tasks;

use preview_core::store::Store;

use crate::error::AppError;
use crate::state::AppState;

/// Run a store operation on the blocking pool.
pub(crate) async fn with_store<T, F>(app: &AppState, f: F) -> Result<T, AppError>
where
    F: FnOnce(&Store) -> preview_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = app.store.clone();
    let result = tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(result)
}
