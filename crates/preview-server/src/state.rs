use std::path::Path;
use std::sync::Arc;

use preview_core::config::{Config, ProviderConfig, ProviderKind};
use preview_core::paths;
use preview_core::qr::{MemoryQrCache, QrCacheStore};
use preview_core::rate_limit::{FixedWindowLimiter, RateLimit};
use preview_core::store::Store;
use preview_provider::{ContainerClient, HttpContainerClient, MemoryContainerClient, ProviderError};
use tracing::warn;

use crate::auth::SessionKeys;
use crate::lifecycle::{LifecycleService, LifecycleSettings};

/// Shared application state passed to all route handlers.
///
/// Every component is built here and injected; nothing lives in a global.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub lifecycle: Arc<LifecycleService>,
    pub qr_cache: Arc<dyn QrCacheStore>,
    pub rate_limiter: Arc<dyn RateLimit>,
    pub sessions: Arc<SessionKeys>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<Store>, client: Arc<dyn ContainerClient>) -> Self {
        let qr_cache: Arc<dyn QrCacheStore> = Arc::new(MemoryQrCache::new());
        let rate_limiter: Arc<dyn RateLimit> = Arc::new(FixedWindowLimiter::new(
            config.rate_limit.max_requests,
            std::time::Duration::from_secs(config.rate_limit.window_secs),
        ));
        let lifecycle = LifecycleService::new(
            store.clone(),
            client,
            qr_cache.clone(),
            LifecycleSettings::from_config(&config),
        )
        .with_rate_limiter(rate_limiter.clone());

        let secret = match &config.server.session_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("server.session_secret not set; tokens will not survive a restart");
                format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
            }
        };

        Self {
            config: Arc::new(config),
            store,
            lifecycle: Arc::new(lifecycle),
            qr_cache,
            rate_limiter,
            sessions: Arc::new(SessionKeys::new(secret)),
        }
    }

    /// Open the project database under `root` and wire the configured provider.
    pub fn open(root: &Path, config: Config) -> anyhow::Result<Self> {
        let store = Arc::new(Store::open(&paths::db_path(root))?);
        let client = build_client(&config.provider)?;
        Ok(Self::new(config, store, client))
    }
}

pub fn build_client(cfg: &ProviderConfig) -> Result<Arc<dyn ContainerClient>, ProviderError> {
    match cfg.kind {
        ProviderKind::Http => Ok(Arc::new(HttpContainerClient::from_config(cfg)?)),
        ProviderKind::Memory => Ok(Arc::new(MemoryContainerClient::new())),
    }
}
