use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::{QrArtifact, QrFormat};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub task_id: String,
    pub format: QrFormat,
    pub size: u32,
}

impl CacheKey {
    pub fn new(task_id: impl Into<String>, format: QrFormat, size: u32) -> Self {
        Self {
            task_id: task_id.into(),
            format,
            size,
        }
    }
}

/// Storage for generated QR artifacts.
///
/// Entries are fully reconstructible, so implementations may drop them at
/// any time. A shared backend can replace [`MemoryQrCache`] without touching
/// the handlers.
pub trait QrCacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<QrArtifact>;
    fn set(&self, key: CacheKey, value: QrArtifact, ttl: Duration);
    /// Drop every entry for `task_id`. Returns how many were removed.
    fn invalidate_task(&self, task_id: &str) -> usize;
    /// Drop expired entries. Returns how many were removed.
    fn purge_expired(&self) -> usize;
}

struct Entry {
    artifact: QrArtifact,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Entry {
    fn live_at(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryQrCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
}

impl MemoryQrCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<QrArtifact> {
        let map = self.entries.read().ok()?;
        map.get(key)
            .filter(|e| e.live_at(now))
            .map(|e| e.artifact.clone())
    }

    fn purge_at(&self, now: Instant) -> usize {
        let Ok(mut map) = self.entries.write() else {
            return 0;
        };
        let before = map.len();
        map.retain(|_, e| e.live_at(now));
        before - map.len()
    }
}

impl QrCacheStore for MemoryQrCache {
    fn get(&self, key: &CacheKey) -> Option<QrArtifact> {
        self.get_at(key, Instant::now())
    }

    fn set(&self, key: CacheKey, value: QrArtifact, ttl: Duration) {
        if let Ok(mut map) = self.entries.write() {
            map.insert(
                key,
                Entry {
                    artifact: value,
                    expires_at: Instant::now().checked_add(ttl),
                },
            );
        }
    }

    fn invalidate_task(&self, task_id: &str) -> usize {
        let Ok(mut map) = self.entries.write() else {
            return 0;
        };
        let before = map.len();
        map.retain(|k, _| k.task_id != task_id);
        before - map.len()
    }

    fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qr::{generate_qr_code, QrOptions};

    fn artifact() -> QrArtifact {
        generate_qr_code("https://mobile-1.up.railway.app", &QrOptions::default())
    }

    #[test]
    fn set_then_get_returns_same_artifact() {
        let cache = MemoryQrCache::new();
        let key = CacheKey::new("task-1", QrFormat::Svg, 256);
        let art = artifact();
        cache.set(key.clone(), art.clone(), Duration::from_secs(60));
        assert_eq!(cache.get(&key), Some(art));
    }

    #[test]
    fn key_includes_format_and_size() {
        let cache = MemoryQrCache::new();
        cache.set(
            CacheKey::new("task-1", QrFormat::Svg, 256),
            artifact(),
            Duration::from_secs(60),
        );
        assert!(cache.get(&CacheKey::new("task-1", QrFormat::Png, 256)).is_none());
        assert!(cache.get(&CacheKey::new("task-1", QrFormat::Svg, 512)).is_none());
    }

    #[test]
    fn expired_entry_is_a_miss_and_purged() {
        let cache = MemoryQrCache::new();
        let key = CacheKey::new("task-1", QrFormat::Svg, 256);
        cache.set(key.clone(), artifact(), Duration::from_secs(60));

        let later = Instant::now() + Duration::from_secs(61);
        assert!(cache.get_at(&key, later).is_none());
        assert_eq!(cache.purge_at(later), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_never_hits() {
        let cache = MemoryQrCache::new();
        let key = CacheKey::new("task-1", QrFormat::Svg, 256);
        cache.set(key.clone(), artifact(), Duration::ZERO);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn huge_ttl_does_not_expire() {
        let cache = MemoryQrCache::new();
        let key = CacheKey::new("task-1", QrFormat::Svg, 256);
        cache.set(key.clone(), artifact(), Duration::MAX);
        assert!(cache.get(&key).is_some());

        let much_later = Instant::now() + Duration::from_secs(10 * 365 * 24 * 3600);
        assert_eq!(cache.purge_at(much_later), 0);
        // Invalidation still drops it.
        assert_eq!(cache.invalidate_task("task-1"), 1);
    }

    #[test]
    fn invalidate_task_only_drops_that_task() {
        let cache = MemoryQrCache::new();
        let ttl = Duration::from_secs(60);
        cache.set(CacheKey::new("task-1", QrFormat::Svg, 256), artifact(), ttl);
        cache.set(CacheKey::new("task-1", QrFormat::Png, 256), artifact(), ttl);
        cache.set(CacheKey::new("task-2", QrFormat::Svg, 256), artifact(), ttl);

        assert_eq!(cache.invalidate_task("task-1"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache
            .get(&CacheKey::new("task-2", QrFormat::Svg, 256))
            .is_some());
    }
}
