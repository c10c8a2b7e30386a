use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per task id, created on first use.
///
/// Serializes check-then-create for a task inside this process. Entries are
/// never removed; the map holds one small mutex per task ever provisioned.
#[derive(Default)]
pub(crate) struct TaskLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TaskLocks {
    pub(crate) async fn lock(&self, task_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(task_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Take the task's lock only if nobody holds it.
    pub(crate) fn try_lock(&self, task_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(task_id.to_string()).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_task_waits_other_task_does_not() {
        let locks = Arc::new(TaskLocks::default());
        let held = locks.lock("task-1").await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("task-2")).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("task-1")).await;
        assert!(same.is_err());

        drop(held);
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("task-1")).await;
        assert!(same.is_ok());
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let locks = TaskLocks::default();
        let held = locks.lock("task-1").await;
        assert!(locks.try_lock("task-1").is_none());
        assert!(locks.try_lock("task-2").is_some());
        drop(held);
        assert!(locks.try_lock("task-1").is_some());
    }
}
