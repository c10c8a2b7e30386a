//! Persistent storage for tasks, container rows and reconciliation candidates
//! using redb.
//!
//! # Table design
//!
//! ```text
//! tasks      : task id (str)          -> JSON Task
//! containers : row uuid (16 bytes)    -> JSON RemoteContainer
//! reconcile  : candidate uuid (16 b)  -> JSON ReconcileCandidate
//! ```
//!
//! Row counts are small (one container row per provision), so lookups by
//! task or provider id scan the table. Invariants that span a read and a
//! write (single active container per task, monotonic status) are checked
//! inside one write transaction, which redb serializes.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::container::{ApplyOutcome, Observation, ReconcileCandidate, RemoteContainer};
use crate::error::{PreviewError, Result};
use crate::task::Task;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
const CONTAINERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("containers");
const RECONCILE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("reconcile");

fn db_err(e: impl std::fmt::Display) -> PreviewError {
    PreviewError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the redb database at `path`, creating all tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        Self::init(db)
    }

    /// A database that lives only in memory. Used by tests and `--ephemeral`.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(db_err)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(TASKS).map_err(db_err)?;
        wt.open_table(CONTAINERS).map_err(db_err)?;
        wt.open_table(RECONCILE).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    /// Insert a new task; fails if the id is taken (even by a deleted task).
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let value = serde_json::to_vec(task)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(TASKS).map_err(db_err)?;
            if table.get(task.id.as_str()).map_err(db_err)?.is_some() {
                return Err(PreviewError::TaskExists(task.id.clone()));
            }
            table
                .insert(task.id.as_str(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Raw lookup, including soft-deleted tasks.
    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(TASKS).map_err(db_err)?;
        match table.get(id).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Lookup enforcing visibility: not deleted and owned by `user_id`
    /// unless `admin`. Anything else is reported as not found.
    pub fn find_task(&self, id: &str, user_id: &str, admin: bool) -> Result<Task> {
        match self.get_task(id)? {
            Some(task) if task.is_visible_to(user_id, admin) => Ok(task),
            _ => Err(PreviewError::TaskNotFound(id.to_string())),
        }
    }

    /// Visible tasks, newest first. `user_id = None` lists every user's tasks.
    pub fn list_tasks(&self, user_id: Option<&str>) -> Result<Vec<Task>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(TASKS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let task: Task = serde_json::from_slice(v.value())?;
            if task.is_deleted() {
                continue;
            }
            if user_id.is_some_and(|u| u != task.user_id) {
                continue;
            }
            result.push(task);
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    /// Mark a visible task as deleted and return the updated record.
    pub fn soft_delete_task(&self, id: &str, user_id: &str, admin: bool) -> Result<Task> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let task = {
            let mut table = wt.open_table(TASKS).map_err(db_err)?;
            let existing = table.get(id).map_err(db_err)?.map(|v| v.value().to_vec());
            let mut task: Task = match existing {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => return Err(PreviewError::TaskNotFound(id.to_string())),
            };
            if !task.is_visible_to(user_id, admin) {
                return Err(PreviewError::TaskNotFound(id.to_string()));
            }
            let now = Utc::now();
            task.deleted_at = Some(now);
            task.updated_at = now;
            let value = serde_json::to_vec(&task)?;
            table.insert(id, value.as_slice()).map_err(db_err)?;
            task
        };
        wt.commit().map_err(db_err)?;
        Ok(task)
    }

    // ── Containers ────────────────────────────────────────────────────

    /// Insert a new container row.
    ///
    /// Rejects the insert when the task already has a non-terminal row; the
    /// check and the write share one transaction.
    pub fn insert_container(&self, container: &RemoteContainer) -> Result<()> {
        let value = serde_json::to_vec(container)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(CONTAINERS).map_err(db_err)?;
            let mut active = None;
            for entry in table.iter().map_err(db_err)? {
                let (_, v) = entry.map_err(db_err)?;
                let row: RemoteContainer = serde_json::from_slice(v.value())?;
                if row.task_id == container.task_id && row.is_active() {
                    active = Some(row.container_id);
                    break;
                }
            }
            if let Some(container_id) = active {
                return Err(PreviewError::ActiveContainerExists {
                    task_id: container.task_id.clone(),
                    container_id,
                });
            }
            table
                .insert(container.id.as_bytes().as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get_container(&self, id: Uuid) -> Result<Option<RemoteContainer>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(CONTAINERS).map_err(db_err)?;
        match table.get(id.as_bytes().as_slice()).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All container rows, newest first.
    pub fn list_containers(&self) -> Result<Vec<RemoteContainer>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(CONTAINERS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice::<RemoteContainer>(v.value())?);
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    /// Rows in `Provisioning` or `Running`: the ones monitoring still polls.
    pub fn list_active_containers(&self) -> Result<Vec<RemoteContainer>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(RemoteContainer::is_active)
            .collect())
    }

    pub fn active_container_for_task(&self, task_id: &str) -> Result<Option<RemoteContainer>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .find(|c| c.task_id == task_id && c.is_active()))
    }

    /// Most recent row for the task regardless of status.
    pub fn latest_container_for_task(&self, task_id: &str) -> Result<Option<RemoteContainer>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .find(|c| c.task_id == task_id))
    }

    /// Most recent row carrying the given provider container id.
    pub fn find_by_container_id(&self, container_id: &str) -> Result<Option<RemoteContainer>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .find(|c| c.container_id == container_id))
    }

    /// Apply a provider observation to row `id`.
    ///
    /// The persisted status is re-read inside the write transaction so a stale
    /// `Running` result can never overwrite a terminal status written by a
    /// concurrent stop or NotFound poll.
    pub fn apply_observation(
        &self,
        id: Uuid,
        obs: &Observation,
    ) -> Result<(RemoteContainer, ApplyOutcome)> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let result = {
            let mut table = wt.open_table(CONTAINERS).map_err(db_err)?;
            let key = id.as_bytes().as_slice();
            let existing = table.get(key).map_err(db_err)?.map(|v| v.value().to_vec());
            let mut row: RemoteContainer = match existing {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => return Err(PreviewError::ContainerNotFound(id.to_string())),
            };
            let outcome = row.apply(obs, Utc::now());
            if outcome == ApplyOutcome::Applied {
                let value = serde_json::to_vec(&row)?;
                table.insert(key, value.as_slice()).map_err(db_err)?;
            }
            (row, outcome)
        };
        wt.commit().map_err(db_err)?;
        Ok(result)
    }

    // ── Reconciliation candidates ─────────────────────────────────────

    pub fn record_candidate(&self, candidate: &ReconcileCandidate) -> Result<()> {
        let value = serde_json::to_vec(candidate)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(RECONCILE).map_err(db_err)?;
            table
                .insert(candidate.id.as_bytes().as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Unresolved candidates, oldest first.
    pub fn pending_candidates(&self) -> Result<Vec<ReconcileCandidate>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(RECONCILE).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let candidate: ReconcileCandidate = serde_json::from_slice(v.value())?;
            if candidate.resolved_at.is_none() {
                result.push(candidate);
            }
        }
        result.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(result)
    }

    pub fn resolve_candidate(&self, id: Uuid) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(RECONCILE).map_err(db_err)?;
            let key = id.as_bytes().as_slice();
            let existing = table.get(key).map_err(db_err)?.map(|v| v.value().to_vec());
            let Some(bytes) = existing else {
                return Ok(());
            };
            let mut candidate: ReconcileCandidate = serde_json::from_slice(&bytes)?;
            candidate.resolved_at = Some(Utc::now());
            let value = serde_json::to_vec(&candidate)?;
            table.insert(key, value.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
