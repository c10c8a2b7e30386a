//! Cross-check provider containers against container rows.
//!
//! Orphans come from ambiguous creates, failed row writes and cross-process
//! provisioning races. Rows without a provider container come from
//! out-of-band reaping that monitoring has not seen yet.

use std::collections::HashSet;

use chrono::Utc;
use preview_core::container::Observation;
use preview_core::types::ContainerStatus;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{LifecycleError, LifecycleService};

const MISSING_REASON: &str = "missing from provider listing";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Provider containers stopped because no active row claims them.
    pub orphans_stopped: Vec<String>,
    pub candidates_resolved: usize,
    /// Active rows marked stopped because the provider no longer lists them.
    pub rows_marked_stopped: Vec<String>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphans_stopped.is_empty()
            && self.rows_marked_stopped.is_empty()
            && self.errors.is_empty()
    }

    pub fn log(&self) {
        if self.is_clean() && self.candidates_resolved == 0 {
            return;
        }
        info!(
            orphans_stopped = self.orphans_stopped.len(),
            candidates_resolved = self.candidates_resolved,
            rows_marked_stopped = self.rows_marked_stopped.len(),
            errors = self.errors.len(),
            "reconciliation finished"
        );
    }
}

impl LifecycleService {
    pub async fn reconcile(&self) -> Result<ReconcileReport, LifecycleError> {
        let started_at = Utc::now();
        let mut report = ReconcileReport::default();

        let listed = self.client.list_containers().await?;
        let rows = self.blocking(|s| s.list_active_containers()).await?;
        let claimed: HashSet<&str> = rows.iter().map(|r| r.container_id.as_str()).collect();

        // Provider side: stop our containers that no active row claims.
        for c in &listed {
            let Some(task_id) = c.task_id.as_deref() else {
                continue;
            };
            if c.status.is_some_and(|s| s.is_terminal())
                || claimed.contains(c.container_id.as_str())
            {
                continue;
            }
            // A provision holding the task lock may not have written its row yet.
            let Some(_guard) = self.locks.try_lock(task_id) else {
                debug!(container_id = %c.container_id, task_id, "task is provisioning, leaving container");
                continue;
            };
            let cid = c.container_id.clone();
            if let Some(row) = self.blocking(move |s| s.find_by_container_id(&cid)).await? {
                if row.is_active() {
                    continue;
                }
            }
            match self.client.stop_container(&c.container_id).await {
                Ok(()) => {
                    warn!(
                        reconcile = true,
                        container_id = %c.container_id,
                        task_id,
                        "stopped orphaned container"
                    );
                    report.orphans_stopped.push(c.container_id.clone());
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => report
                    .errors
                    .push(format!("stop orphan {}: {e}", c.container_id)),
            }
        }

        // Candidates are settled once the orphan pass has run.
        let candidates = self.blocking(|s| s.pending_candidates()).await?;
        for candidate in candidates {
            let id = candidate.id;
            match self.blocking(move |s| s.resolve_candidate(id)).await {
                Ok(()) => report.candidates_resolved += 1,
                Err(e) => report.errors.push(format!("resolve candidate {id}: {e}")),
            }
        }

        // Local side: rows whose container the provider no longer lists.
        // Rows created after the listing was taken are left alone.
        let listed_ids: HashSet<&str> = listed.iter().map(|c| c.container_id.as_str()).collect();
        for row in &rows {
            if listed_ids.contains(row.container_id.as_str()) || row.created_at >= started_at {
                continue;
            }
            let row_id = row.id;
            let obs = Observation::terminal(ContainerStatus::Stopped, MISSING_REASON);
            match self.blocking(move |s| s.apply_observation(row_id, &obs)).await {
                Ok(_) => {
                    self.qr_cache.invalidate_task(&row.task_id);
                    report.rows_marked_stopped.push(row.container_id.clone());
                }
                Err(e) => report
                    .errors
                    .push(format!("mark {} stopped: {e}", row.container_id)),
            }
        }

        Ok(report)
    }
}
