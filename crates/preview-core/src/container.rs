//! Remote bundler container records and the rules for mutating them.
//!
//! A `RemoteContainer` row is the local cache of what the provider reports.
//! Rows are written in `Provisioning` before the provider identifiers are
//! trusted, refreshed by monitoring polls via [`RemoteContainer::apply`], and
//! end in `Stopped` or `Error`. A terminal row is never revived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ContainerStatus, ResourceUsage};

// ---------------------------------------------------------------------------
// RemoteContainer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteContainer {
    /// Local row id.
    pub id: Uuid,
    pub task_id: String,
    pub user_id: String,
    /// Provider-side container identifier.
    pub container_id: String,
    pub project_id: Option<String>,
    pub service_id: Option<String>,
    /// Public URL of the Metro bundler.
    pub metro_url: String,
    pub status: ContainerStatus,
    pub resource_usage: Option<ResourceUsage>,
    pub uptime_seconds: Option<u64>,
    /// Why the row reached its current status, when it is not self-evident.
    pub status_reason: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Provider identifiers returned by a successful create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedIds {
    pub container_id: String,
    pub metro_url: String,
    pub project_id: Option<String>,
    pub service_id: Option<String>,
}

impl RemoteContainer {
    /// A fresh row in `Provisioning` state.
    pub fn provisioning(
        task_id: impl Into<String>,
        user_id: impl Into<String>,
        ids: ProvisionedIds,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            user_id: user_id.into(),
            container_id: ids.container_id,
            project_id: ids.project_id,
            service_id: ids.service_id,
            metro_url: ids.metro_url,
            status: ContainerStatus::Provisioning,
            resource_usage: None,
            uptime_seconds: None,
            status_reason: None,
            last_activity_at: now,
            created_at: now,
            updated_at: now,
            stopped_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Apply a provider observation.
    ///
    /// The persisted status is checked first: a terminal row ignores every
    /// observation, so a delayed `Running` poll cannot revive it.
    pub fn apply(&mut self, obs: &Observation, now: DateTime<Utc>) -> ApplyOutcome {
        if self.status.is_terminal() {
            return ApplyOutcome::IgnoredTerminal;
        }
        if !self.status.can_transition_to(obs.status) {
            return ApplyOutcome::IgnoredStale;
        }

        self.status = obs.status;
        if let Some(usage) = obs.resource_usage {
            self.resource_usage = Some(usage);
        }
        if let Some(uptime) = obs.uptime_seconds {
            self.uptime_seconds = Some(uptime);
        }
        if let Some(at) = obs.last_activity_at {
            if at > self.last_activity_at {
                self.last_activity_at = at;
            }
        }
        if obs.reason.is_some() {
            self.status_reason = obs.reason.clone();
        }
        if obs.status.is_terminal() {
            self.stopped_at = Some(now);
        }
        self.updated_at = now;
        ApplyOutcome::Applied
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// What a monitoring poll (or an explicit stop) learned about a container.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: ContainerStatus,
    pub resource_usage: Option<ResourceUsage>,
    pub uptime_seconds: Option<u64>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl Observation {
    pub fn status(status: ContainerStatus) -> Self {
        Self {
            status,
            resource_usage: None,
            uptime_seconds: None,
            last_activity_at: None,
            reason: None,
        }
    }

    pub fn terminal(status: ContainerStatus, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::status(status)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The row was already terminal; nothing changed.
    IgnoredTerminal,
    /// The observation would move the row backwards (running → provisioning).
    IgnoredStale,
}

// ---------------------------------------------------------------------------
// ReconcileCandidate
// ---------------------------------------------------------------------------

/// A provider-side container whose local bookkeeping is uncertain.
///
/// Recorded when a create call timed out or its row could not be written.
/// `container_id` is `None` when the provider never returned an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileCandidate {
    pub id: Uuid,
    pub task_id: String,
    pub container_id: Option<String>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReconcileCandidate {
    pub fn new(
        task_id: impl Into<String>,
        container_id: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            container_id,
            reason: reason.into(),
            recorded_at: Utc::now(),
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> RemoteContainer {
        RemoteContainer::provisioning(
            "task-1",
            "user-1",
            ProvisionedIds {
                container_id: "railway-mobile-abc".into(),
                metro_url: "https://mobile-abc.up.railway.app".into(),
                project_id: Some("proj".into()),
                service_id: Some("svc".into()),
            },
        )
    }

    #[test]
    fn running_observation_updates_snapshot() {
        let mut c = row();
        let obs = Observation {
            status: ContainerStatus::Running,
            resource_usage: Some(ResourceUsage {
                cpu: 45.0,
                ram: 512.0,
                network: 3.5,
            }),
            uptime_seconds: Some(120),
            last_activity_at: None,
            reason: None,
        };
        assert_eq!(c.apply(&obs, Utc::now()), ApplyOutcome::Applied);
        assert_eq!(c.status, ContainerStatus::Running);
        assert_eq!(c.resource_usage.unwrap().ram, 512.0);
        assert_eq!(c.uptime_seconds, Some(120));
    }

    #[test]
    fn stale_running_never_revives_terminal_row() {
        let mut c = row();
        c.apply(
            &Observation::terminal(ContainerStatus::Stopped, "idle"),
            Utc::now(),
        );
        assert!(c.stopped_at.is_some());

        let outcome = c.apply(&Observation::status(ContainerStatus::Running), Utc::now());
        assert_eq!(outcome, ApplyOutcome::IgnoredTerminal);
        assert_eq!(c.status, ContainerStatus::Stopped);
        assert_eq!(c.status_reason.as_deref(), Some("idle"));
    }

    #[test]
    fn running_row_ignores_provisioning_report() {
        let mut c = row();
        c.apply(&Observation::status(ContainerStatus::Running), Utc::now());
        let outcome = c.apply(
            &Observation::status(ContainerStatus::Provisioning),
            Utc::now(),
        );
        assert_eq!(outcome, ApplyOutcome::IgnoredStale);
        assert_eq!(c.status, ContainerStatus::Running);
    }

    #[test]
    fn last_activity_only_moves_forward() {
        let mut c = row();
        let before = c.last_activity_at;
        let mut obs = Observation::status(ContainerStatus::Running);
        obs.last_activity_at = Some(before - chrono::Duration::minutes(5));
        c.apply(&obs, Utc::now());
        assert_eq!(c.last_activity_at, before);

        obs.last_activity_at = Some(before + chrono::Duration::minutes(5));
        c.apply(&obs, Utc::now());
        assert!(c.last_activity_at > before);
    }
}
