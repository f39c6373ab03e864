use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::ids::{PodId, WorkloadId};
use crate::pod::{Pod, PodPhase, PriorityClass};
use crate::resources::{Resources, Toleration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Active,
    Paused,
    Deleting,
}

/// Per-pod template stamped onto every replica a workload creates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default)]
    pub preferred_labels: HashMap<String, String>,
    pub requests: Resources,
    pub limits: Resources,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedReplicas {
    pub ready: u32,
    pub available: u32,
    pub updated: u32,
}

// ── Crash-loop accounting ─────────────────────────────────────────────────────

/// Tracks consecutive pre-running failures of the workload's target version
/// so rollouts of a broken version can be held back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrashLoopState {
    pub last_successful_version: Option<String>,
    pub failed_version: Option<String>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

impl CrashLoopState {
    /// Record a pod of `version` failing before it reached running. Returns
    /// the updated consecutive count. A failure of a different version than
    /// the current streak restarts the count.
    pub fn record_failure(&mut self, version: &str) -> u32 {
        if self.failed_version.as_deref() != Some(version) {
            self.failed_version = Some(version.to_string());
            self.consecutive_failures = 0;
        }
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    /// A pod of `version` reached running: the streak is broken.
    pub fn record_success(&mut self, version: &str) {
        self.last_successful_version = Some(version.to_string());
        if self.failed_version.as_deref() == Some(version) {
            self.failed_version = None;
            self.consecutive_failures = 0;
            self.backoff_until = None;
        }
    }

    pub fn in_backoff(&self, version: &str, now: DateTime<Utc>) -> bool {
        self.failed_version.as_deref() == Some(version)
            && self.backoff_until.is_some_and(|until| now < until)
    }
}

/// Exponential backoff for a crash-looping version, capped.
pub fn failure_backoff(consecutive_failures: u32, base: Duration, cap: Duration) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(16);
    let scaled = base
        .checked_mul(1 << exp)
        .unwrap_or(cap);
    scaled.min(cap)
}

// ── Workload ──────────────────────────────────────────────────────────────────

/// Declarative replica count + template for pods of one pack. Covers both
/// long-running services and per-node daemons (`replicas == 0`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    /// Unique within `namespace`.
    pub name: String,
    pub namespace: String,
    pub pack_name: String,
    /// Current target version. Advanced automatically when `follow_latest`.
    pub pack_version: String,
    #[serde(default)]
    pub follow_latest: bool,
    /// 0 means one replica per feasible node (daemon mode).
    pub replicas: u32,
    pub template: PodTemplate,
    #[serde(default)]
    pub priority_class: PriorityClass,
    pub status: WorkloadStatus,
    #[serde(default)]
    pub observed: ObservedReplicas,
    #[serde(default)]
    pub crash_loop: CrashLoopState,
    /// Canonical hash of `template`; a change forces replacement of
    /// out-of-date pods.
    pub template_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workload {
    /// Reject a malformed workload before it is created.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.is_empty() {
            return Err(DomainError::InvalidId("workload name must not be empty".into()));
        }
        if self.namespace.is_empty() {
            return Err(DomainError::InvalidId(
                "workload namespace must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn daemon(&self) -> bool {
        self.replicas == 0
    }

    /// The service identity pods of this workload provide, used by the
    /// routing arbiter.
    pub fn service_id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Stamp a new pending pod from the template.
    pub fn instantiate_pod(&self, id: PodId, now: DateTime<Utc>) -> Pod {
        Pod {
            id,
            workload_id: Some(self.id.clone()),
            pack_name: self.pack_name.clone(),
            pack_version: self.pack_version.clone(),
            namespace: self.namespace.clone(),
            requests: self.template.requests,
            limits: self.template.limits,
            tolerations: self.template.tolerations.clone(),
            node_selector: self.template.node_selector.clone(),
            preferred_labels: self.template.preferred_labels.clone(),
            pinned_node: None,
            priority: self.priority_class.priority(),
            node_id: None,
            phase: PodPhase::Pending,
            incarnation: 0,
            created_by: format!("workload/{}", self.name),
            created_at: now,
            scheduled_at: None,
            started_at: None,
            stopped_at: None,
            last_reported_at: None,
            termination_reason: None,
            restart_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_requires_name_and_namespace() {
        let workload = Workload {
            id: WorkloadId::new("w-api"),
            name: "api".into(),
            namespace: "default".into(),
            pack_name: "app".into(),
            pack_version: "1.0.0".into(),
            follow_latest: false,
            replicas: 1,
            template: PodTemplate::default(),
            priority_class: PriorityClass::Normal,
            status: WorkloadStatus::Active,
            observed: ObservedReplicas::default(),
            crash_loop: CrashLoopState::default(),
            template_hash: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(workload.validate().is_ok());

        let mut unnamed = workload.clone();
        unnamed.name.clear();
        assert!(matches!(unnamed.validate(), Err(DomainError::InvalidId(_))));

        let mut homeless = workload;
        homeless.namespace.clear();
        assert!(matches!(homeless.validate(), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn crash_streak_resets_on_version_change() {
        let mut s = CrashLoopState::default();
        assert_eq!(s.record_failure("1.0.0"), 1);
        assert_eq!(s.record_failure("1.0.0"), 2);
        assert_eq!(s.record_failure("2.0.0"), 1);
    }

    #[test]
    fn success_clears_the_streak_for_that_version() {
        let mut s = CrashLoopState::default();
        s.record_failure("2.0.0");
        s.record_failure("2.0.0");
        s.record_success("2.0.0");
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.failed_version.is_none());
        assert_eq!(s.last_successful_version.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn backoff_applies_only_to_the_failed_version() {
        let now = Utc::now();
        let mut s = CrashLoopState::default();
        s.record_failure("2.0.0");
        s.backoff_until = Some(now + Duration::seconds(60));
        assert!(s.in_backoff("2.0.0", now));
        assert!(!s.in_backoff("1.0.0", now));
        assert!(!s.in_backoff("2.0.0", now + Duration::seconds(61)));
    }

    #[test]
    fn failure_backoff_grows_and_caps() {
        let base = Duration::seconds(30);
        let cap = Duration::seconds(900);
        assert_eq!(failure_backoff(1, base, cap), Duration::seconds(30));
        assert_eq!(failure_backoff(2, base, cap), Duration::seconds(60));
        assert_eq!(failure_backoff(3, base, cap), Duration::seconds(120));
        assert_eq!(failure_backoff(10, base, cap), cap);
    }
}
