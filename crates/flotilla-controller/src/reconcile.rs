use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flotilla_domain::{
    check_placement, compare_versions, failure_backoff, Pod, PodId, PodPhase, TerminationReason,
    Workload, WorkloadStatus,
};
use flotilla_store::{ClusterEvent, ClusterStore, StoreError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between reconcile passes.
    pub cadence: std::time::Duration,
    /// Hard deadline for one full pass.
    pub pass_deadline: std::time::Duration,
    /// Consecutive pre-running failures before a version is held back.
    pub crash_loop_threshold: u32,
    pub failure_backoff_base: Duration,
    pub failure_backoff_cap: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            cadence: std::time::Duration::from_secs(5),
            pass_deadline: std::time::Duration::from_secs(30),
            crash_loop_threshold: 3,
            failure_backoff_base: Duration::seconds(30),
            failure_backoff_cap: Duration::seconds(900),
        }
    }
}

/// What one reconcile pass did, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassStats {
    pub workloads_seen: usize,
    pub pods_created: usize,
    pub pods_terminated: usize,
}

/// Reconciles desired replicas against observed pods for every workload:
/// scale up/down, daemon-mode population, one-at-a-time version rollout,
/// crash-loop holdback and observed-count bookkeeping.
pub struct WorkloadController {
    store: Arc<ClusterStore>,
    config: ControllerConfig,
}

impl WorkloadController {
    pub fn new(store: Arc<ClusterStore>, config: ControllerConfig) -> Self {
        WorkloadController { store, config }
    }

    /// Start the periodic reconcile loop and the failure watcher.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let watcher = self.clone();
        let watcher_cancel = cancel.clone();
        tokio::spawn(async move { watcher.watch_failures(watcher_cancel).await });

        let mut ticker = tokio::time::interval(self.config.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(cadence_ms = self.config.cadence.as_millis() as u64, "workload controller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("workload controller stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match tokio::time::timeout(self.config.pass_deadline, self.pass(Utc::now())).await {
                        Ok(Ok(stats)) => {
                            if stats.pods_created > 0 || stats.pods_terminated > 0 {
                                info!(
                                    workloads = stats.workloads_seen,
                                    created = stats.pods_created,
                                    terminated = stats.pods_terminated,
                                    "reconcile pass complete"
                                );
                            }
                        }
                        Ok(Err(e)) => warn!(error = %e, "reconcile pass failed"),
                        Err(_) => warn!("reconcile pass exceeded its deadline"),
                    }
                }
            }
        }
    }

    /// Record pre-running failures and successes against the owning
    /// workload's crash-loop state, off the store's event stream. `run`
    /// spawns this; it is public for deployments that drive the reconcile
    /// passes themselves.
    pub async fn watch_failures(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.store.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.next() => {
                    let Some(event) = event else { return };
                    if let ClusterEvent::PodPhaseChanged { pod_id, from, to, .. } = event {
                        let result = match (from, to) {
                            // A pod that died before ever running counts
                            // against its version. Lease revocations emit
                            // PodRevoked instead and are not crashes.
                            (PodPhase::Scheduled, PodPhase::Failed)
                            | (PodPhase::Starting, PodPhase::Failed) => {
                                self.record_failure(&pod_id, Utc::now()).await
                            }
                            (_, PodPhase::Running) => self.record_success(&pod_id).await,
                            _ => Ok(()),
                        };
                        if let Err(e) = result {
                            warn!(pod_id = %pod_id, error = %e, "crash-loop accounting failed");
                        }
                    }
                }
            }
        }
    }

    async fn record_failure(&self, pod_id: &PodId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(pod) = self.store.pod(pod_id).await else { return Ok(()) };
        let Some(workload_id) = pod.workload_id.clone() else { return Ok(()) };
        let Some(mut workload) = self.store.workload(&workload_id).await else { return Ok(()) };

        let failures = workload.crash_loop.record_failure(&pod.pack_version);
        if failures >= self.config.crash_loop_threshold
            && pod.pack_version == workload.pack_version
        {
            let backoff = failure_backoff(
                failures,
                self.config.failure_backoff_base,
                self.config.failure_backoff_cap,
            );
            workload.crash_loop.backoff_until = Some(now + backoff);
            warn!(
                workload = %workload.id,
                version = %pod.pack_version,
                failures,
                backoff_secs = backoff.num_seconds(),
                "version is crash-looping; holding back new pods"
            );
            self.store
                .note_workload_stalled(&workload.id, &pod.pack_version, failures);
        }
        self.store.update_workload(workload).await?;
        Ok(())
    }

    async fn record_success(&self, pod_id: &PodId) -> Result<(), StoreError> {
        let Some(pod) = self.store.pod(pod_id).await else { return Ok(()) };
        let Some(workload_id) = pod.workload_id.clone() else { return Ok(()) };
        let Some(mut workload) = self.store.workload(&workload_id).await else { return Ok(()) };

        workload.crash_loop.record_success(&pod.pack_version);
        self.store.update_workload(workload).await?;
        Ok(())
    }

    /// One reconcile pass over every workload.
    pub async fn pass(&self, now: DateTime<Utc>) -> Result<PassStats, StoreError> {
        let mut stats = PassStats::default();
        for workload in self.store.workloads().await {
            stats.workloads_seen += 1;
            if let Err(e) = self.reconcile_workload(workload, now, &mut stats).await {
                warn!(error = %e, "workload reconcile failed; continuing with the rest");
            }
        }
        Ok(stats)
    }

    async fn reconcile_workload(
        &self,
        workload: Workload,
        now: DateTime<Utc>,
        stats: &mut PassStats,
    ) -> Result<(), StoreError> {
        match workload.status {
            WorkloadStatus::Deleting => return self.reap_deleting(workload, now, stats).await,
            WorkloadStatus::Paused => {
                return self.refresh_observed(workload).await;
            }
            WorkloadStatus::Active => {}
        }

        let mut workload = workload;
        let mut dirty = false;

        // Version drift: follow-latest adopts the newest registered version.
        if workload.follow_latest {
            if let Some(latest) = self.store.latest_pack_version(&workload.pack_name).await {
                if compare_versions(&latest, &workload.pack_version) == Ordering::Greater {
                    info!(
                        workload = %workload.id,
                        from = %workload.pack_version,
                        to = %latest,
                        "following pack to a newer version"
                    );
                    workload.pack_version = latest;
                    dirty = true;
                }
            }
        }

        let in_backoff = workload.crash_loop.in_backoff(&workload.pack_version, now);
        let pods = self.store.pods_of_workload(&workload.id).await;
        let active: Vec<&Pod> = pods.iter().filter(|p| p.is_active()).collect();

        if workload.daemon() {
            self.reconcile_daemon(&workload, &active, now, in_backoff, stats).await?;
        } else {
            self.reconcile_replicas(&workload, &active, now, in_backoff, stats).await?;
        }

        if dirty {
            workload = self.store.update_workload(workload).await?;
        }
        self.refresh_observed(workload).await
    }

    /// Fixed replica count: scale, then one-at-a-time rollout.
    async fn reconcile_replicas(
        &self,
        workload: &Workload,
        active: &[&Pod],
        now: DateTime<Utc>,
        in_backoff: bool,
        stats: &mut PassStats,
    ) -> Result<(), StoreError> {
        let desired = workload.replicas as usize;
        let old: Vec<&&Pod> = active
            .iter()
            .filter(|p| p.pack_version != workload.pack_version)
            .collect();

        if old.is_empty() {
            // Plain scaling.
            if active.len() < desired && !in_backoff {
                for _ in active.len()..desired {
                    self.create_pod(workload, None, now).await?;
                    stats.pods_created += 1;
                }
            } else if active.len() > desired {
                // Youngest first: newest created_at, tie-break on higher id.
                let mut doomed: Vec<&&Pod> = active.iter().collect();
                doomed.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then_with(|| b.id.cmp(&a.id))
                });
                for pod in doomed.into_iter().take(active.len() - desired) {
                    self.terminate_pod(pod, TerminationReason::ScaledDown, now).await?;
                    stats.pods_terminated += 1;
                }
            }
            return Ok(());
        }

        // Rollout: replace old-version pods one at a time. The next
        // replacement starts only when no newcomer is still coming up and
        // no replaced pod is still stopping.
        if in_backoff {
            debug!(workload = %workload.id, "rollout paused by crash-loop backoff");
            return Ok(());
        }
        let newcomer_in_flight = active.iter().any(|p| {
            p.pack_version == workload.pack_version
                && matches!(p.phase, PodPhase::Pending | PodPhase::Scheduled | PodPhase::Starting)
        });
        let old_still_stopping = old.iter().any(|p| p.phase == PodPhase::Stopping);
        if newcomer_in_flight || old_still_stopping {
            return Ok(());
        }

        if active.len() <= desired {
            self.create_pod(workload, None, now).await?;
            stats.pods_created += 1;
        } else {
            // The newest replica is up; retire the oldest outdated pod.
            let mut ordered = old.clone();
            ordered.sort_by(|a, b| {
                a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
            });
            if let Some(pod) = ordered.first() {
                self.terminate_pod(pod, TerminationReason::Superseded, now).await?;
                stats.pods_terminated += 1;
            }
        }
        Ok(())
    }

    /// Daemon mode: one replica pinned to every node that passes the
    /// placement filter; replicas on nodes that left the candidate set are
    /// reaped.
    async fn reconcile_daemon(
        &self,
        workload: &Workload,
        active: &[&Pod],
        now: DateTime<Utc>,
        in_backoff: bool,
        stats: &mut PassStats,
    ) -> Result<(), StoreError> {
        let Some(pack) = self
            .store
            .pack(&workload.pack_name, &workload.pack_version)
            .await
        else {
            warn!(workload = %workload.id, "pack not registered; daemon pass skipped");
            return Ok(());
        };
        let Some(namespace) = self.store.namespace(&workload.namespace).await else {
            return Ok(());
        };

        let probe = workload.instantiate_pod(PodId::new("probe"), now);
        let candidates: HashSet<_> = self
            .store
            .nodes()
            .await
            .into_iter()
            .filter(|n| check_placement(n, &probe, &pack, &namespace).is_ok())
            .map(|n| n.id)
            .collect();

        // Reap replicas whose node left the candidate set, and duplicate
        // replicas beyond the first per node.
        let mut covered: HashSet<flotilla_domain::NodeId> = HashSet::new();
        let mut by_age: Vec<&&Pod> = active.iter().collect();
        by_age.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        for pod in by_age {
            let home = pod.pinned_node.clone().or_else(|| pod.node_id.clone());
            let keep = match &home {
                Some(node_id) => candidates.contains(node_id) && covered.insert(node_id.clone()),
                None => false,
            };
            if !keep {
                self.terminate_pod(pod, TerminationReason::Drained, now).await?;
                stats.pods_terminated += 1;
            }
        }

        // One fresh replica for every uncovered candidate node.
        if !in_backoff {
            for node_id in candidates {
                if !covered.contains(&node_id) {
                    self.create_pod(workload, Some(node_id), now).await?;
                    stats.pods_created += 1;
                }
            }
        }
        Ok(())
    }

    async fn reap_deleting(
        &self,
        workload: Workload,
        now: DateTime<Utc>,
        stats: &mut PassStats,
    ) -> Result<(), StoreError> {
        let pods = self.store.pods_of_workload(&workload.id).await;
        let mut remaining = false;
        for pod in &pods {
            if pod.is_active() {
                remaining = true;
                self.terminate_pod(pod, TerminationReason::UserRequested, now).await?;
                stats.pods_terminated += 1;
            }
        }
        if !remaining {
            for pod in &pods {
                self.store.delete_pod(&pod.id).await?;
            }
            self.store.remove_workload(&workload.id).await?;
            info!(workload = %workload.id, "workload removed");
        }
        Ok(())
    }

    async fn refresh_observed(&self, workload: Workload) -> Result<(), StoreError> {
        let pods = self.store.pods_of_workload(&workload.id).await;
        let running = pods.iter().filter(|p| p.phase == PodPhase::Running).count() as u32;
        let updated = pods
            .iter()
            .filter(|p| p.is_active() && p.pack_version == workload.pack_version)
            .count() as u32;

        let observed = flotilla_domain::ObservedReplicas {
            ready: running,
            available: running,
            updated,
        };
        if workload.observed != observed {
            let mut workload = workload;
            workload.observed = observed;
            self.store.update_workload(workload).await?;
        }
        Ok(())
    }

    async fn create_pod(
        &self,
        workload: &Workload,
        pinned_node: Option<flotilla_domain::NodeId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut pod = workload.instantiate_pod(PodId::new(Uuid::new_v4().to_string()), now);
        pod.pinned_node = pinned_node;
        debug!(workload = %workload.id, pod_id = %pod.id, version = %pod.pack_version, "creating pod");
        self.store.create_pod(pod).await?;
        Ok(())
    }

    /// Running pods stop gracefully through the agent; pods that never made
    /// it to running are evicted directly.
    async fn terminate_pod(
        &self,
        pod: &Pod,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match pod.phase {
            PodPhase::Running => {
                self.store
                    .advance_pod_phase(&pod.id, pod.incarnation, PodPhase::Stopping, Some(reason), now)
                    .await?;
            }
            PodPhase::Stopping => {} // already on its way out
            PodPhase::Pending => {
                self.store.delete_pod(&pod.id).await?;
            }
            PodPhase::Scheduled | PodPhase::Starting => {
                self.store
                    .revoke_pod(&pod.id, PodPhase::Evicted, reason, now)
                    .await?;
            }
            PodPhase::Stopped | PodPhase::Failed | PodPhase::Evicted => {}
        }
        Ok(())
    }
}
