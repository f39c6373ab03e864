use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flotilla_domain::NodeStatus;
use flotilla_store::{ClusterStore, StoreError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Interval between health passes.
    pub cadence: Duration,
    /// Silence after which an online node becomes suspect.
    pub heartbeat_timeout: Duration,
    /// Time a suspect node keeps its pods before they are revoked.
    pub lease_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            cadence: Duration::seconds(30),
            heartbeat_timeout: Duration::seconds(60),
            lease_timeout: Duration::seconds(120),
        }
    }
}

/// What one health pass did, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub marked_suspect: usize,
    pub leases_expired: usize,
    pub pods_revoked: usize,
}

/// Walks the node table on a timer and runs the two-phase health check:
/// online nodes past the heartbeat window become suspect, suspect nodes
/// past the lease window go offline and lose their pods.
///
/// Single-writer: only one pass runs at a time; an overlapping tick is
/// skipped with a log line.
pub struct LeaseEngine {
    store: Arc<ClusterStore>,
    config: LeaseConfig,
    pass_active: AtomicBool,
}

impl LeaseEngine {
    pub fn new(store: Arc<ClusterStore>, config: LeaseConfig) -> Self {
        LeaseEngine { store, config, pass_active: AtomicBool::new(false) }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = self
            .config
            .cadence
            .to_std()
            .unwrap_or_else(|_| std::time::Duration::from_secs(30));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            cadence_secs = self.config.cadence.num_seconds(),
            heartbeat_timeout_secs = self.config.heartbeat_timeout.num_seconds(),
            lease_timeout_secs = self.config.lease_timeout.num_seconds(),
            "lease engine started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("lease engine stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.pass(Utc::now()).await {
                        warn!(error = %e, "lease pass failed; will retry next tick");
                    }
                }
            }
        }
    }

    /// One two-phase pass over the node table at time `now`.
    pub async fn pass(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        if self
            .pass_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("previous lease pass still running; skipping this tick");
            return Ok(PassReport::default());
        }
        let result = self.pass_inner(now).await;
        self.pass_active.store(false, Ordering::SeqCst);
        result
    }

    async fn pass_inner(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        let mut report = PassReport::default();
        let nodes = self.store.nodes().await;

        // Phase A: silent online nodes become suspect. Their pods are left
        // alone; ownership is still theirs until the lease runs out.
        for node in &nodes {
            if node.status != NodeStatus::Online {
                continue;
            }
            if now - node.last_heartbeat > self.config.heartbeat_timeout {
                match self.store.mark_node_suspect(&node.id, now).await {
                    Ok(_) => {
                        warn!(
                            node_id = %node.id,
                            silent_secs = (now - node.last_heartbeat).num_seconds(),
                            "node missed its heartbeat window; marked suspect"
                        );
                        report.marked_suspect += 1;
                    }
                    // A heartbeat can race the pass and win; that is recovery,
                    // not an error.
                    Err(StoreError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        // Phase B: suspect nodes past the lease lose their pods.
        for node in &nodes {
            if node.status != NodeStatus::Suspect {
                continue;
            }
            let Some(since) = node.suspect_since else {
                continue;
            };
            if now - since >= self.config.lease_timeout {
                match self.store.expire_lease(&node.id, now).await {
                    Ok(revoked) => {
                        warn!(
                            node_id = %node.id,
                            pods_revoked = revoked.len(),
                            "lease expired; node offline and pods revoked"
                        );
                        report.leases_expired += 1;
                        report.pods_revoked += revoked.len();
                    }
                    Err(StoreError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if report != PassReport::default() {
            info!(
                suspect = report.marked_suspect,
                expired = report.leases_expired,
                revoked = report.pods_revoked,
                "lease pass complete"
            );
        }
        Ok(report)
    }
}
