use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters surfaced to external observation sinks. Incrementing
/// is lock-free and never blocks a mutation.
#[derive(Debug, Default)]
pub struct StoreCounters {
    pods_scheduled: AtomicU64,
    pods_failed: AtomicU64,
    pods_revoked: AtomicU64,
    nodes_lost: AtomicU64,
    events_dropped: AtomicU64,
    frames_dropped: AtomicU64,
    schedule_retries: AtomicU64,
    routes_served: AtomicU64,
}

impl StoreCounters {
    pub fn inc_pods_scheduled(&self) {
        self.pods_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pods_failed(&self) {
        self.pods_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pods_revoked(&self) {
        self.pods_revoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_nodes_lost(&self) {
        self.nodes_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_frames_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_schedule_retries(&self) {
        self.schedule_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_routes_served(&self) {
        self.routes_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            pods_scheduled: self.pods_scheduled.load(Ordering::Relaxed),
            pods_failed: self.pods_failed.load(Ordering::Relaxed),
            pods_revoked: self.pods_revoked.load(Ordering::Relaxed),
            nodes_lost: self.nodes_lost.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            schedule_retries: self.schedule_retries.load(Ordering::Relaxed),
            routes_served: self.routes_served.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub pods_scheduled: u64,
    pub pods_failed: u64,
    pub pods_revoked: u64,
    pub nodes_lost: u64,
    pub events_dropped: u64,
    pub frames_dropped: u64,
    pub schedule_retries: u64,
    pub routes_served: u64,
}
