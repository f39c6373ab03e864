use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use flotilla_domain::PodId;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Eq, PartialEq)]
struct Entry {
    priority: i32,
    seq: u64,
    pod_id: PodId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Delayed {
    not_before: Instant,
    priority: i32,
    pod_id: PodId,
}

#[derive(Debug, Default)]
struct Inner {
    ready: BinaryHeap<Entry>,
    delayed: Vec<Delayed>,
    queued: HashSet<PodId>,
    attempts: HashMap<PodId, u32>,
    seq: u64,
}

/// Priority-ordered queue of pending pods shared by the scheduler workers.
///
/// Entries re-queued after a failed attempt sit in a delay area until their
/// backoff passes; `pop_ready` promotes them back first.
#[derive(Debug, Default)]
pub struct PendingQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pod. Duplicate enqueues of a pod already queued are ignored.
    pub fn enqueue(&self, pod_id: PodId, priority: i32) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if !inner.queued.insert(pod_id.clone()) {
            return;
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.ready.push(Entry { priority, seq, pod_id });
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-queue after a failed attempt with exponential backoff, capped.
    /// Returns the delay that was applied.
    pub fn requeue_after_backoff(
        &self,
        pod_id: PodId,
        priority: i32,
        base: Duration,
        cap: Duration,
    ) -> Duration {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let attempts = inner.attempts.entry(pod_id.clone()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let exp = attempts.saturating_sub(1).min(16);
        let delay = base.saturating_mul(1u32 << exp).min(cap);

        if inner.queued.insert(pod_id.clone()) {
            inner.delayed.push(Delayed {
                not_before: Instant::now() + delay,
                priority,
                pod_id,
            });
        }
        delay
    }

    /// Forget backoff history, typically after a successful bind.
    pub fn clear_attempts(&self, pod_id: &PodId) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.attempts.remove(pod_id);
    }

    /// Highest-priority pod whose backoff (if any) has passed.
    pub fn pop_ready(&self) -> Option<(PodId, i32)> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let now = Instant::now();
        let mut i = 0;
        while i < inner.delayed.len() {
            if inner.delayed[i].not_before <= now {
                let due = inner.delayed.swap_remove(i);
                inner.seq += 1;
                let seq = inner.seq;
                inner.ready.push(Entry { priority: due.priority, seq, pod_id: due.pod_id });
            } else {
                i += 1;
            }
        }
        let entry = inner.ready.pop()?;
        inner.queued.remove(&entry.pod_id);
        Some((entry.pod_id, entry.priority))
    }

    /// When the earliest delayed entry becomes ready, if any.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.delayed.iter().map(|d| d.not_before).min()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.ready.len() + inner.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until something is enqueued.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}
