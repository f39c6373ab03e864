use std::collections::{HashMap, HashSet};

use flotilla_domain::{GroupId, PodId, SessionId};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    members: HashMap<GroupId, HashSet<PodId>>,
    /// Memberships created through each session, so a disconnect can flush
    /// exactly what that session owned.
    by_session: HashMap<SessionId, HashSet<(GroupId, PodId)>>,
    groups_of: HashMap<PodId, HashSet<GroupId>>,
}

impl Inner {
    fn remove(&mut self, group: &GroupId, pod: &PodId) {
        if let Some(set) = self.members.get_mut(group) {
            set.remove(pod);
            if set.is_empty() {
                self.members.remove(group);
            }
        }
        if let Some(set) = self.groups_of.get_mut(pod) {
            set.remove(group);
            if set.is_empty() {
                self.groups_of.remove(pod);
            }
        }
    }
}

/// Pod group membership, held only for the lifetime of the owning sessions.
/// Groups exist while they have members; nothing here is persisted.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    inner: RwLock<Inner>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, session: &SessionId, pod: &PodId, group: &GroupId) {
        let mut guard = self.inner.write().await;
        guard.members.entry(group.clone()).or_default().insert(pod.clone());
        guard.groups_of.entry(pod.clone()).or_default().insert(group.clone());
        guard
            .by_session
            .entry(session.clone())
            .or_default()
            .insert((group.clone(), pod.clone()));
    }

    pub async fn leave(&self, session: &SessionId, pod: &PodId, group: &GroupId) {
        let mut guard = self.inner.write().await;
        guard.remove(group, pod);
        if let Some(owned) = guard.by_session.get_mut(session) {
            owned.remove(&(group.clone(), pod.clone()));
        }
    }

    /// Remove the pod from every group. Returns the groups it left.
    pub async fn leave_all(&self, session: &SessionId, pod: &PodId) -> Vec<GroupId> {
        let mut guard = self.inner.write().await;
        let groups: Vec<GroupId> = guard
            .groups_of
            .get(pod)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for group in &groups {
            guard.remove(group, pod);
        }
        if let Some(owned) = guard.by_session.get_mut(session) {
            owned.retain(|(_, p)| p != pod);
        }
        groups
    }

    pub async fn pods_in(&self, group: &GroupId) -> Vec<PodId> {
        let guard = self.inner.read().await;
        let mut pods: Vec<PodId> = guard
            .members
            .get(group)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        pods.sort();
        pods
    }

    pub async fn groups_of(&self, pod: &PodId) -> Vec<GroupId> {
        let guard = self.inner.read().await;
        let mut groups: Vec<GroupId> = guard
            .groups_of
            .get(pod)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Drop every membership the session owned. Called on disconnect.
    pub async fn flush_session(&self, session: &SessionId) {
        let mut guard = self.inner.write().await;
        let owned = guard.by_session.remove(session).unwrap_or_default();
        if !owned.is_empty() {
            debug!(session = %session, memberships = owned.len(), "flushing group memberships");
        }
        for (group, pod) in owned {
            guard.remove(&group, &pod);
        }
    }
}
