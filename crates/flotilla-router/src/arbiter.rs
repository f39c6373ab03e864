use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flotilla_domain::{NodeId, Pod, PodId, PodPhase};
use flotilla_store::ClusterStore;
use tokio::sync::Mutex;
use tracing::debug;

use crate::policy::RoutePolicy;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// A running pod counts as healthy only if the agent reported its status
    /// within this window.
    pub readiness_window: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig { readiness_window: Duration::seconds(60) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDenial {
    PolicyDenied(String),
    NoHealthyTarget,
    UnknownService,
}

impl std::fmt::Display for RouteDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteDenial::PolicyDenied(reason) => write!(f, "denied by policy: {}", reason),
            RouteDenial::NoHealthyTarget => write!(f, "no healthy target pod"),
            RouteDenial::UnknownService => write!(f, "unknown target service"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub allowed: bool,
    pub target: Option<(PodId, NodeId)>,
    pub denial: Option<RouteDenial>,
}

impl RouteDecision {
    fn denied(denial: RouteDenial) -> Self {
        RouteDecision { allowed: false, target: None, denial: Some(denial) }
    }
}

/// Per-service selection memory: a rolling sequence and the last sequence
/// number each pod was handed out at.
#[derive(Debug, Default)]
struct SelectionState {
    seq: u64,
    last_selected: HashMap<PodId, u64>,
}

/// Answers target-pod selection for pod-to-pod calls.
///
/// The arbiter never proxies traffic: it returns the chosen (pod, node)
/// pair and the caller's agent opens its own data channel. Stickiness is
/// cached on the agent; the only server-side state is the fairness counter.
pub struct RouteArbiter {
    store: Arc<ClusterStore>,
    policy: Arc<dyn RoutePolicy>,
    config: RouterConfig,
    selection: Mutex<HashMap<String, SelectionState>>,
}

impl RouteArbiter {
    pub fn new(store: Arc<ClusterStore>, policy: Arc<dyn RoutePolicy>, config: RouterConfig) -> Self {
        RouteArbiter { store, policy, config, selection: Mutex::new(HashMap::new()) }
    }

    pub async fn route(&self, caller_service: &str, target_service: &str) -> RouteDecision {
        self.route_at(caller_service, target_service, Utc::now()).await
    }

    pub async fn route_at(
        &self,
        caller_service: &str,
        target_service: &str,
        now: DateTime<Utc>,
    ) -> RouteDecision {
        // Policy gate first; a deny must not mutate selection state.
        let verdict = self.policy.evaluate(caller_service, target_service);
        if !verdict.allowed {
            return RouteDecision::denied(RouteDenial::PolicyDenied(
                verdict.reason.unwrap_or_else(|| "policy denied".into()),
            ));
        }

        let Some(workload) = self
            .store
            .workloads()
            .await
            .into_iter()
            .find(|w| w.service_id() == target_service)
        else {
            return RouteDecision::denied(RouteDenial::UnknownService);
        };

        let healthy: Vec<Pod> = self
            .store
            .pods_of_workload(&workload.id)
            .await
            .into_iter()
            .filter(|p| self.is_healthy(p, now))
            .collect();
        if healthy.is_empty() {
            return RouteDecision::denied(RouteDenial::NoHealthyTarget);
        }

        let mut guard = self.selection.lock().await;
        let state = guard.entry(target_service.to_string()).or_default();
        state
            .last_selected
            .retain(|pod_id, _| healthy.iter().any(|p| &p.id == pod_id));

        // Least-recently-selected, tie-break on lower pod id for stability.
        let chosen = healthy
            .iter()
            .min_by_key(|p| (state.last_selected.get(&p.id).copied().unwrap_or(0), p.id.clone()))
            .cloned();
        let Some(pod) = chosen else {
            return RouteDecision::denied(RouteDenial::NoHealthyTarget);
        };
        state.seq += 1;
        state.last_selected.insert(pod.id.clone(), state.seq);
        drop(guard);

        let Some(node_id) = pod.node_id.clone() else {
            return RouteDecision::denied(RouteDenial::NoHealthyTarget);
        };
        self.store.counters().inc_routes_served();
        debug!(
            caller = caller_service,
            target = target_service,
            pod_id = %pod.id,
            node_id = %node_id,
            "route selected"
        );
        RouteDecision { allowed: true, target: Some((pod.id, node_id)), denial: None }
    }

    fn is_healthy(&self, pod: &Pod, now: DateTime<Utc>) -> bool {
        if pod.phase != PodPhase::Running {
            return false;
        }
        let freshest = pod.last_reported_at.or(pod.started_at);
        freshest.is_some_and(|at| now - at <= self.config.readiness_window)
    }
}
