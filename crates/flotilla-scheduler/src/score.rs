use std::collections::HashMap;

use flotilla_domain::{tolerated, Node, NodeId, Pod, TaintEffect};

/// Weights of the placement score terms.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub resource: f64,
    pub spread: f64,
    pub affinity: f64,
    pub taint_penalty: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights { resource: 0.5, spread: 0.3, affinity: 0.2, taint_penalty: 0.2 }
    }
}

/// Score a filter-surviving node for a pod:
/// `w_res·free_fraction + w_spread·(1 − load_share) + w_aff·matches − w_taint·prefer_penalty`.
///
/// Deterministic; callers tie-break equal scores by lower node id so a
/// reschedule of the same pod lands on the same node.
pub fn score_node(
    node: &Node,
    pod: &Pod,
    pod_count_per_node: &HashMap<NodeId, usize>,
    total_placed_pods: usize,
    weights: &ScoreWeights,
) -> f64 {
    let free = node.allocatable.free_fraction(&node.allocated);

    let load_share = if total_placed_pods == 0 {
        0.0
    } else {
        pod_count_per_node.get(&node.id).copied().unwrap_or(0) as f64 / total_placed_pods as f64
    };

    let matches = if pod.preferred_labels.is_empty() {
        0.0
    } else {
        let hit = pod
            .preferred_labels
            .iter()
            .filter(|&(k, v)| node.labels.get(k) == Some(v))
            .count();
        hit as f64 / pod.preferred_labels.len() as f64
    };

    let prefer_penalty = node
        .taints
        .iter()
        .any(|t| t.effect == TaintEffect::PreferNoSchedule && !tolerated(t, &pod.tolerations));
    let penalty = if prefer_penalty { 1.0 } else { 0.0 };

    weights.resource * free + weights.spread * (1.0 - load_share) + weights.affinity * matches
        - weights.taint_penalty * penalty
}
