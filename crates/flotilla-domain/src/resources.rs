use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Runtime tags ──────────────────────────────────────────────────────────────

/// The class of runtime an agent process provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Server,
    Browser,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Server => write!(f, "server"),
            RuntimeKind::Browser => write!(f, "browser"),
        }
    }
}

// ── Resources ─────────────────────────────────────────────────────────────────

/// A resource vector: declared capacity, a pod's request, or a node's
/// running allocation, depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub pods: u64,
    #[serde(default)]
    pub storage_bytes: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu_millis: 0,
        memory_bytes: 0,
        pods: 0,
        storage_bytes: 0,
    };

    /// True when every dimension of `request` fits within `self`.
    pub fn covers(&self, request: &Resources) -> bool {
        self.cpu_millis >= request.cpu_millis
            && self.memory_bytes >= request.memory_bytes
            && self.pods >= request.pods
            && self.storage_bytes >= request.storage_bytes
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu_millis: self.cpu_millis.checked_add(other.cpu_millis)?,
            memory_bytes: self.memory_bytes.checked_add(other.memory_bytes)?,
            pods: self.pods.checked_add(other.pods)?,
            storage_bytes: self.storage_bytes.checked_add(other.storage_bytes)?,
        })
    }

    /// Subtract `other`, flooring every dimension at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            pods: self.pods.saturating_sub(other.pods),
            storage_bytes: self.storage_bytes.saturating_sub(other.storage_bytes),
        }
    }

    /// Average free ratio across the dimensions this vector declares.
    /// Dimensions with zero capacity are skipped so a node that declares no
    /// storage is not penalised for it.
    pub fn free_fraction(&self, allocated: &Resources) -> f64 {
        let mut sum = 0.0;
        let mut dims = 0u32;
        for (cap, used) in [
            (self.cpu_millis, allocated.cpu_millis),
            (self.memory_bytes, allocated.memory_bytes),
            (self.pods, allocated.pods),
            (self.storage_bytes, allocated.storage_bytes),
        ] {
            if cap == 0 {
                continue;
            }
            sum += (cap.saturating_sub(used)) as f64 / cap as f64;
            dims += 1;
        }
        if dims == 0 {
            return 0.0;
        }
        sum / f64::from(dims)
    }
}

// ── Taints & tolerations ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    /// Effects that exclude a non-tolerating pod outright. `PreferNoSchedule`
    /// only penalises the score.
    pub fn is_hard(&self) -> bool {
        matches!(self, TaintEffect::NoSchedule | TaintEffect::NoExecute)
    }
}

/// Node-side repulsion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: Option<String>,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Key, effect and value must all match.
    Equal,
    /// Key and effect must match; any value is accepted.
    Exists,
}

/// Pod-side antidote to a taint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    pub operator: TolerationOperator,
    pub value: Option<String>,
    /// None tolerates the key under every effect.
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if self.key != taint.key {
            return false;
        }
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => self.value == taint.value,
        }
    }
}

/// True when any toleration in the set matches `taint`.
pub fn tolerated(taint: &Taint, tolerations: &[Toleration]) -> bool {
    tolerations.iter().any(|t| t.tolerates(taint))
}

/// A node selector matches when every selector key is present on the node
/// with an equal value.
pub fn selector_matches(
    selector: &HashMap<String, String>,
    labels: &HashMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
}
