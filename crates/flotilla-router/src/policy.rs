/// Verdict from the network policy engine.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        PolicyDecision { allowed: true, reason: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision { allowed: false, reason: Some(reason.into()) }
    }
}

/// Gate consulted before every routing decision. The production policy
/// engine lives outside the core and is plugged in here; the default admits
/// everything.
pub trait RoutePolicy: Send + Sync + 'static {
    fn evaluate(&self, caller_service: &str, target_service: &str) -> PolicyDecision;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RoutePolicy for AllowAll {
    fn evaluate(&self, _caller_service: &str, _target_service: &str) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// Static deny-list keyed by target service. Useful in tests and as a
/// reference implementation of the trait.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    pub blocked_targets: Vec<String>,
}

impl RoutePolicy for DenyList {
    fn evaluate(&self, _caller_service: &str, target_service: &str) -> PolicyDecision {
        if self.blocked_targets.iter().any(|t| t == target_service) {
            PolicyDecision::deny(format!("target {} is blocked by policy", target_service))
        } else {
            PolicyDecision::allow()
        }
    }
}
