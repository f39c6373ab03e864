use serde::Deserialize;

/// On-disk YAML shape. Every field is optional; missing values take the
/// built-in defaults in the loader.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub bind: Option<String>,
    pub namespaces: Option<Vec<String>>,
    pub lease: Option<RawLease>,
    pub scheduler: Option<RawScheduler>,
    pub controller: Option<RawController>,
    pub session: Option<RawSession>,
    pub router: Option<RawRouter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLease {
    pub cadence_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub lease_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawScheduler {
    pub workers: Option<usize>,
    pub bind_deadline_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub weights: Option<RawWeights>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWeights {
    pub resource: Option<f64>,
    pub spread: Option<f64>,
    pub affinity: Option<f64>,
    pub taint_penalty: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawController {
    pub cadence_ms: Option<u64>,
    pub pass_deadline_ms: Option<u64>,
    pub crash_loop_threshold: Option<u32>,
    pub failure_backoff_base_secs: Option<u64>,
    pub failure_backoff_cap_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSession {
    pub inbound_queue: Option<usize>,
    pub outbound_queue: Option<usize>,
    pub max_frame_len: Option<usize>,
    pub heartbeat_deadline_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRouter {
    pub readiness_window_secs: Option<u64>,
}
