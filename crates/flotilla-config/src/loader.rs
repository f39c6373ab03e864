use std::net::SocketAddr;
use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawConfig;

/// Validated control-plane configuration. Durations are plain integers
/// here; the binary converts them into the component config types.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Namespaces ensured at startup.
    pub namespaces: Vec<String>,
    pub lease: LeaseSettings,
    pub scheduler: SchedulerSettings,
    pub controller: ControllerSettings,
    pub session: SessionSettings,
    pub router: RouterSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSettings {
    pub cadence_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub lease_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub bind_deadline_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub weights: WeightSettings,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSettings {
    pub resource: f64,
    pub spread: f64,
    pub affinity: f64,
    pub taint_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub cadence_ms: u64,
    pub pass_deadline_ms: u64,
    pub crash_loop_threshold: u32,
    pub failure_backoff_base_secs: u64,
    pub failure_backoff_cap_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub inbound_queue: usize,
    pub outbound_queue: usize,
    pub max_frame_len: usize,
    pub heartbeat_deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSettings {
    pub readiness_window_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:7600".parse().expect("static default address"),
            namespaces: vec!["default".to_string()],
            lease: LeaseSettings {
                cadence_secs: 30,
                heartbeat_timeout_secs: 60,
                lease_timeout_secs: 120,
            },
            scheduler: SchedulerSettings {
                workers: 0, // 0 = one per CPU
                bind_deadline_ms: 2_000,
                backoff_base_ms: 1_000,
                backoff_cap_ms: 30_000,
                weights: WeightSettings {
                    resource: 0.5,
                    spread: 0.3,
                    affinity: 0.2,
                    taint_penalty: 0.2,
                },
            },
            controller: ControllerSettings {
                cadence_ms: 5_000,
                pass_deadline_ms: 30_000,
                crash_loop_threshold: 3,
                failure_backoff_base_secs: 30,
                failure_backoff_cap_secs: 900,
            },
            session: SessionSettings {
                inbound_queue: 64,
                outbound_queue: 64,
                max_frame_len: 1024 * 1024,
                heartbeat_deadline_ms: 5_000,
            },
            router: RouterSettings { readiness_window_secs: 60 },
        }
    }
}

/// Load configuration: defaults, overlaid with the YAML file when present,
/// then validated.
pub fn load(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let raw = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            debug!(path = %path.display(), "loading configuration file");
            serde_yaml::from_str::<RawConfig>(&content).map_err(|e| ConfigError::YamlParse {
                path: path.display().to_string(),
                source: e,
            })?
        }
        None => RawConfig::default(),
    };
    merge(raw)
}

fn merge(raw: RawConfig) -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    if let Some(bind) = raw.bind {
        config.bind = bind.parse().map_err(|_| ConfigError::Invalid {
            field: "bind",
            message: format!("'{}' is not a socket address", bind),
        })?;
    }
    if let Some(namespaces) = raw.namespaces {
        config.namespaces = namespaces;
    }

    if let Some(lease) = raw.lease {
        if let Some(v) = lease.cadence_secs {
            config.lease.cadence_secs = v;
        }
        if let Some(v) = lease.heartbeat_timeout_secs {
            config.lease.heartbeat_timeout_secs = v;
        }
        if let Some(v) = lease.lease_timeout_secs {
            config.lease.lease_timeout_secs = v;
        }
    }

    if let Some(scheduler) = raw.scheduler {
        if let Some(v) = scheduler.workers {
            config.scheduler.workers = v;
        }
        if let Some(v) = scheduler.bind_deadline_ms {
            config.scheduler.bind_deadline_ms = v;
        }
        if let Some(v) = scheduler.backoff_base_ms {
            config.scheduler.backoff_base_ms = v;
        }
        if let Some(v) = scheduler.backoff_cap_ms {
            config.scheduler.backoff_cap_ms = v;
        }
        if let Some(weights) = scheduler.weights {
            if let Some(v) = weights.resource {
                config.scheduler.weights.resource = v;
            }
            if let Some(v) = weights.spread {
                config.scheduler.weights.spread = v;
            }
            if let Some(v) = weights.affinity {
                config.scheduler.weights.affinity = v;
            }
            if let Some(v) = weights.taint_penalty {
                config.scheduler.weights.taint_penalty = v;
            }
        }
    }

    if let Some(controller) = raw.controller {
        if let Some(v) = controller.cadence_ms {
            config.controller.cadence_ms = v;
        }
        if let Some(v) = controller.pass_deadline_ms {
            config.controller.pass_deadline_ms = v;
        }
        if let Some(v) = controller.crash_loop_threshold {
            config.controller.crash_loop_threshold = v;
        }
        if let Some(v) = controller.failure_backoff_base_secs {
            config.controller.failure_backoff_base_secs = v;
        }
        if let Some(v) = controller.failure_backoff_cap_secs {
            config.controller.failure_backoff_cap_secs = v;
        }
    }

    if let Some(session) = raw.session {
        if let Some(v) = session.inbound_queue {
            config.session.inbound_queue = v;
        }
        if let Some(v) = session.outbound_queue {
            config.session.outbound_queue = v;
        }
        if let Some(v) = session.max_frame_len {
            config.session.max_frame_len = v;
        }
        if let Some(v) = session.heartbeat_deadline_ms {
            config.session.heartbeat_deadline_ms = v;
        }
    }

    if let Some(router) = raw.router {
        if let Some(v) = router.readiness_window_secs {
            config.router.readiness_window_secs = v;
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.namespaces.is_empty() {
        return Err(ConfigError::Invalid {
            field: "namespaces",
            message: "at least one namespace is required".into(),
        });
    }
    if config.lease.heartbeat_timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            field: "lease.heartbeat_timeout_secs",
            message: "must be positive".into(),
        });
    }
    if config.lease.lease_timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            field: "lease.lease_timeout_secs",
            message: "must be positive".into(),
        });
    }
    if config.lease.cadence_secs == 0 {
        return Err(ConfigError::Invalid {
            field: "lease.cadence_secs",
            message: "must be positive".into(),
        });
    }
    if config.session.inbound_queue == 0 || config.session.outbound_queue == 0 {
        return Err(ConfigError::Invalid {
            field: "session.inbound_queue",
            message: "queues must hold at least one frame".into(),
        });
    }
    let weights = &config.scheduler.weights;
    let weight_fields: [(&'static str, f64); 4] = [
        ("scheduler.weights.resource", weights.resource),
        ("scheduler.weights.spread", weights.spread),
        ("scheduler.weights.affinity", weights.affinity),
        ("scheduler.weights.taint_penalty", weights.taint_penalty),
    ];
    for (field, value) in weight_fields {
        if !(0.0..=10.0).contains(&value) {
            return Err(ConfigError::Invalid {
                field,
                message: format!("{} is out of range", value),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_load_without_a_file() {
        let config = load(None).unwrap();
        assert_eq!(config.lease.heartbeat_timeout_secs, 60);
        assert_eq!(config.lease.lease_timeout_secs, 120);
        assert_eq!(config.controller.crash_loop_threshold, 3);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bind: \"127.0.0.1:9000\"\nlease:\n  heartbeat_timeout_secs: 15\nscheduler:\n  workers: 2"
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.lease.heartbeat_timeout_secs, 15);
        assert_eq!(config.lease.lease_timeout_secs, 120, "untouched values stay default");
        assert_eq!(config.scheduler.workers, 2);
    }

    #[test]
    fn bad_bind_address_is_a_field_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind: \"not-an-address\"").unwrap();

        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "bind", .. }));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lease:\n  heartbeat_seconds: 15").unwrap();
        assert!(matches!(load(Some(file.path())), Err(ConfigError::YamlParse { .. })));
    }

    #[test]
    fn zero_lease_timeout_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lease:\n  lease_timeout_secs: 0").unwrap();
        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "lease.lease_timeout_secs", .. }
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load(Some(Path::new("/no/such/flotilla.yml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
