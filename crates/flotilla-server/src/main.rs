use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flotilla_config::ServerConfig;
use flotilla_controller::{ControllerConfig, WorkloadController};
use flotilla_lease::{LeaseConfig, LeaseEngine};
use flotilla_router::{AllowAll, GroupRegistry, RouteArbiter, RouterConfig};
use flotilla_scheduler::{Scheduler, SchedulerConfig, ScoreWeights};
use flotilla_session::{
    serve, AnonymousVerifier, CommandPusher, SessionConfig, SessionContext, SessionRegistry,
};
use flotilla_store::{ClusterStore, MemoryBackend, StoreError};

#[derive(Debug, Parser)]
#[command(
    name = "flotilla-server",
    about = "Control plane: schedules packs as pods across a fleet of agents",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "FLOTILLA_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration.
    #[arg(long, env = "FLOTILLA_BIND")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = match flotilla_config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "control plane crashed");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(ClusterStore::new(backend));
    store
        .hydrate()
        .await
        .context("storage backend unreachable at startup")?;
    for namespace in &config.namespaces {
        match store.create_namespace(namespace).await {
            Ok(_) => info!(namespace = %namespace, "namespace ready"),
            Err(StoreError::Conflict(_)) => {}
            Err(e) => return Err(e).context("failed to ensure namespace"),
        }
    }

    let cancel = CancellationToken::new();

    let lease = Arc::new(LeaseEngine::new(
        store.clone(),
        LeaseConfig {
            cadence: chrono::Duration::seconds(config.lease.cadence_secs as i64),
            heartbeat_timeout: chrono::Duration::seconds(config.lease.heartbeat_timeout_secs as i64),
            lease_timeout: chrono::Duration::seconds(config.lease.lease_timeout_secs as i64),
        },
    ));
    tokio::spawn(lease.run(cancel.clone()));

    let workers = if config.scheduler.workers == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
    } else {
        config.scheduler.workers
    };
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        SchedulerConfig {
            workers,
            bind_deadline: std::time::Duration::from_millis(config.scheduler.bind_deadline_ms),
            backoff_base: std::time::Duration::from_millis(config.scheduler.backoff_base_ms),
            backoff_cap: std::time::Duration::from_millis(config.scheduler.backoff_cap_ms),
            weights: ScoreWeights {
                resource: config.scheduler.weights.resource,
                spread: config.scheduler.weights.spread,
                affinity: config.scheduler.weights.affinity,
                taint_penalty: config.scheduler.weights.taint_penalty,
            },
        },
    ));
    scheduler.run(cancel.clone()).await;

    let controller = Arc::new(WorkloadController::new(
        store.clone(),
        ControllerConfig {
            cadence: std::time::Duration::from_millis(config.controller.cadence_ms),
            pass_deadline: std::time::Duration::from_millis(config.controller.pass_deadline_ms),
            crash_loop_threshold: config.controller.crash_loop_threshold,
            failure_backoff_base: chrono::Duration::seconds(
                config.controller.failure_backoff_base_secs as i64,
            ),
            failure_backoff_cap: chrono::Duration::seconds(
                config.controller.failure_backoff_cap_secs as i64,
            ),
        },
    ));
    tokio::spawn(controller.run(cancel.clone()));

    let arbiter = Arc::new(RouteArbiter::new(
        store.clone(),
        Arc::new(AllowAll),
        RouterConfig {
            readiness_window: chrono::Duration::seconds(config.router.readiness_window_secs as i64),
        },
    ));
    let groups = Arc::new(GroupRegistry::new());
    let registry = Arc::new(SessionRegistry::new());

    let pusher = Arc::new(CommandPusher::new(store.clone(), registry.clone()));
    tokio::spawn(pusher.run(cancel.clone()));

    let ctx = SessionContext {
        store: store.clone(),
        arbiter,
        groups,
        registry,
        verifier: Arc::new(AnonymousVerifier),
        config: SessionConfig {
            inbound_queue: config.session.inbound_queue,
            outbound_queue: config.session.outbound_queue,
            max_frame_len: config.session.max_frame_len,
            heartbeat_deadline: std::time::Duration::from_millis(
                config.session.heartbeat_deadline_ms,
            ),
        },
    };
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "control plane ready");
    let listener_cancel = cancel.clone();
    let accept = tokio::spawn(async move { serve(listener, ctx, listener_cancel).await });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = accept.await;
    info!("shutdown complete");
    Ok(())
}
