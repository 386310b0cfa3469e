//! Crucible master server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crucible_config::formats::FormatRegistry;
use crucible_config::system::SystemConfig;
use crucible_core::hooks::{AllowAllPolicy, NoopNotifier, NoopStatusReporter};
use crucible_core::store::{LeaderLock, Stores};
use crucible_db::{MemoryLeaderLock, PgLeaderLock, create_pool, memory_stores, pg_stores, run_migrations};
use crucible_executor::bus::EventBus;
use crucible_executor::cache::DirCache;
use crucible_executor::process::ProcessRunner;
use crucible_executor::run::{Executor, ExecutorDeps};
use crucible_executor::scm::GitProvider;
use crucible_executor::secrets::{SecretCipher, SecretVault};
use crucible_executor::steps::StepRegistry;
use crucible_scheduler::leader::{LeaderLoop, SingletonFactory};
use crucible_scheduler::runner::OrphanMonitor;
use crucible_scheduler::retention::RetentionScanner;
use crucible_scheduler::{AgentRegistry, BreakerRegistry, BuildRunner, Dispatcher, QueueProcessor};
use crucible_server::{AppState, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SystemConfig::from_env();
    let instance_id = uuid::Uuid::now_v7().to_string();
    info!(instance_id, "starting crucible master");

    // Engine selection: Postgres when configured, embedded otherwise.
    let (stores, leader_lock): (Stores, Arc<dyn LeaderLock>) = match &config.database_url {
        Some(url) => {
            info!("connecting to database");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            (pg_stores(pool), Arc::new(PgLeaderLock::new(url.clone())))
        }
        None => {
            warn!("no DATABASE_URL configured, running on the embedded in-memory engine");
            (memory_stores(), Arc::new(MemoryLeaderLock))
        }
    };

    let bus = Arc::new(EventBus::new(stores.events.clone()));
    let process_runner = Arc::new(ProcessRunner::new());
    let vault = match &config.master_key_b64 {
        Some(key) => Some(Arc::new(SecretVault::new(
            SecretCipher::from_b64(key)?,
            stores.secrets.clone(),
        ))),
        None => {
            warn!("no master key configured, secret injection disabled");
            None
        }
    };

    let executor = Executor::new(ExecutorDeps {
        stores: stores.clone(),
        bus: bus.clone(),
        config: config.clone(),
        formats: Arc::new(FormatRegistry::with_defaults()),
        registry: Arc::new(StepRegistry::with_defaults(process_runner.clone())),
        scm: Some(Arc::new(GitProvider::new(process_runner))),
        policy: Arc::new(AllowAllPolicy),
        notifier: Arc::new(NoopNotifier),
        scm_status: Arc::new(NoopStatusReporter),
        vault,
        approval_poll: Duration::from_millis(500),
    });

    let runner = BuildRunner::new(executor, stores.clone(), config.max_local_builds);
    let registry = Arc::new(AgentRegistry::new(
        Some(stores.agents.clone()),
        config.heartbeat_stale,
    ));
    registry.hydrate_from_store().await?;
    let breakers = Arc::new(BreakerRegistry::new(Default::default()));
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        stores.clone(),
        registry.clone(),
        breakers,
        runner.clone(),
    ));

    // Builds a previous master left running with no agent are failed before
    // anything new is scheduled.
    BuildRunner::recover_interrupted(&stores).await?;

    // Singleton schedulers run on whichever master holds the leader lock.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let factory: SingletonFactory = {
        let stores = stores.clone();
        let dispatcher = dispatcher.clone();
        let registry = registry.clone();
        let config = config.clone();
        let instance_id = instance_id.clone();
        Arc::new(move |stop: watch::Receiver<bool>| {
            let mut tasks = Vec::new();
            if config.queue_enabled {
                let processor = QueueProcessor::new(
                    stores.clone(),
                    dispatcher.clone(),
                    format!("drainer-{instance_id}"),
                );
                tasks.push(tokio::spawn(processor.run(stop.clone())));
            }
            let monitor = OrphanMonitor::new(
                stores.clone(),
                registry.clone(),
                config.heartbeat_stale,
                config.orphan_grace,
                Duration::from_secs(30),
            );
            tasks.push(tokio::spawn(monitor.run(stop.clone())));
            let retention = RetentionScanner::new(
                stores.clone(),
                DirCache::new(config.cache_root.clone()),
                Duration::from_secs(config.event_ttl_days as u64 * 24 * 3600),
                Duration::from_secs(config.cache_max_age_days as u64 * 24 * 3600),
                config.cache_max_total_bytes as i64,
                Duration::from_secs(300),
            );
            tasks.push(tokio::spawn(retention.run(stop)));
            tasks
        })
    };
    let leader_loop = LeaderLoop::new(leader_lock, "crucible-singletons", config.leader_poll, factory);
    tokio::spawn(leader_loop.run(shutdown_rx));

    let started = Arc::new(AtomicBool::new(false));
    let state = AppState {
        config: config.clone(),
        stores,
        bus,
        runner,
        dispatcher,
        registry,
        instance_id,
        started: started.clone(),
    };

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(&config.listen_addr).await?;
    started.store(true, Ordering::Release);
    info!(addr = %config.listen_addr, "master listening");
    axum::serve(listener, app).await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}
