//! Crucible agent binary.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crucible_agent::client::{MasterClient, local_system_info};
use crucible_agent::relay::RelayEventStore;
use crucible_agent::server::{AgentState, router};
use crucible_config::formats::FormatRegistry;
use crucible_config::system::SystemConfig;
use crucible_core::hooks::{AllowAllPolicy, NoopNotifier, NoopStatusReporter};
use crucible_db::memory_stores;
use crucible_executor::bus::EventBus;
use crucible_executor::process::ProcessRunner;
use crucible_executor::run::{Executor, ExecutorDeps};
use crucible_executor::scm::GitProvider;
use crucible_executor::steps::StepRegistry;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "crucible-agent")]
#[command(about = "Crucible remote build agent", long_about = None)]
struct Cli {
    /// Master base URL
    #[arg(long, env = "CRUCIBLE_MASTER_URL")]
    master_url: String,

    /// Shared bearer token for master communication
    #[arg(long, env = "CRUCIBLE_AGENT_TOKEN")]
    token: String,

    /// Name this agent registers under
    #[arg(long, env = "CRUCIBLE_AGENT_NAME", default_value = "agent")]
    name: String,

    /// URL the master reaches this agent at
    #[arg(long, env = "CRUCIBLE_AGENT_URL", default_value = "http://127.0.0.1:9000")]
    url: String,

    /// Address to listen on
    #[arg(long, env = "CRUCIBLE_AGENT_LISTEN", default_value = "0.0.0.0:9000")]
    listen: String,

    /// Comma-separated capability labels
    #[arg(long, env = "CRUCIBLE_AGENT_LABELS", default_value = "linux")]
    labels: String,

    /// Maximum concurrent builds
    #[arg(long, env = "CRUCIBLE_AGENT_MAX_BUILDS", default_value = "2")]
    max_builds: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let client = Arc::new(MasterClient::new(&cli.master_url, &cli.token));

    // Agent-local stores are in-memory; the durable plane for events is the
    // relay back to the master.
    let stores = {
        let mut stores = memory_stores();
        let (relay, _task) = RelayEventStore::start(client.clone());
        stores.events = relay;
        stores
    };

    let mut config = SystemConfig::from_env();
    config.agent_token = cli.token.clone();
    let process_runner = Arc::new(ProcessRunner::new());
    let executor = Executor::new(ExecutorDeps {
        stores: stores.clone(),
        bus: Arc::new(EventBus::new(stores.events.clone())),
        config: config.clone(),
        formats: Arc::new(FormatRegistry::with_defaults()),
        registry: Arc::new(StepRegistry::with_defaults(process_runner.clone())),
        scm: Some(Arc::new(GitProvider::new(process_runner))),
        policy: Arc::new(AllowAllPolicy),
        notifier: Arc::new(NoopNotifier),
        scm_status: Arc::new(NoopStatusReporter),
        vault: None,
        approval_poll: Duration::from_millis(500),
    });

    let labels = cli
        .labels
        .split(',')
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    let system_info = local_system_info();
    let agent_id = client
        .register(&cli.name, &cli.url, &labels, cli.max_builds, &system_info)
        .await?;
    info!(agent_id = %agent_id, name = %cli.name, "registered with master");

    let active = Arc::new(AtomicU32::new(0));
    {
        let client = client.clone();
        let active = active.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                let info = local_system_info();
                if let Err(e) = client
                    .heartbeat(agent_id, active.load(Ordering::Relaxed), &info)
                    .await
                {
                    warn!(error = %e, "heartbeat failed");
                }
            }
        });
    }

    let state = AgentState {
        executor,
        stores,
        client,
        pool: Arc::new(Semaphore::new(cli.max_builds.max(1) as usize)),
        active,
        token: cli.token,
    };

    let listener = TcpListener::bind(&cli.listen).await?;
    info!(addr = %cli.listen, "agent listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
