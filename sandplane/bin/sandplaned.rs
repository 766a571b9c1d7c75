//! `sandplaned` is the sandbox control plane daemon for one worker node.

use std::{sync::Arc, time::Duration};

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use sandplane::{
    analytics::AnalyticsClient,
    cache::{EvictionDispatcher, SessionCache},
    config::{DEFAULT_SERVER_ADDR, DEFAULT_SESSION_TTL, DEFAULT_TEAM_SANDBOX_LIMIT, EnvConfig},
    network::{HostsFile, NetnsWorker, NetworkBuilder},
    orchestration::{Orchestrator, OrchestratorSettings, TeardownPipeline},
    runtime::TaskStore,
    server::{self, ServerState},
    slot::{HttpKvStore, KvStore, MemoryKvStore, SlotAllocator},
    vm::VmLauncher,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Sandbox control plane daemon.
#[derive(Debug, Parser)]
#[command(name = "sandplaned", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
    listen: String,

    /// This worker node's id.
    #[arg(long)]
    node_id: String,

    /// Host egress interface used for sandbox NAT rules.
    #[arg(long, default_value = "eth0")]
    egress_iface: String,

    /// Guest kernel version booted into sandboxes.
    #[arg(long, default_value = "6.1.102")]
    kernel_version: String,

    /// Hypervisor version string, e.g. `v1.7.0_a1b2c3d`.
    #[arg(long, default_value = "v1.7.0")]
    firecracker_version: String,

    /// Request huge-page memory backing when the hypervisor supports it.
    #[arg(long)]
    huge_pages: bool,

    /// Per-team concurrent sandbox limit.
    #[arg(long, default_value_t = DEFAULT_TEAM_SANDBOX_LIMIT)]
    team_limit: usize,

    /// Grace period for draining teardowns on shutdown, in seconds.
    #[arg(long, default_value_t = 15)]
    shutdown_grace_secs: u64,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let env = EnvConfig::from_env();

    // Fatal init failures below (unreachable KV binary paths, missing
    // hypervisor, failed worker thread) exit non-zero before serving.
    let kv: Arc<dyn KvStore> = match env.get_kv_address() {
        Some(address) => {
            tracing::info!(address, "using external KV store for slot reservations");
            Arc::new(HttpKvStore::new(address.clone(), env.get_kv_token().clone()))
        }
        None => {
            tracing::warn!("no KV address configured, slot reservations are process-local");
            Arc::new(MemoryKvStore::new())
        }
    };

    let allocator = Arc::new(SlotAllocator::new(kv));
    let hosts = Arc::new(HostsFile::new(env.get_hosts_file()));
    let worker = Arc::new(NetnsWorker::spawn(&args.egress_iface)?);
    let network = Arc::new(NetworkBuilder::new(
        worker,
        hosts,
        allocator.clone(),
    ));
    let launcher = Arc::new(VmLauncher::new(
        env.get_templates_dir(),
        env.get_runtime_dir(),
    )?);
    let tasks = Arc::new(TaskStore::new());

    let analytics = AnalyticsClient::new(
        env.get_analytics_endpoint().clone(),
        env.get_analytics_api_key().clone(),
    );
    let (cache, evict_rx) = SessionCache::new(DEFAULT_SESSION_TTL, analytics);

    let teardown = Arc::new(TeardownPipeline::new(
        network.clone(),
        launcher.clone(),
        tasks.clone(),
    ));
    let dispatcher = EvictionDispatcher::spawn(evict_rx, teardown);
    let expiry = cache.spawn_expiry();

    let settings = OrchestratorSettings::builder()
        .node_id(args.node_id)
        .templates_dir(env.get_templates_dir().clone())
        .team_limit(args.team_limit)
        .kernel_version(args.kernel_version)
        .firecracker_version(args.firecracker_version)
        .huge_pages(args.huge_pages)
        .build();

    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        allocator,
        network,
        launcher,
        tasks,
        cache.clone(),
    ));

    let listener = TcpListener::bind(&args.listen).await?;
    let state = ServerState::new(orchestrator.clone());

    server::serve(listener, state, shutdown_signal()).await?;

    tracing::info!("shutting down, evicting all sessions");
    orchestrator
        .shutdown(Duration::from_secs(args.shutdown_grace_secs))
        .await;

    expiry.abort();
    dispatcher.abort();

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
        }
    }
}
