use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cluster_sim::config::{default_workers, SimConfig, WorkerSpec};
use cluster_sim::dashboard::{run_dashboard, DashboardState};
use cluster_sim::shutdown::install_shutdown_handler;
use cluster_sim::worker::probe::{ResourceProbe, SimulatedProbe, UnavailableProbe};
use cluster_sim::rng::SimRng;
use cluster_sim::{Cluster, SimError};

#[derive(Parser, Debug)]
#[command(name = "cluster-sim")]
#[command(version)]
#[command(about = "Simulated GPU cluster with heartbeats, fault recovery and a live dashboard")]
struct Args {
    /// Jobs generated per minute (0.1 to 50)
    #[arg(long, default_value = "2.0")]
    job_rate: f64,

    /// Seed for all simulated randomness (omit for a fresh run each time)
    #[arg(long)]
    seed: Option<u64>,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Retries allowed after the first failed attempt
    #[arg(long, default_value = "3")]
    retry_limit: u32,

    /// Seconds a job may run before it is force-failed
    #[arg(long, default_value = "300")]
    job_timeout_secs: u64,

    #[arg(long, default_value = "2000")]
    heartbeat_interval_ms: u64,

    /// Silence after which a worker is declared failed
    #[arg(long, default_value = "10000")]
    heartbeat_timeout_ms: u64,

    /// Worker to start with, format "id:failure_rate" (repeatable).
    /// Replaces the eight default GPU nodes when given.
    /// Example: --worker gpu-a:0.05 --worker gpu-b:0.2
    #[arg(long = "worker")]
    workers: Vec<String>,

    /// Source of worker resource snapshots
    #[arg(long, default_value = "simulated")]
    probe: ProbeKind,
}

#[derive(Debug, Clone, ValueEnum)]
enum ProbeKind {
    Simulated,
    /// Every snapshot fails, forcing round-robin placement
    Unavailable,
}

fn parse_workers(specs: &[String]) -> Result<Vec<WorkerSpec>, SimError> {
    if specs.is_empty() {
        return Ok(default_workers());
    }
    specs.iter().map(|spec| spec.parse()).collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SimConfig {
        job_rate_per_minute: args.job_rate,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        heartbeat_timeout_ms: args.heartbeat_timeout_ms,
        job_timeout_ms: Duration::from_secs(args.job_timeout_secs).as_millis() as u64,
        retry_limit: args.retry_limit,
        seed: args.seed,
        workers: parse_workers(&args.workers)?,
        ..SimConfig::default()
    };

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let probe: Arc<dyn ResourceProbe> = match args.probe {
        ProbeKind::Simulated => Arc::new(SimulatedProbe::new(SimRng::new(
            args.seed.map(|s| s.wrapping_add(1)),
        ))),
        ProbeKind::Unavailable => Arc::new(UnavailableProbe),
    };

    tracing::info!(
        job_rate = config.job_rate_per_minute,
        workers = ?config.workers.iter().map(|w| format!("{}:{}", w.worker_id, w.failure_rate)).collect::<Vec<_>>(),
        dashboard_addr = ?dashboard_addr,
        seed = ?config.seed,
        "Starting cluster simulation"
    );

    let cluster = Arc::new(Cluster::builder(config).probe(probe).build()?);
    let shutdown = cluster.shutdown_token();
    install_shutdown_handler(shutdown.clone())?;

    let mut handles = cluster.start();

    if let Some(addr) = dashboard_addr {
        let state = DashboardState::new(cluster.clone()).await;
        handles.push(tokio::spawn(run_dashboard(addr, state, shutdown.clone())));
    }

    shutdown.cancelled().await;
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Task ended abnormally");
        }
    }

    let stats = cluster.stats().await;
    tracing::info!(
        total_jobs = stats.total_jobs,
        completed = stats.completed_jobs,
        abandoned = stats.abandoned_jobs,
        worker_failures = stats.worker_failures,
        avg_latency_ms = ?stats.avg_latency_ms,
        "Simulation stopped"
    );

    Ok(())
}
