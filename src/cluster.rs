use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{validate_job_rate, SimConfig};
use crate::error::Result;
use crate::events::{ClusterEvent, EventSink, TracingSink};
use crate::recovery::{FaultRecovery, RecoveryOutcome};
use crate::rng::SimRng;
use crate::scheduler::dispatcher::Dispatcher;
use crate::scheduler::generator::JobGenerator;
use crate::scheduler::job::{FailureReason, JobId, JobSpec, WorkerId};
use crate::snapshot::{ClusterSnapshot, JobView};
use crate::state::ClusterState;
use crate::stats::ClusterStats;
use crate::worker::executor::{HandlerRegistry, JobExecutor};
use crate::worker::heartbeat::HeartbeatMonitor;
use crate::worker::probe::{ResourceProbe, SimulatedProbe};
use crate::worker::registry::HeartbeatOutcome;

/// Assembles a [`Cluster`] with optional replacements for its collaborators.
pub struct ClusterBuilder {
    config: SimConfig,
    probe: Option<Arc<dyn ResourceProbe>>,
    sink: Option<Arc<dyn EventSink>>,
    handlers: Option<HandlerRegistry>,
}

impl ClusterBuilder {
    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Validate the config and register the configured workers.
    pub fn build(self) -> Result<Cluster> {
        self.config.validate()?;

        let rng = SimRng::new(self.config.seed);
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SimulatedProbe::new(rng.clone())));
        let handlers = self
            .handlers
            .unwrap_or_else(|| HandlerRegistry::with_defaults(rng.clone()));

        let mut state = ClusterState::new(&self.config, rng.clone(), sink.clone());
        let now = Instant::now();
        for worker in &self.config.workers {
            state.add_worker(&worker.worker_id, worker.failure_rate, now)?;
        }

        let (rate_tx, _) = watch::channel(self.config.job_rate_per_minute);

        Ok(Cluster {
            recovery: FaultRecovery::new(&self.config),
            config: self.config,
            state: Arc::new(RwLock::new(state)),
            rng,
            probe,
            executor: JobExecutor::new(handlers),
            sink,
            rate_tx,
            shutdown: CancellationToken::new(),
        })
    }
}

/// The orchestrator: owns the shared state and runs every periodic activity.
pub struct Cluster {
    config: SimConfig,
    state: Arc<RwLock<ClusterState>>,
    rng: SimRng,
    probe: Arc<dyn ResourceProbe>,
    executor: JobExecutor,
    recovery: FaultRecovery,
    sink: Arc<dyn EventSink>,
    rate_tx: watch::Sender<f64>,
    shutdown: CancellationToken,
}

impl Cluster {
    pub fn builder(config: SimConfig) -> ClusterBuilder {
        ClusterBuilder {
            config,
            probe: None,
            sink: None,
            handlers: None,
        }
    }

    /// A cluster with the simulated probe, tracing sink and built-in handlers.
    pub fn new(config: SimConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Spawn the recovery, heartbeat, scheduler and (if enabled) generator
    /// tasks. They all stop when [`Cluster::shutdown`] is called.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::new();

        let recovery = self.recovery.clone();
        handles.push(tokio::spawn(recovery.run(
            self.state.clone(),
            recovery_rx,
            self.shutdown.clone(),
        )));

        let monitor = HeartbeatMonitor::new(&self.config, self.rng.clone());
        handles.push(tokio::spawn(monitor.run(
            self.state.clone(),
            recovery_tx.clone(),
            self.shutdown.clone(),
        )));

        let dispatcher = Dispatcher::new(self.probe.clone(), self.executor.clone());
        handles.push(tokio::spawn(dispatcher.run(
            self.state.clone(),
            recovery_tx,
            self.config.scheduler_tick(),
            self.shutdown.clone(),
        )));

        if self.config.auto_generate {
            let generator = JobGenerator::new(self.rng.clone());
            handles.push(tokio::spawn(generator.run(
                self.state.clone(),
                self.rate_tx.subscribe(),
                self.shutdown.clone(),
            )));
        }

        tracing::info!(
            workers = self.config.workers.len(),
            job_rate = *self.rate_tx.borrow(),
            "Cluster simulation started"
        );
        handles
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Shared state, for callers that need a consistent multi-step view.
    pub fn state(&self) -> Arc<RwLock<ClusterState>> {
        self.state.clone()
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    /// Submit a job directly, bypassing the generator.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        self.state.write().await.submit(spec, Instant::now())
    }

    /// Change the generator's arrival rate. Takes effect from the next tick.
    pub fn set_job_rate(&self, rate: f64) -> Result<f64> {
        let rate = validate_job_rate(rate)?;
        self.rate_tx.send_replace(rate);
        self.sink.emit(ClusterEvent::JobRateChanged { rate });
        Ok(rate)
    }

    pub fn job_rate(&self) -> f64 {
        *self.rate_tx.borrow()
    }

    /// Register a worker. Without an id, one is generated.
    pub async fn add_worker(&self, worker_id: Option<String>, failure_rate: f64) -> Result<WorkerId> {
        let worker_id = worker_id.unwrap_or_else(|| {
            let uuid = Uuid::new_v4().simple().to_string();
            format!("worker-{}", &uuid[..8])
        });
        self.state
            .write()
            .await
            .add_worker(&worker_id, failure_rate, Instant::now())?;
        Ok(worker_id)
    }

    /// Crash a worker now and recover its in-flight job in the same step.
    pub async fn fail_worker(&self, worker_id: &str) -> Result<Option<RecoveryOutcome>> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        match state.fail_worker(worker_id, FailureReason::WorkerCrashed, now)? {
            Some(ticket) => self.recovery.recover(&mut state, &ticket, now).map(Some),
            None => Ok(None),
        }
    }

    /// Deliver a heartbeat from outside the monitor.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<HeartbeatOutcome> {
        self.state.write().await.heartbeat(worker_id, Instant::now())
    }

    /// Stop (or resume) a worker's heartbeats without crashing it.
    pub async fn set_heartbeats_muted(&self, worker_id: &str, muted: bool) -> Result<()> {
        self.state
            .write()
            .await
            .set_heartbeats_muted(worker_id, muted)
    }

    // ---------------------------------------------------------------------
    // Read model
    // ---------------------------------------------------------------------

    pub async fn snapshot(&self) -> ClusterSnapshot {
        let state = self.state.read().await;
        ClusterSnapshot::capture(&state, self.job_rate(), Instant::now())
    }

    pub async fn stats(&self) -> ClusterStats {
        let state = self.state.read().await;
        ClusterStats::collect(&state, Instant::now())
    }

    pub async fn job(&self, job_id: &str) -> Option<JobView> {
        let state = self.state.read().await;
        state
            .job(job_id)
            .map(|job| JobView::from_job(job, Instant::now()))
    }
}
