use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::error::SimError;
use crate::rng::SimRng;
use crate::scheduler::job::{FailureReason, JobParams, JobType};
use crate::state::{Assignment, ClusterState, RecoveryTicket};

/// Iterations a simulated GPU gets through per second.
const COMPUTE_ITERATIONS_PER_SEC: f64 = 200_000.0;
/// Run time of a 1000x1000 matrix multiplication.
const MATRIX_BASE_SECS: f64 = 2.0;

/// Executes one job type.
///
/// New job types are added by implementing this trait and registering the
/// handler in a [`HandlerRegistry`] before the cluster starts.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Simulated run time for `params`.
    fn duration(&self, params: &JobParams) -> Duration;

    /// Run the job. `Err` carries the failure message.
    async fn execute(&self, job_id: &str, params: &JobParams) -> Result<String, String>;
}

fn mismatch(expected: JobType, params: &JobParams) -> String {
    format!(
        "{} handler cannot run {} parameters",
        expected,
        params.job_type()
    )
}

#[derive(Debug, Default, Clone)]
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    fn job_type(&self) -> JobType {
        JobType::Sleep
    }

    fn duration(&self, params: &JobParams) -> Duration {
        match params {
            JobParams::Sleep { duration_ms } => Duration::from_millis(*duration_ms),
            _ => Duration::ZERO,
        }
    }

    async fn execute(&self, _job_id: &str, params: &JobParams) -> Result<String, String> {
        let JobParams::Sleep { duration_ms } = params else {
            return Err(mismatch(JobType::Sleep, params));
        };
        tokio::time::sleep(self.duration(params)).await;
        Ok(format!("Slept for {} ms", duration_ms))
    }
}

#[derive(Debug, Default, Clone)]
pub struct ComputeHandler;

#[async_trait]
impl JobHandler for ComputeHandler {
    fn job_type(&self) -> JobType {
        JobType::Compute
    }

    fn duration(&self, params: &JobParams) -> Duration {
        match params {
            JobParams::Compute { iterations } => {
                Duration::from_secs_f64(*iterations as f64 / COMPUTE_ITERATIONS_PER_SEC)
            }
            _ => Duration::ZERO,
        }
    }

    async fn execute(&self, _job_id: &str, params: &JobParams) -> Result<String, String> {
        let JobParams::Compute { iterations } = params else {
            return Err(mismatch(JobType::Compute, params));
        };
        tokio::time::sleep(self.duration(params)).await;
        Ok(format!("Computed {} iterations", iterations))
    }
}

#[derive(Debug, Default, Clone)]
pub struct MatrixHandler;

#[async_trait]
impl JobHandler for MatrixHandler {
    fn job_type(&self) -> JobType {
        JobType::Matrix
    }

    fn duration(&self, params: &JobParams) -> Duration {
        match params {
            JobParams::Matrix { matrix_size } => {
                let scale = *matrix_size as f64 / 1000.0;
                Duration::from_secs_f64(MATRIX_BASE_SECS * scale * scale)
            }
            _ => Duration::ZERO,
        }
    }

    async fn execute(&self, _job_id: &str, params: &JobParams) -> Result<String, String> {
        let JobParams::Matrix { matrix_size } = params else {
            return Err(mismatch(JobType::Matrix, params));
        };
        tokio::time::sleep(self.duration(params)).await;
        Ok(format!(
            "Matrix multiplication completed: ({}, {})",
            matrix_size, matrix_size
        ))
    }
}

/// Fails on purpose with the job's own failure probability, independent of
/// worker health.
#[derive(Debug, Clone)]
pub struct FaultInjectionHandler {
    rng: SimRng,
}

impl FaultInjectionHandler {
    pub fn new(rng: SimRng) -> Self {
        Self { rng }
    }
}

#[async_trait]
impl JobHandler for FaultInjectionHandler {
    fn job_type(&self) -> JobType {
        JobType::FaultInjection
    }

    fn duration(&self, params: &JobParams) -> Duration {
        match params {
            JobParams::FaultInjection { duration_ms, .. } => Duration::from_millis(*duration_ms),
            _ => Duration::ZERO,
        }
    }

    async fn execute(&self, job_id: &str, params: &JobParams) -> Result<String, String> {
        let JobParams::FaultInjection {
            failure_probability,
            duration_ms,
        } = params
        else {
            return Err(mismatch(JobType::FaultInjection, params));
        };
        if self.rng.chance(*failure_probability) {
            return Err(format!("Simulated failure in job {}", job_id));
        }
        tokio::time::sleep(self.duration(params)).await;
        Ok(format!(
            "Fault injection job completed after {} ms",
            duration_ms
        ))
    }
}

/// Table of job handlers, built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for the four built-in job types.
    pub fn with_defaults(rng: SimRng) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SleepHandler));
        registry.register(Arc::new(ComputeHandler));
        registry.register(Arc::new(MatrixHandler));
        registry.register(Arc::new(FaultInjectionHandler::new(rng)));
        registry
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }
}

/// How an execution unit ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(FailureReason),
    /// Another path (worker failure, deadline sweep) ended the attempt first.
    Cancelled,
    /// The report arrived after the attempt had already ended.
    Discarded,
}

/// Runs assigned jobs against the handler table and reports the result.
#[derive(Clone)]
pub struct JobExecutor {
    handlers: HandlerRegistry,
}

impl JobExecutor {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self { handlers }
    }

    /// Execute a job's handler without touching cluster state.
    pub async fn execute(&self, job_id: &str, params: &JobParams) -> Result<String, String> {
        let job_type = params.job_type();
        let handler = self
            .handlers
            .get(job_type)
            .ok_or_else(|| format!("No handler registered for job type: {}", job_type))?;
        handler.execute(job_id, params).await
    }

    /// Execution unit for one attempt.
    ///
    /// Races the handler against the job deadline and the attempt's cancel
    /// token, then reports to the cluster state. The state accepts only the
    /// first terminal report for an attempt.
    pub async fn run(
        &self,
        assignment: Assignment,
        state: Arc<RwLock<ClusterState>>,
        recovery_tx: mpsc::UnboundedSender<RecoveryTicket>,
    ) -> ExecutionOutcome {
        let Assignment {
            job_id,
            worker_id,
            attempt,
            params,
            deadline,
            cancel,
        } = assignment;

        tracing::debug!(job_id = %job_id, worker_id = %worker_id, attempt, "Executing job");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExecutionOutcome::Cancelled,
            res = self.execute(&job_id, &params) => res.map_err(FailureReason::ExecutionError),
            _ = tokio::time::sleep_until(deadline) => Err(FailureReason::Timeout),
        };

        let report = {
            let mut state = state.write().await;
            match &result {
                Ok(_) => state
                    .complete(&job_id, &worker_id, attempt, Instant::now())
                    .map(|_| None),
                Err(reason) => state
                    .fail(&job_id, &worker_id, attempt, reason.clone())
                    .map(Some),
            }
        };

        match report {
            Ok(Some(ticket)) => {
                if recovery_tx.send(ticket).is_err() {
                    tracing::debug!(job_id = %job_id, "Recovery channel closed");
                }
                match result {
                    Err(reason) => ExecutionOutcome::Failed(reason),
                    Ok(_) => ExecutionOutcome::Completed,
                }
            }
            Ok(None) => ExecutionOutcome::Completed,
            Err(SimError::StaleReport(_)) => {
                tracing::debug!(job_id = %job_id, worker_id = %worker_id, attempt, "Discarding stale report");
                ExecutionOutcome::Discarded
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record job result");
                ExecutionOutcome::Discarded
            }
        }
    }
}
