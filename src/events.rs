//! Structured events emitted by the cluster core.
//!
//! The core never formats log lines itself. Every lifecycle step is reported
//! as a [`ClusterEvent`] to an injected [`EventSink`]; [`TracingSink`] turns
//! them into structured `tracing` records.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::scheduler::job::{FailureReason, JobId, JobPriority, JobType, WorkerId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    JobCreated {
        job_id: JobId,
        name: String,
        job_type: JobType,
        priority: JobPriority,
    },
    JobAssigned {
        job_id: JobId,
        worker_id: WorkerId,
        attempt: u32,
    },
    JobCompleted {
        job_id: JobId,
        worker_id: WorkerId,
        attempt: u32,
    },
    JobFailed {
        job_id: JobId,
        worker_id: Option<WorkerId>,
        attempt: u32,
        reason: FailureReason,
    },
    JobRequeued {
        job_id: JobId,
        attempt: u32,
    },
    JobAbandoned {
        job_id: JobId,
        attempts: u32,
    },
    WorkerAdded {
        worker_id: WorkerId,
        failure_rate: f64,
    },
    WorkerSuspect {
        worker_id: WorkerId,
    },
    WorkerHealthy {
        worker_id: WorkerId,
    },
    WorkerFailed {
        worker_id: WorkerId,
        reason: FailureReason,
    },
    WorkerRecovered {
        worker_id: WorkerId,
    },
    JobRateChanged {
        rate: f64,
    },
}

/// Destination for core events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClusterEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::JobCreated {
                job_id,
                name,
                job_type,
                priority,
            } => {
                tracing::info!(job_id = %job_id, name = %name, job_type = %job_type, priority = %priority, "Job created")
            }
            ClusterEvent::JobAssigned {
                job_id,
                worker_id,
                attempt,
            } => tracing::info!(job_id = %job_id, worker_id = %worker_id, attempt, "Job assigned"),
            ClusterEvent::JobCompleted {
                job_id,
                worker_id,
                attempt,
            } => tracing::info!(job_id = %job_id, worker_id = %worker_id, attempt, "Job completed"),
            ClusterEvent::JobFailed {
                job_id,
                worker_id,
                attempt,
                reason,
            } => {
                tracing::warn!(job_id = %job_id, worker_id = ?worker_id, attempt, reason = %reason, "Job failed")
            }
            ClusterEvent::JobRequeued { job_id, attempt } => {
                tracing::info!(job_id = %job_id, attempt, "Job requeued")
            }
            ClusterEvent::JobAbandoned { job_id, attempts } => {
                tracing::error!(job_id = %job_id, attempts, "Job abandoned after max retries")
            }
            ClusterEvent::WorkerAdded {
                worker_id,
                failure_rate,
            } => tracing::info!(worker_id = %worker_id, failure_rate, "Worker registered"),
            ClusterEvent::WorkerSuspect { worker_id } => {
                tracing::warn!(worker_id = %worker_id, "Worker missed a heartbeat")
            }
            ClusterEvent::WorkerHealthy { worker_id } => {
                tracing::info!(worker_id = %worker_id, "Worker heartbeat resumed")
            }
            ClusterEvent::WorkerFailed { worker_id, reason } => {
                tracing::warn!(worker_id = %worker_id, reason = %reason, "Worker failed")
            }
            ClusterEvent::WorkerRecovered { worker_id } => {
                tracing::info!(worker_id = %worker_id, "Worker recovered")
            }
            ClusterEvent::JobRateChanged { rate } => {
                tracing::info!(rate, "Job generation rate updated")
            }
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ClusterEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ClusterEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Sends each event to every inner sink.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ClusterEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
