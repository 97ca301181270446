use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SimError;
use crate::rng::SimRng;
use crate::scheduler::job::{JobParams, JobPriority, JobSpec, JobType};
use crate::state::ClusterState;

const TYPE_WEIGHTS: [(JobType, f64); 4] = [
    (JobType::Sleep, 0.3),
    (JobType::Compute, 0.4),
    (JobType::Matrix, 0.2),
    (JobType::FaultInjection, 0.1),
];

const PRIORITY_WEIGHTS: [(JobPriority, f64); 4] = [
    (JobPriority::Low, 0.2),
    (JobPriority::Normal, 0.5),
    (JobPriority::High, 0.2),
    (JobPriority::Critical, 0.1),
];

fn type_prefixes(job_type: JobType) -> &'static [&'static str] {
    match job_type {
        JobType::Sleep => &["io", "wait", "idle", "pause", "delay"],
        JobType::Compute => &["calc", "process", "analyze", "compute", "run"],
        JobType::Matrix => &["matrix", "gpu", "tensor", "linear", "algebra"],
        JobType::FaultInjection => &["test", "check", "verify", "validate", "inject"],
    }
}

fn priority_suffixes(priority: JobPriority) -> &'static [&'static str] {
    match priority {
        JobPriority::Low => &["batch", "background", "low-priority"],
        JobPriority::Normal => &["standard", "regular", "normal"],
        JobPriority::High => &["urgent", "priority", "important"],
        JobPriority::Critical => &["critical", "emergency", "immediate"],
    }
}

/// Time between two generated jobs at `rate` jobs per minute.
pub fn interval_for(rate: f64) -> Duration {
    Duration::from_secs_f64(60.0 / rate)
}

/// Produces synthetic jobs at a configurable arrival rate.
#[derive(Debug, Clone)]
pub struct JobGenerator {
    rng: SimRng,
}

impl JobGenerator {
    pub fn new(rng: SimRng) -> Self {
        Self { rng }
    }

    /// Draw the parameters for a job of `job_type`.
    pub fn params_for(&self, job_type: JobType) -> JobParams {
        match job_type {
            JobType::Sleep => JobParams::Sleep {
                duration_ms: self.rng.range_u64(1, 5) * 1_000,
            },
            JobType::Compute => JobParams::Compute {
                iterations: self.rng.range_u64(100_000, 1_000_000),
            },
            JobType::Matrix => JobParams::Matrix {
                matrix_size: self.rng.range_u64(500, 2_000),
            },
            JobType::FaultInjection => JobParams::FaultInjection {
                failure_probability: self.rng.range_f64(0.05, 0.2),
                duration_ms: self.rng.range_u64(2, 8) * 1_000,
            },
        }
    }

    /// Human-readable name such as `gpu-tensor-4821` or `calc-urgent-1034`.
    pub fn job_name(&self, job_type: JobType, priority: JobPriority) -> String {
        let prefix = self.rng.pick(type_prefixes(job_type)).copied().unwrap_or("job");
        let suffix = self
            .rng
            .pick(priority_suffixes(priority))
            .copied()
            .unwrap_or("normal");
        let number = self.rng.range_u64(1000, 9999);

        match job_type {
            JobType::Matrix => format!("gpu-{}-{}", prefix, number),
            JobType::FaultInjection => format!("{}-test-{}", prefix, number),
            _ => format!("{}-{}-{}", prefix, suffix, number),
        }
    }

    /// Draw a complete job description.
    pub fn next_spec(&self) -> JobSpec {
        let job_type = self.rng.weighted(&TYPE_WEIGHTS).unwrap_or(JobType::Sleep);
        let priority = self
            .rng
            .weighted(&PRIORITY_WEIGHTS)
            .unwrap_or(JobPriority::Normal);
        JobSpec::new(
            self.job_name(job_type, priority),
            priority,
            self.params_for(job_type),
        )
    }

    /// Generate one job per interval until `shutdown` fires.
    ///
    /// A new rate reschedules the next tick to `last tick + new interval`;
    /// jobs already issued are never touched. A tick that is already overdue
    /// fires once and the schedule restarts from now.
    pub async fn run(
        self,
        state: Arc<RwLock<ClusterState>>,
        mut rate_rx: watch::Receiver<f64>,
        shutdown: CancellationToken,
    ) {
        let mut rate = *rate_rx.borrow_and_update();
        let mut last_tick = Instant::now();

        loop {
            let next_tick = last_tick + interval_for(rate);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rate_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    rate = *rate_rx.borrow_and_update();
                    continue;
                }
                _ = tokio::time::sleep_until(next_tick) => {}
            }

            last_tick = next_tick.max(Instant::now());
            let spec = self.next_spec();
            let result = state.write().await.submit(spec, Instant::now());
            match result {
                Ok(_) => {}
                Err(SimError::QueueFull) => {
                    tracing::warn!("Job queue at capacity, generated job dropped");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to submit generated job"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_matches_rate() {
        assert_eq!(interval_for(60.0), Duration::from_secs(1));
        assert_eq!(interval_for(2.0), Duration::from_secs(30));
        assert!((interval_for(0.1).as_secs_f64() - 600.0).abs() < 1e-6);
        assert!((interval_for(50.0).as_secs_f64() - 1.2).abs() < 1e-6);
    }

    #[test]
    fn names_follow_type_patterns() {
        let generator = JobGenerator::new(SimRng::seeded(11));
        for _ in 0..50 {
            let name = generator.job_name(JobType::Matrix, JobPriority::High);
            assert!(name.starts_with("gpu-"), "{}", name);

            let name = generator.job_name(JobType::FaultInjection, JobPriority::Low);
            assert!(name.contains("-test-"), "{}", name);

            let name = generator.job_name(JobType::Compute, JobPriority::Critical);
            let parts: Vec<&str> = name.rsplitn(2, '-').collect();
            let number: u64 = parts[0].parse().unwrap();
            assert!((1000..=9999).contains(&number));
        }
    }

    #[test]
    fn params_match_type_and_ranges() {
        let generator = JobGenerator::new(SimRng::seeded(5));
        for _ in 0..100 {
            let spec = generator.next_spec();
            match spec.params {
                JobParams::Sleep { duration_ms } => {
                    assert!((1_000..=5_000).contains(&duration_ms))
                }
                JobParams::Compute { iterations } => {
                    assert!((100_000..=1_000_000).contains(&iterations))
                }
                JobParams::Matrix { matrix_size } => {
                    assert!((500..=2_000).contains(&matrix_size))
                }
                JobParams::FaultInjection {
                    failure_probability,
                    duration_ms,
                } => {
                    assert!((0.05..0.2).contains(&failure_probability));
                    assert!((2_000..=8_000).contains(&duration_ms));
                }
            }
        }
    }

    #[test]
    fn priority_distribution_favours_normal() {
        let generator = JobGenerator::new(SimRng::seeded(21));
        let normal = (0..2_000)
            .filter(|_| generator.next_spec().priority == JobPriority::Normal)
            .count();
        // Expected share is one half.
        assert!(normal > 800 && normal < 1_200, "normal = {}", normal);
    }
}
