use std::time::Duration;

use crate::error::{Result, SimError};

/// Lowest accepted job arrival rate, in jobs per minute.
pub const MIN_JOB_RATE: f64 = 0.1;
/// Highest accepted job arrival rate, in jobs per minute.
pub const MAX_JOB_RATE: f64 = 50.0;

/// Check a requested job rate against the accepted bounds.
pub fn validate_job_rate(rate: f64) -> Result<f64> {
    if !rate.is_finite() || !(MIN_JOB_RATE..=MAX_JOB_RATE).contains(&rate) {
        return Err(SimError::InvalidConfiguration(format!(
            "job rate {} outside [{}, {}] jobs/minute",
            rate, MIN_JOB_RATE, MAX_JOB_RATE
        )));
    }
    Ok(rate)
}

/// Check a worker failure rate (probability of failure per minute).
pub fn validate_failure_rate(rate: f64) -> Result<f64> {
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        return Err(SimError::InvalidConfiguration(format!(
            "failure rate {} outside [0, 1] per minute",
            rate
        )));
    }
    Ok(rate)
}

/// A worker to register when the cluster starts.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub worker_id: String,
    /// Probability of a crash per minute of uptime.
    pub failure_rate: f64,
}

impl WorkerSpec {
    pub fn new(worker_id: impl Into<String>, failure_rate: f64) -> Self {
        Self {
            worker_id: worker_id.into(),
            failure_rate,
        }
    }
}

impl std::str::FromStr for WorkerSpec {
    type Err = SimError;

    /// Parse `id:failure_rate`, e.g. `gpu-node-09:0.05`.
    fn from_str(s: &str) -> Result<Self> {
        let (id, rate) = s
            .trim()
            .rsplit_once(':')
            .filter(|(id, _)| !id.is_empty())
            .ok_or_else(|| {
                SimError::InvalidConfiguration(format!(
                    "worker '{}' is not in id:failure_rate form",
                    s
                ))
            })?;
        let rate = rate.parse::<f64>().map_err(|_| {
            SimError::InvalidConfiguration(format!("worker '{}' has an invalid failure rate", s))
        })?;
        Ok(WorkerSpec::new(id, validate_failure_rate(rate)?))
    }
}

/// The eight GPU nodes the simulator starts with by default.
pub fn default_workers() -> Vec<WorkerSpec> {
    [0.05, 0.08, 0.12, 0.06, 0.10, 0.07, 0.09, 0.11]
        .iter()
        .enumerate()
        .map(|(i, rate)| WorkerSpec::new(format!("gpu-node-{:02}", i + 1), *rate))
        .collect()
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub job_rate_per_minute: f64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Window after which a Running job is force-failed.
    pub job_timeout_ms: u64,
    pub retry_limit: u32,
    pub recovery_delay_min_ms: u64,
    pub recovery_delay_max_ms: u64,
    pub scheduler_tick_ms: u64,
    pub recovery_sweep_ms: u64,
    /// Chance that a single heartbeat is lost in transit.
    pub heartbeat_drop_probability: f64,
    pub queue_capacity: usize,
    /// Run the job generator. Off when callers submit jobs themselves.
    pub auto_generate: bool,
    /// Seed for the shared randomness source. `None` seeds from entropy.
    pub seed: Option<u64>,
    pub workers: Vec<WorkerSpec>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            job_rate_per_minute: 2.0,
            heartbeat_interval_ms: 2_000,
            heartbeat_timeout_ms: 10_000,
            job_timeout_ms: 300_000,
            retry_limit: 3,
            recovery_delay_min_ms: 20_000,
            recovery_delay_max_ms: 40_000,
            scheduler_tick_ms: 500,
            recovery_sweep_ms: 1_000,
            heartbeat_drop_probability: 0.001,
            queue_capacity: 10_000,
            auto_generate: true,
            seed: None,
            workers: default_workers(),
        }
    }
}

impl SimConfig {
    /// A config with no workers, for callers that register their own.
    pub fn empty() -> Self {
        Self {
            workers: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>, failure_rate: f64) -> Self {
        self.workers.push(WorkerSpec::new(worker_id, failure_rate));
        self
    }

    pub fn with_auto_generate(mut self, enabled: bool) -> Self {
        self.auto_generate = enabled;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_job_rate(mut self, rate: f64) -> Self {
        self.job_rate_per_minute = rate;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_recovery_delay(mut self, min: Duration, max: Duration) -> Self {
        self.recovery_delay_min_ms = min.as_millis() as u64;
        self.recovery_delay_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_drop_probability(mut self, probability: f64) -> Self {
        self.heartbeat_drop_probability = probability;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn recovery_sweep(&self) -> Duration {
        Duration::from_millis(self.recovery_sweep_ms)
    }

    /// Reject configurations that would break the running loops.
    pub fn validate(&self) -> Result<()> {
        validate_job_rate(self.job_rate_per_minute)?;

        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("job_timeout_ms", self.job_timeout_ms),
            ("scheduler_tick_ms", self.scheduler_tick_ms),
            ("recovery_sweep_ms", self.recovery_sweep_ms),
        ] {
            if value == 0 {
                return Err(SimError::InvalidConfiguration(format!(
                    "{} must be positive",
                    name
                )));
            }
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(SimError::InvalidConfiguration(
                "heartbeat timeout must exceed the heartbeat interval".to_string(),
            ));
        }

        if self.recovery_delay_min_ms > self.recovery_delay_max_ms {
            return Err(SimError::InvalidConfiguration(
                "recovery delay min exceeds max".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.heartbeat_drop_probability) {
            return Err(SimError::InvalidConfiguration(format!(
                "heartbeat drop probability {} outside [0, 1]",
                self.heartbeat_drop_probability
            )));
        }

        if self.queue_capacity == 0 {
            return Err(SimError::InvalidConfiguration(
                "queue capacity must be positive".to_string(),
            ));
        }

        for worker in &self.workers {
            validate_failure_rate(worker.failure_rate)?;
        }

        Ok(())
    }
}
