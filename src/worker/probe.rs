use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{Result, SimError};
use crate::rng::SimRng;

const SIMULATED_MEMORY_TOTAL_MB: u64 = 8 * 1024;
const AVAILABLE_MEMORY_FRACTION: f64 = 0.9;

/// Last known resource state of a worker's GPU.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub utilization_pct: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub temperature_c: f64,
    pub available: bool,
}

impl ResourceSnapshot {
    pub fn new(utilization_pct: f64, memory_used_mb: u64, memory_total_mb: u64, temperature_c: f64) -> Self {
        let usage = if memory_total_mb == 0 {
            0.0
        } else {
            memory_used_mb as f64 / memory_total_mb as f64
        };
        Self {
            utilization_pct,
            memory_used_mb,
            memory_total_mb,
            temperature_c,
            available: usage < AVAILABLE_MEMORY_FRACTION,
        }
    }
}

/// Source of per-worker resource readings.
///
/// Fails with [`SimError::ProbeUnavailable`] when the monitoring backend
/// cannot be reached; the dispatcher then ignores resource metrics.
pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self, worker_id: &str) -> Result<ResourceSnapshot>;
}

/// Random GPU readings for machines without real hardware.
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    rng: SimRng,
}

impl SimulatedProbe {
    pub fn new(rng: SimRng) -> Self {
        Self { rng }
    }
}

impl ResourceProbe for SimulatedProbe {
    fn snapshot(&self, _worker_id: &str) -> Result<ResourceSnapshot> {
        let used = self
            .rng
            .range_u64(0, (SIMULATED_MEMORY_TOTAL_MB as f64 * 0.7) as u64);
        Ok(ResourceSnapshot::new(
            self.rng.range_f64(0.0, 100.0),
            used,
            SIMULATED_MEMORY_TOTAL_MB,
            self.rng.range_f64(30.0, 80.0),
        ))
    }
}

/// A probe whose backend is never reachable.
#[derive(Debug, Default, Clone)]
pub struct UnavailableProbe;

impl ResourceProbe for UnavailableProbe {
    fn snapshot(&self, worker_id: &str) -> Result<ResourceSnapshot> {
        Err(SimError::ProbeUnavailable(worker_id.to_string()))
    }
}

/// Fixed readings set by the caller. Workers without a reading are unavailable.
#[derive(Debug, Default, Clone)]
pub struct StaticProbe {
    readings: Arc<Mutex<HashMap<String, ResourceSnapshot>>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, worker_id: impl Into<String>, snapshot: ResourceSnapshot) {
        if let Ok(mut readings) = self.readings.lock() {
            readings.insert(worker_id.into(), snapshot);
        }
    }

    pub fn with(self, worker_id: impl Into<String>, snapshot: ResourceSnapshot) -> Self {
        self.set(worker_id, snapshot);
        self
    }
}

impl ResourceProbe for StaticProbe {
    fn snapshot(&self, worker_id: &str) -> Result<ResourceSnapshot> {
        self.readings
            .lock()
            .ok()
            .and_then(|readings| readings.get(worker_id).cloned())
            .ok_or_else(|| SimError::ProbeUnavailable(worker_id.to_string()))
    }
}
