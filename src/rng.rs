//! The single randomness source shared by every simulated activity.
//!
//! Job generation, crash draws, heartbeat loss, probe readings and execution
//! outcomes all draw from one [`SimRng`]. Seeding it makes a whole run
//! reproducible.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct SimRng {
    inner: Arc<Mutex<StdRng>>,
}

impl SimRng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StdRng> {
        // A panic while holding the guard cannot leave an RNG half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bernoulli draw. Probabilities outside [0, 1] are clamped.
    pub fn chance(&self, probability: f64) -> bool {
        if probability.is_nan() || probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.lock().gen_bool(probability)
    }

    pub fn range_u64(&self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.lock().gen_range(min..=max)
    }

    pub fn range_f64(&self, min: f64, max: f64) -> f64 {
        if min >= max {
            return min;
        }
        self.lock().gen_range(min..max)
    }

    pub fn duration_between(&self, min: Duration, max: Duration) -> Duration {
        let ms = self.range_u64(min.as_millis() as u64, max.as_millis() as u64);
        Duration::from_millis(ms)
    }

    /// Pick one of `items` with probability proportional to its weight.
    /// Falls back to the first item when the weights are unusable.
    pub fn weighted<T: Copy>(&self, items: &[(T, f64)]) -> Option<T> {
        let first = items.first()?.0;
        let weights = items.iter().map(|(_, w)| *w);
        match WeightedIndex::new(weights) {
            Ok(dist) => {
                let idx = dist.sample(&mut *self.lock());
                Some(items[idx].0)
            }
            Err(_) => Some(first),
        }
    }

    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.lock().gen_range(0..items.len());
        items.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let a = SimRng::seeded(42);
        let b = SimRng::seeded(42);
        let xs: Vec<u64> = (0..16).map(|_| a.range_u64(0, 1_000)).collect();
        let ys: Vec<u64> = (0..16).map(|_| b.range_u64(0, 1_000)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn chance_extremes_are_deterministic() {
        let rng = SimRng::seeded(1);
        for _ in 0..100 {
            assert!(!rng.chance(0.0));
            assert!(rng.chance(1.0));
            assert!(!rng.chance(-3.0));
            assert!(rng.chance(7.0));
        }
    }

    #[test]
    fn weighted_skips_zero_weights() {
        let rng = SimRng::seeded(9);
        for _ in 0..200 {
            assert_eq!(rng.weighted(&[("a", 0.0), ("b", 1.0)]), Some("b"));
        }
        assert_eq!(rng.weighted::<u8>(&[]), None);
        assert_eq!(rng.weighted(&[(3u8, 0.0)]), Some(3));
    }

    #[test]
    fn ranges_handle_degenerate_bounds() {
        let rng = SimRng::seeded(3);
        assert_eq!(rng.range_u64(5, 5), 5);
        assert_eq!(rng.range_f64(2.0, 2.0), 2.0);
        let d = rng.duration_between(Duration::from_secs(1), Duration::from_secs(2));
        assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
    }
}
