//! Simulated downstream latency.
//!
//! The handler asks a [`Delay`] how long to pause before answering, so tests
//! can swap the random source for a fixed one.

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Source of per-request pauses.
pub trait Delay: Send + Sync {
    /// Pause to apply before the next response.
    fn next_delay(&self) -> Duration;
}

/// Whole-second pauses drawn uniformly from `0..upper_bound_secs`.
#[derive(Debug)]
pub struct RandomDelay {
    // ---
    upper_bound_secs: u64,
    rng: Mutex<StdRng>,
}

impl RandomDelay {
    // ---
    /// Creates an entropy-seeded delay source.
    ///
    /// # Errors
    ///
    /// Returns error if `upper_bound_secs` is zero (the range would be empty).
    pub fn new(upper_bound_secs: u64) -> Result<Self> {
        // ---
        Self::with_rng(upper_bound_secs, StdRng::from_entropy())
    }

    /// Creates a reproducible delay source.
    pub fn with_seed(upper_bound_secs: u64, seed: u64) -> Result<Self> {
        // ---
        Self::with_rng(upper_bound_secs, StdRng::seed_from_u64(seed))
    }

    fn with_rng(upper_bound_secs: u64, rng: StdRng) -> Result<Self> {
        // ---
        ensure!(
            upper_bound_secs > 0,
            "delay upper bound must be at least 1 second"
        );
        Ok(Self {
            upper_bound_secs,
            rng: Mutex::new(rng),
        })
    }

    pub fn upper_bound_secs(&self) -> u64 {
        // ---
        self.upper_bound_secs
    }
}

impl Delay for RandomDelay {
    fn next_delay(&self) -> Duration {
        // ---
        let secs = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..self.upper_bound_secs);
        Duration::from_secs(secs)
    }
}

/// Always the same pause.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedDelay(pub Duration);

impl FixedDelay {
    // ---
    pub fn none() -> Self {
        Self(Duration::ZERO)
    }
}

impl Delay for FixedDelay {
    fn next_delay(&self) -> Duration {
        self.0
    }
}
