//! Uniform draws in `[0, 100)` for weighted variant selection.
//!
//! The engine never touches a global RNG directly; it asks a [`RandomSource`]
//! so assignment can be reproduced exactly in tests.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait RandomSource: Send + Sync {
    /// A uniform draw from `[0, 100)`.
    fn next_percent(&self) -> f64;
}

/// Thread-local entropy, for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_percent(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..100.0)
    }
}

/// Deterministic PRNG seeded from a `u64`.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl RandomSource for SeededRandom {
    fn next_percent(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0.0..100.0)
    }
}

/// Replays a fixed list of draws, wrapping around at the end.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Vec<f64>,
    cursor: Mutex<usize>,
}

impl SequenceRandom {
    /// Values outside `[0, 100)` are clamped into range. An empty list
    /// replays `0.0`.
    pub fn new(values: Vec<f64>) -> Self {
        let values = values
            .into_iter()
            .map(|v| v.clamp(0.0, 100.0 - f64::EPSILON * 100.0))
            .collect();
        Self { values, cursor: Mutex::new(0) }
    }
}

impl RandomSource for SequenceRandom {
    fn next_percent(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let v = self.values[*cursor % self.values.len()];
        *cursor += 1;
        v
    }
}
