//! Generation parameters
//!
//! Per-request knobs and the thread-count policy applied when a session opens.

use serde::{Deserialize, Serialize};

use crate::inference::backend::SamplingStrategy;

/// Generation parameters for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Hard cap on prompt plus generated tokens; also the context size
    pub max_tokens: u32,
    /// Top-k sampling parameter
    pub top_k: i32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Temperature for stochastic sampling
    pub temperature: f32,
    /// Deterministic (greedy) sampling instead of the stochastic chain
    pub use_greedy: bool,
    /// Thread count override; `None` derives one from the hardware
    pub n_threads: Option<u32>,
    /// Seed for stochastic sampling; `None` picks a fresh one per request
    pub seed: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_k: 40,
            top_p: 0.8,
            temperature: 1.0,
            use_greedy: true,
            n_threads: None,
            seed: None,
        }
    }
}

impl GenerationParams {
    /// Clamps sampling values into their valid ranges
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        if self.top_k <= 0 {
            self.top_k = 40;
        }
    }

    /// Strategy the session sampler is built with
    pub fn sampling_strategy(&self) -> SamplingStrategy {
        if self.use_greedy {
            SamplingStrategy::Greedy
        } else {
            SamplingStrategy::Stochastic {
                top_k: self.top_k,
                top_p: self.top_p,
                temperature: self.temperature,
                seed: self.seed.unwrap_or_else(rand_seed),
            }
        }
    }
}

/// Range applied to the hardware-derived thread count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPolicy {
    /// Cores left free for the rest of the system
    pub reserved: u32,
    pub min: u32,
    pub max: u32,
}

impl Default for ThreadPolicy {
    fn default() -> Self {
        Self {
            reserved: 2,
            min: 1,
            max: 8,
        }
    }
}

impl ThreadPolicy {
    /// Keeps `min` at least 1 and `max` at least `min`
    pub fn validate(&mut self) {
        self.min = self.min.max(1);
        self.max = self.max.max(self.min);
    }

    /// A positive override wins; otherwise `clamp(hardware - reserved, min, max)`.
    pub fn effective_threads(&self, requested: Option<u32>, hardware_threads: usize) -> u32 {
        match requested {
            Some(n) if n > 0 => n,
            _ => {
                let hardware = u32::try_from(hardware_threads).unwrap_or(u32::MAX);
                let min = self.min.max(1);
                hardware
                    .saturating_sub(self.reserved)
                    .clamp(min, self.max.max(min))
            }
        }
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
