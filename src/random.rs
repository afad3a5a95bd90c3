//! Gaussian sampling for randomized state initialisation and tests.
//!
//! The sampler is passed explicitly wherever random element values are needed,
//! so tests can seed it and the library never touches a process-wide generator.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Standard-normal sampler backing `set_random` on all element types.
pub struct GaussianSampler {
    rng: SmallRng,
}

impl GaussianSampler {
    /// Sampler seeded from the operating system entropy source.
    pub fn new() -> Self {
        GaussianSampler {
            rng: SmallRng::from_entropy(),
        }
    }

    /// Deterministic sampler for reproducible tests.
    pub fn from_seed(seed: u64) -> Self {
        GaussianSampler {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Draw one standard-normal value.
    pub fn sample(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }
}

impl Default for GaussianSampler {
    fn default() -> Self {
        Self::new()
    }
}
