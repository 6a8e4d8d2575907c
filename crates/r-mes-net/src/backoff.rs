//! ---
//! mes_section: "05-networking-external-interfaces"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Field connectivity, tag registry, and device adapters."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::time::Duration;

use r_mes_common::BackoffConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential reconnect backoff with symmetric jitter.
///
/// Delays double from `base` and are clamped to `cap`; each delay is then
/// scaled by a random factor in `[1 - jitter, 1 + jitter]` and clamped again.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    /// Backoff with a fixed default seed.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rng: StdRng::seed_from_u64(0x5EED_B0FF),
        }
    }

    /// Seed the jitter source for deterministic tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let nominal = self
            .config
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.config.cap);
        let jitter = self.config.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 {
            return nominal;
        }
        let factor = self.rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor).min(self.config.cap)
    }

    /// Attempts made since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
