// ABOUTME: Per-stage retry policy and the jittered exponential backoff it produces.
// ABOUTME: Delays grow from `base` toward `cap` and never decrease between retries.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::time::Duration;

/// How a stage is retried.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_base", with = "humantime_serde")]
    pub base: Duration,

    /// Upper bound for any single delay.
    #[serde(default = "default_cap", with = "humantime_serde")]
    pub cap: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Upward jitter as a fraction of the nominal delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Hard deadline for one invocation of the stage action.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base() -> Duration {
    Duration::from_secs(5)
}

fn default_cap() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> u32 {
    2
}

fn default_jitter() -> f64 {
    0.2
}

fn default_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base: default_base(),
            cap: default_cap(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            timeout: default_timeout(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.base = base;
        self.cap = cap.max(base);
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Single attempt, no backoff.
    pub fn once() -> Self {
        Self::default().max_attempts(1)
    }

    pub fn schedule(&self, seed: u64) -> Backoff {
        Backoff {
            policy: self.clone(),
            rng: SmallRng::seed_from_u64(seed),
            retries: 0,
            last: Duration::ZERO,
        }
    }
}

/// A series of exponential, jittered, clamped, non-decreasing delays.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    rng: SmallRng,
    retries: u32,
    last: Duration,
}

impl Backoff {
    /// Nominal delay before retry number `retry` (zero-based), without jitter.
    pub fn nominal(&self, retry: u32) -> Duration {
        let factor = self.policy.multiplier.max(1).saturating_pow(retry);
        self.policy
            .base
            .checked_mul(factor)
            .unwrap_or(self.policy.cap)
            .min(self.policy.cap)
    }

    /// Delay to apply before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal(self.retries);
        let jitter = if self.policy.jitter > 0.0 {
            self.rng.random_range(0.0..=self.policy.jitter)
        } else {
            0.0
        };
        let delay = nominal
            .mul_f64(1.0 + jitter)
            .min(self.policy.cap)
            .max(self.last);
        self.retries += 1;
        self.last = delay;
        delay
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}
