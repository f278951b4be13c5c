//! Retry schedule as an explicit state machine.
//!
//! `raw(n) = min(base * multiplier^n, max_delay)`, jitter adds up to
//! `jitter_ratio * raw(n)` on top, and the result is clamped to `max_delay`
//! and never drops below the previous delay of the same failure streak.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
    /// Wall budget for the whole call, waits included.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_ratio: 0.25,
            max_elapsed: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
    previous: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    pub fn seeded(policy: RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            failures: 0,
            previous: Duration::ZERO,
            rng,
        }
    }

    /// Failed attempts recorded in this streak.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Un-jittered delay after the `n`-th failure (0-based).
    pub fn raw_delay(&self, n: u32) -> Duration {
        let cap = self.policy.max_delay;
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let secs = self.policy.base_delay.as_secs_f64() * self.policy.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Next delay in the streak; advances the state machine.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.raw_delay(self.failures);
        let ratio = self.policy.jitter_ratio.max(0.0);
        let jitter = raw.mul_f64(self.rng.gen_range(0.0..=ratio));
        let delay = (raw + jitter).min(self.policy.max_delay).max(self.previous);

        self.previous = delay;
        self.failures += 1;
        delay
    }

    /// Record a failed attempt. `elapsed` is the time since the call began,
    /// `hint` a provider supplied `Retry-After`, which wins over the schedule.
    pub fn on_failure(&mut self, elapsed: Duration, hint: Option<Duration>) -> RetryDecision {
        let computed = self.next_delay();
        if self.failures >= self.policy.max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = hint.unwrap_or(computed);
        if elapsed + delay > self.policy.max_elapsed {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(delay)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.previous = Duration::ZERO;
    }
}
