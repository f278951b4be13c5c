use std::time::Duration;

use governor::clock::Reference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single trial request after a cooldown.
    Probe,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
enum Inner<I> {
    Closed,
    Open { since: I },
    HalfOpen { opened_at: I },
}

/// Consecutive-failure breaker, one per provider.
#[derive(Debug)]
pub struct CircuitBreaker<I> {
    policy: BreakerPolicy,
    consecutive_failures: u32,
    inner: Inner<I>,
}

impl<I: Reference> CircuitBreaker<I> {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            inner: Inner::Closed,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.inner {
            Inner::Closed => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn admit(&mut self, now: I) -> Admission {
        match self.inner {
            Inner::Closed => Admission::Allowed,
            Inner::Open { since } => {
                let open_for: Duration = now.duration_since(since).into();
                if open_for >= self.policy.cooldown {
                    self.inner = Inner::HalfOpen { opened_at: since };
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            Inner::HalfOpen { .. } => Admission::Rejected,
        }
    }

    /// Give back a probe that never reached the network.
    pub fn cancel_probe(&mut self) {
        if let Inner::HalfOpen { opened_at } = self.inner {
            self.inner = Inner::Open { since: opened_at };
        }
    }

    /// Returns true when this success closed a half-open breaker.
    pub fn record_success(&mut self) -> bool {
        let was_half_open = matches!(self.inner, Inner::HalfOpen { .. });
        self.consecutive_failures = 0;
        self.inner = Inner::Closed;
        was_half_open
    }

    /// Returns true when this failure opened (or re-opened) the breaker.
    pub fn record_failure(&mut self, now: I) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.inner {
            Inner::HalfOpen { .. } => {
                self.inner = Inner::Open { since: now };
                true
            }
            Inner::Closed if self.consecutive_failures >= self.policy.failure_threshold => {
                self.inner = Inner::Open { since: now };
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::{Clock, FakeRelativeClock};

    fn breaker() -> CircuitBreaker<<FakeRelativeClock as Clock>::Instant> {
        CircuitBreaker::new(BreakerPolicy {
            failure_threshold: 3,
            cooldown: Duration::from_secs(10),
        })
    }

    #[test]
    fn opens_after_threshold() {
        let clock = FakeRelativeClock::default();
        let mut breaker = breaker();

        assert!(!breaker.record_failure(clock.now()));
        assert!(!breaker.record_failure(clock.now()));
        assert!(breaker.record_failure(clock.now()));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.admit(clock.now()), Admission::Rejected);
    }

    #[test]
    fn success_resets_streak() {
        let clock = FakeRelativeClock::default();
        let mut breaker = breaker();

        breaker.record_failure(clock.now());
        breaker.record_failure(clock.now());
        breaker.record_success();
        assert!(!breaker.record_failure(clock.now()));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let clock = FakeRelativeClock::default();
        let mut breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure(clock.now());
        }

        clock.advance(Duration::from_secs(9));
        assert_eq!(breaker.admit(clock.now()), Admission::Rejected);

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.admit(clock.now()), Admission::Probe);
        assert_eq!(breaker.admit(clock.now()), Admission::Rejected);

        assert!(breaker.record_success());
        assert_eq!(breaker.admit(clock.now()), Admission::Allowed);
    }

    #[test]
    fn failed_probe_restarts_cooldown() {
        let clock = FakeRelativeClock::default();
        let mut breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure(clock.now());
        }
        clock.advance(Duration::from_secs(10));
        assert_eq!(breaker.admit(clock.now()), Admission::Probe);
        assert!(breaker.record_failure(clock.now()));

        clock.advance(Duration::from_secs(5));
        assert_eq!(breaker.admit(clock.now()), Admission::Rejected);
        clock.advance(Duration::from_secs(5));
        assert_eq!(breaker.admit(clock.now()), Admission::Probe);
    }

    #[test]
    fn cancelled_probe_can_be_retaken() {
        let clock = FakeRelativeClock::default();
        let mut breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure(clock.now());
        }
        clock.advance(Duration::from_secs(10));
        assert_eq!(breaker.admit(clock.now()), Admission::Probe);
        breaker.cancel_probe();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.admit(clock.now()), Admission::Probe);
    }
}
