use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use super::clock::SleepClock;

pub type DirectLimiter<C> =
    RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Token bucket for one provider: `capacity` tokens, refilled at
/// `refill_per_minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub capacity: u32,
    pub refill_per_minute: u32,
    /// Longest a single fetch may spend waiting for tokens, across its retries.
    pub max_wait: Duration,
}

impl RateLimit {
    pub fn quota(&self) -> Quota {
        Quota::per_minute(non_zero(self.refill_per_minute)).allow_burst(non_zero(self.capacity))
    }

    /// Interval at which a single token comes back.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(60) / non_zero(self.refill_per_minute).get()
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// The caller would have had to wait past its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    pub waited: Duration,
    pub needed: Duration,
}

pub struct SourceLimiter<C: SleepClock> {
    limiter: DirectLimiter<C>,
    clock: C,
}

impl<C: SleepClock> SourceLimiter<C> {
    pub fn new(limit: &RateLimit, clock: C) -> Self {
        let limiter = RateLimiter::direct_with_clock(limit.quota(), &clock);
        Self { limiter, clock }
    }

    /// Block until a token is available. Fails without sleeping when the next
    /// token lies beyond `budget`.
    pub async fn acquire(&self, budget: Duration) -> Result<Duration, Throttled> {
        let mut waited = Duration::ZERO;
        loop {
            match self.limiter.check() {
                Ok(()) => return Ok(waited),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    if waited + wait > budget {
                        return Err(Throttled {
                            waited,
                            needed: wait,
                        });
                    }
                    self.clock.sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }
}
