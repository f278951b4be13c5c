//! Time source shared by the limiter, the retry deadline and the breaker cooldown.
//!
//! Production runs on governor's default (quanta) clock and sleeps on tokio.
//! Tests use `FakeRelativeClock`, where sleeping simply advances the clock, so
//! a whole retry/limit sequence completes instantly and deterministically.

use std::time::Duration;

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock, FakeRelativeClock, Reference};

#[async_trait]
pub trait SleepClock: Clock + Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);

    fn elapsed_since(&self, start: Self::Instant) -> Duration {
        self.now().duration_since(start).into()
    }
}

#[async_trait]
impl SleepClock for DefaultClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[async_trait]
impl SleepClock for FakeRelativeClock {
    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
