//! Rate-limited, retrying fetch client.
//!
//! Each provider gets its own token bucket, circuit breaker, quota tracker and
//! a mutex that serializes its calls. Different providers never contend.
//! Order inside one call: breaker admission, then a token, then the network.

pub mod backoff;
pub mod breaker;
pub mod clock;
pub mod limiter;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::FetchError;
use backoff::{Backoff, RetryDecision, RetryPolicy};
use breaker::{Admission, BreakerPolicy, BreakerState, CircuitBreaker};
use clock::SleepClock;
use limiter::{RateLimit, SourceLimiter};
pub use transport::{FetchRequest, HttpResponse, ReqwestTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "ratings-provider")]
    Ratings,
    #[serde(rename = "odds-provider")]
    Odds,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ratings => "ratings-provider",
            Provider::Odds => "odds-provider",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ratings-provider" => Some(Provider::Ratings),
            "odds-provider" => Some(Provider::Odds),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SourcePolicy {
    pub rate: RateLimit,
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
    /// Remaining-request count at or below which the quota is flagged low.
    pub low_quota_threshold: u64,
}

/// Provider quota as reported by the last response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub remaining: Option<u64>,
    pub used: Option<u64>,
    pub low: bool,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Payload {
    pub provider: Provider,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    pub attempts: u32,
    pub quota: Option<QuotaStatus>,
}

struct SourceState<C: SleepClock> {
    policy: SourcePolicy,
    limiter: SourceLimiter<C>,
    breaker: Mutex<CircuitBreaker<C::Instant>>,
    quota: RwLock<Option<QuotaStatus>>,
    serial: Mutex<()>,
    network_calls: AtomicU64,
}

pub struct FetchClient<C: SleepClock = DefaultClock> {
    transport: Arc<dyn Transport>,
    clock: C,
    sources: HashMap<Provider, SourceState<C>>,
}

impl FetchClient<DefaultClock> {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_clock(transport, DefaultClock::default())
    }
}

/// 429 and 5xx are worth another try; other 4xx are not.
fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

impl<C: SleepClock> FetchClient<C> {
    pub fn with_clock(transport: Arc<dyn Transport>, clock: C) -> Self {
        Self {
            transport,
            clock,
            sources: HashMap::new(),
        }
    }

    pub fn with_source(mut self, provider: Provider, policy: SourcePolicy) -> Self {
        let state = SourceState {
            limiter: SourceLimiter::new(&policy.rate, self.clock.clone()),
            breaker: Mutex::new(CircuitBreaker::new(policy.breaker)),
            quota: RwLock::new(None),
            serial: Mutex::new(()),
            network_calls: AtomicU64::new(0),
            policy,
        };
        self.sources.insert(provider, state);
        self
    }

    fn source(&self, provider: Provider) -> Result<&SourceState<C>, FetchError> {
        self.sources
            .get(&provider)
            .ok_or(FetchError::NotConfigured { provider })
    }

    pub async fn quota(&self, provider: Provider) -> Option<QuotaStatus> {
        match self.sources.get(&provider) {
            Some(source) => source.quota.read().await.clone(),
            None => None,
        }
    }

    /// Requests that actually went out on the wire for `provider`.
    pub fn network_calls(&self, provider: Provider) -> u64 {
        self.sources
            .get(&provider)
            .map(|s| s.network_calls.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn breaker_state(&self, provider: Provider) -> Option<BreakerState> {
        match self.sources.get(&provider) {
            Some(source) => Some(source.breaker.lock().await.state()),
            None => None,
        }
    }

    pub async fn fetch(
        &self,
        provider: Provider,
        request: &FetchRequest,
    ) -> Result<Payload, FetchError> {
        let source = self.source(provider)?;
        let _serial = source.serial.lock().await;

        let started = self.clock.now();
        let mut backoff = Backoff::new(source.policy.retry.clone());
        let mut rate_waited = Duration::ZERO;

        loop {
            let admission = source.breaker.lock().await.admit(self.clock.now());
            match admission {
                Admission::Rejected => {
                    debug!(provider = %provider, request = %request.label, "circuit open, failing fast");
                    return Err(FetchError::CircuitOpen { provider });
                }
                Admission::Probe => {
                    info!(provider = %provider, "Circuit half-open, sending probe request");
                }
                Admission::Allowed => {}
            }

            let budget = source.policy.rate.max_wait.saturating_sub(rate_waited);
            match source.limiter.acquire(budget).await {
                Ok(waited) => rate_waited += waited,
                Err(throttled) => {
                    if admission == Admission::Probe {
                        source.breaker.lock().await.cancel_probe();
                    }
                    warn!(
                        provider = %provider,
                        needed_ms = throttled.needed.as_millis() as u64,
                        "Rate limit wait exceeds budget"
                    );
                    return Err(FetchError::RateLimitExceeded {
                        provider,
                        waited: rate_waited + throttled.waited,
                        needed: throttled.needed,
                    });
                }
            }

            let attempt = backoff.failures() + 1;
            source.network_calls.fetch_add(1, Ordering::Relaxed);
            let outcome = self.transport.get(request).await;

            let (reason, status, hint) = match outcome {
                Ok(response) if response.is_success() => {
                    if source.breaker.lock().await.record_success() {
                        info!(provider = %provider, "Circuit closed after successful probe");
                    }
                    let quota = self.record_quota(source, provider, &response).await;
                    debug!(
                        provider = %provider,
                        request = %request.label,
                        attempt,
                        "fetch succeeded"
                    );
                    return Ok(Payload {
                        provider,
                        status: response.status,
                        body: response.body,
                        fetched_at: Utc::now(),
                        attempts: attempt,
                        quota,
                    });
                }
                Ok(response) if is_transient_status(response.status) => (
                    format!("HTTP {}: {}", response.status, snippet(&response.body)),
                    Some(response.status),
                    response.retry_after(),
                ),
                Ok(response) => {
                    // The provider answered, so it is reachable.
                    source.breaker.lock().await.record_success();
                    self.record_quota(source, provider, &response).await;
                    warn!(
                        provider = %provider,
                        request = %request.label,
                        status = response.status,
                        "Permanent fetch error, not retrying"
                    );
                    return Err(FetchError::FetchFailed {
                        provider,
                        attempts: attempt,
                        status: Some(response.status),
                        retryable: false,
                        reason: format!("HTTP {}: {}", response.status, snippet(&response.body)),
                    });
                }
                Err(err) => (err.to_string(), None, None),
            };

            if source
                .breaker
                .lock()
                .await
                .record_failure(self.clock.now())
            {
                warn!(
                    provider = %provider,
                    cooldown_secs = source.policy.breaker.cooldown.as_secs(),
                    "Circuit opened after repeated failures"
                );
                return Err(FetchError::FetchFailed {
                    provider,
                    attempts: attempt,
                    status,
                    retryable: true,
                    reason,
                });
            }

            match backoff.on_failure(self.clock.elapsed_since(started), hint) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        provider = %provider,
                        request = %request.label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch attempt failed: {}. Retrying...",
                        reason
                    );
                    self.clock.sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(
                        provider = %provider,
                        request = %request.label,
                        attempts = backoff.failures(),
                        "Giving up on fetch: {}",
                        reason
                    );
                    return Err(FetchError::FetchFailed {
                        provider,
                        attempts: backoff.failures(),
                        status,
                        retryable: true,
                        reason,
                    });
                }
            }
        }
    }

    async fn record_quota(
        &self,
        source: &SourceState<C>,
        provider: Provider,
        response: &HttpResponse,
    ) -> Option<QuotaStatus> {
        let remaining = response
            .header("x-requests-remaining")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let used = response
            .header("x-requests-used")
            .and_then(|v| v.trim().parse::<u64>().ok());
        if remaining.is_none() && used.is_none() {
            return None;
        }

        let low = remaining.is_some_and(|r| r <= source.policy.low_quota_threshold);
        if low {
            warn!(
                provider = %provider,
                remaining = remaining.unwrap_or_default(),
                threshold = source.policy.low_quota_threshold,
                "API quota running low"
            );
        } else if let Some(remaining) = remaining {
            info!("API requests remaining for {}: {}", provider, remaining);
        }

        let status = QuotaStatus {
            remaining,
            used,
            low,
            observed_at: Utc::now(),
        };
        *source.quota.write().await = Some(status.clone());
        Some(status)
    }
}
