use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};

use crate::config::duration_secs;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Client-side request budget: at most `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
    pub limit: u32,
}

impl RateLimit {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            window: Duration::from_secs(60),
            limit,
        }
    }
}

/// Per-service rate limiters. Services without a configured limit are never delayed.
#[derive(Clone, Default)]
pub struct ServiceThrottle {
    limiters: Arc<Mutex<HashMap<String, Arc<DirectRateLimiter>>>>,
}

impl std::fmt::Debug for ServiceThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services: Vec<String> = self.lock().keys().cloned().collect();
        f.debug_struct("ServiceThrottle")
            .field("services", &services)
            .finish()
    }
}

impl ServiceThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) the budget for `service`.
    pub fn configure(&self, service: impl Into<String>, limit: RateLimit) {
        let limiter = RateLimiter::direct(quota_from_window(limit.window, limit.limit));
        self.lock().insert(service.into(), Arc::new(limiter));
    }

    pub fn is_limited(&self, service: &str) -> bool {
        self.lock().contains_key(service)
    }

    /// Non-blocking check; consumes one unit of budget when it succeeds.
    pub fn try_acquire(&self, service: &str) -> bool {
        match self.limiter(service) {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    /// Waits until `service` has budget for one more request and returns how long that took.
    pub async fn acquire(&self, service: &str) -> Duration {
        let Some(limiter) = self.limiter(service) else {
            return Duration::ZERO;
        };

        let started = Instant::now();
        limiter.until_ready().await;
        let waited = started.elapsed();
        if waited >= Duration::from_millis(1) {
            tracing::debug!(service, waited_ms = waited.as_millis() as u64, "rate limit delayed request");
        }
        waited
    }

    fn limiter(&self, service: &str) -> Option<Arc<DirectRateLimiter>> {
        self.lock().get(service).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<DirectRateLimiter>>> {
        self.limiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let burst = NonZeroU32::new(quota_limit).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(burst.get())).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst)
}
