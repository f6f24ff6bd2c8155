//! Resilient execution of a single outbound request.
//!
//! [`RequestExecutor::execute`] layers, in order: a fresh cache read, the
//! service circuit check, client-side rate limiting, per-attempt timeouts with
//! retry and backoff, and a stale-cache fallback when the upstream cannot be
//! reached. Request lines are only ever logged through [`crate::redact`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{validate_namespace, CacheEntry, CacheStore, StaleCeiling, StaleRead};
use crate::circuit_breaker::FailureTracker;
use crate::config::duration_secs;
use crate::http_client::{HttpAuth, HttpClient, HttpErrorKind, HttpMethod, HttpRequest, HttpResponse};
use crate::redact::{redact_url, RedactedHeaders, RedactedUrl};
use crate::retry::RetryConfig;
use crate::throttling::ServiceThrottle;
use crate::{UtcDateTime, ValidationError};

/// Executor-wide defaults. Individual requests may override timeout and stale ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub retry: RetryConfig,
    #[serde(rename = "timeout_secs", with = "duration_secs")]
    pub timeout: Duration,
    pub stale_ceiling: StaleCeiling,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(10),
            stale_ceiling: StaleCeiling::default(),
        }
    }
}

/// One outbound request plus its caching policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub service_name: String,
    /// Cache namespace; the service name when unset.
    pub namespace: Option<String>,
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Responses are cached only when a key is given.
    pub cache_key: Option<String>,
    pub ttl: Option<Duration>,
    pub timeout: Option<Duration>,
    pub stale_ceiling: Option<StaleCeiling>,
}

impl RequestOptions {
    pub fn new(service_name: impl Into<String>, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            namespace: None,
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            cache_key: None,
            ttl: None,
            timeout: None,
            stale_ceiling: None,
        }
    }

    pub fn get(service_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(service_name, HttpMethod::Get, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        auth.apply(&mut self.headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stale_ceiling(mut self, ceiling: StaleCeiling) -> Self {
        self.stale_ceiling = Some(ceiling);
        self
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.service_name)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service_name.trim().is_empty() {
            return Err(ValidationError::EmptyServiceName);
        }
        validate_namespace(self.namespace())?;
        if self.cache_key.as_deref().is_some_and(str::is_empty) {
            return Err(ValidationError::EmptyCacheKey);
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ValidationError::ZeroValue { field: "timeout" });
        }
        Ok(())
    }
}

/// Result of [`RequestExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: u16,
    pub body: String,
    pub from_cache: bool,
    /// Zero for a response just fetched from the network.
    pub age: Duration,
    /// Served from cache past its TTL because the upstream could not be used.
    pub is_stale: bool,
}

impl Response {
    /// When the body was fetched from the upstream.
    pub fn retrieved_at(&self) -> UtcDateTime {
        let now = UtcDateTime::now();
        now.checked_minus(self.age).unwrap_or(now)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Typed request failures. Messages never contain request URLs or header values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("{service}: request timed out after {}ms", after.as_millis())]
    Timeout { service: String, after: Duration },

    #[error("{service}: network error: {message}")]
    Network {
        service: String,
        message: String,
        retryable: bool,
    },

    #[error("{service}: upstream error (http {status})")]
    Upstream {
        service: String,
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("{service}: request rejected (http {status})")]
    HttpClient { service: String, status: u16 },

    /// Informational or redirect status the client did not resolve.
    #[error("{service}: unexpected response status (http {status})")]
    UnexpectedStatus { service: String, status: u16 },

    #[error("{service}: rate limited by upstream")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("{service}: circuit open; service disabled until reset")]
    CircuitOpen { service: String },
}

impl RequestError {
    /// Whether another attempt inside the same `execute` call could succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Upstream { .. } | Self::RateLimited { .. } => true,
            Self::Network { retryable, .. } => *retryable,
            Self::Invalid(_)
            | Self::HttpClient { .. }
            | Self::UnexpectedStatus { .. }
            | Self::CircuitOpen { .. } => false,
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            Self::Invalid(_) => None,
            Self::Timeout { service, .. }
            | Self::Network { service, .. }
            | Self::Upstream { service, .. }
            | Self::HttpClient { service, .. }
            | Self::UnexpectedStatus { service, .. }
            | Self::RateLimited { service, .. }
            | Self::CircuitOpen { service } => Some(service),
        }
    }

    /// Server-provided wait hint (429 and 503 responses).
    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::Upstream { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Permanent rejections are surfaced as-is instead of falling back to stale data.
    fn is_permanent(&self) -> bool {
        matches!(self, Self::HttpClient { .. })
    }
}

/// Document stored in the cache for each successful response.
#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    body: String,
}

/// Executes requests with caching, circuit breaking, rate limiting and retries.
///
/// Cloning is cheap; clones share the cache, tracker and rate limiters.
#[derive(Clone)]
pub struct RequestExecutor {
    http: Arc<dyn HttpClient>,
    cache: CacheStore,
    breaker: Arc<FailureTracker>,
    throttle: ServiceThrottle,
    config: ExecutorConfig,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("cache", &self.cache)
            .field("breaker", &self.breaker)
            .field("throttle", &self.throttle)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    pub fn new(http: Arc<dyn HttpClient>, cache: CacheStore, breaker: Arc<FailureTracker>) -> Self {
        Self {
            http,
            cache,
            breaker,
            throttle: ServiceThrottle::new(),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_throttle(mut self, throttle: ServiceThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn breaker(&self) -> &Arc<FailureTracker> {
        &self.breaker
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute(&self, options: RequestOptions) -> Result<Response, RequestError> {
        options.validate()?;
        let service = options.service_name.as_str();
        let ceiling = options.stale_ceiling.unwrap_or(self.config.stale_ceiling);

        let cached = self.cached(&options, ceiling).await;
        if let Some(fresh) = cached.as_ref().filter(|read| !read.is_stale) {
            tracing::trace!(service, url = %RedactedUrl(&options.url), "served from cache");
            return Ok(fresh.clone());
        }

        if !self.breaker.allow(service) {
            tracing::debug!(service, url = %RedactedUrl(&options.url), "circuit open; skipping network");
            return match cached {
                Some(stale) => Ok(stale),
                None => Err(RequestError::CircuitOpen {
                    service: service.to_owned(),
                }),
            };
        }

        let error = match self.fetch_with_retry(&options).await {
            Ok(response) => {
                self.breaker.record_success(service);
                self.store(&options, &response).await;
                return Ok(response);
            }
            Err(error) => error,
        };

        let outcome = self.breaker.record_failure(service, &error.to_string());
        if outcome.opened() {
            if let Err(checkpoint_error) = self.breaker.checkpoint().await {
                tracing::warn!(service, error = %checkpoint_error, "failed to checkpoint failure tracker");
            }
        }

        if error.is_permanent() {
            return Err(error);
        }
        match self.cached(&options, ceiling).await {
            Some(stale) => {
                tracing::warn!(
                    service,
                    url = %RedactedUrl(&options.url),
                    error = %error,
                    age_secs = stale.age.as_secs(),
                    "upstream failed; serving cached value"
                );
                Ok(stale)
            }
            None => Err(error),
        }
    }

    async fn fetch_with_retry(&self, options: &RequestOptions) -> Result<Response, RequestError> {
        let retry = &self.config.retry;
        let attempts = retry.attempts();
        let mut attempt = 0;

        loop {
            let error = match self.attempt(options, attempt).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            attempt += 1;
            if !error.retryable() || attempt >= attempts {
                tracing::warn!(
                    service = %options.service_name,
                    url = %RedactedUrl(&options.url),
                    attempts = attempt,
                    error = %error,
                    "request failed"
                );
                return Err(error);
            }

            let delay = retry.delay_for_attempt(attempt - 1, error.retry_after());
            tracing::debug!(
                service = %options.service_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, options: &RequestOptions, attempt: u32) -> Result<Response, RequestError> {
        let service = options.service_name.as_str();
        let timeout = options.timeout.unwrap_or(self.config.timeout);

        self.throttle.acquire(service).await;

        let mut request = HttpRequest::new(options.method, options.url.clone()).with_timeout(timeout);
        request.headers = options.headers.clone();
        request.body = options.body.clone();

        tracing::debug!(
            service,
            method = %options.method,
            url = %RedactedUrl(&options.url),
            headers = %RedactedHeaders(&options.headers),
            attempt = attempt + 1,
            "sending request"
        );

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.http.execute(request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match result {
            Err(_) => {
                return Err(RequestError::Timeout {
                    service: service.to_owned(),
                    after: timeout,
                })
            }
            Ok(Err(error)) => {
                return Err(match error.kind() {
                    HttpErrorKind::Timeout => RequestError::Timeout {
                        service: service.to_owned(),
                        after: timeout,
                    },
                    HttpErrorKind::Connect | HttpErrorKind::Other => RequestError::Network {
                        service: service.to_owned(),
                        message: error.message().to_owned(),
                        retryable: error.retryable(),
                    },
                })
            }
            Ok(Ok(response)) => response,
        };

        tracing::debug!(service, status = response.status, elapsed_ms, "response received");
        classify(service, response, &self.config.retry)
    }

    async fn cached(&self, options: &RequestOptions, ceiling: StaleCeiling) -> Option<Response> {
        let key = options.cache_key.as_deref()?;
        let read = self
            .cache
            .get_with_stale(options.namespace(), key, ceiling)
            .await?;
        decode_cached(&options.service_name, read)
    }

    async fn store(&self, options: &RequestOptions, response: &Response) {
        let Some(key) = options.cache_key.as_deref() else {
            return;
        };

        let document = CachedResponse {
            status: response.status_code,
            body: response.body.clone(),
        };
        let value = match serde_json::to_value(&document) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(service = %options.service_name, %error, "response not cacheable");
                return;
            }
        };

        let ttl = options.ttl.unwrap_or(self.cache.config().default_ttl);
        let metadata = BTreeMap::from([
            (String::from("service"), options.service_name.clone()),
            (String::from("url"), redact_url(&options.url)),
        ]);
        let entry = CacheEntry::new(key, value, ttl).with_metadata(metadata);
        if let Err(error) = self.cache.set_entry(options.namespace(), entry).await {
            tracing::warn!(service = %options.service_name, %error, "failed to cache response");
        }
    }
}

fn classify(service: &str, response: HttpResponse, retry: &RetryConfig) -> Result<Response, RequestError> {
    let status = response.status;
    if response.is_success() {
        return Ok(Response {
            status_code: status,
            body: response.body,
            from_cache: false,
            age: Duration::ZERO,
            is_stale: false,
        });
    }

    let service = service.to_owned();
    Err(match status {
        429 => RequestError::RateLimited {
            service,
            retry_after: response.retry_after,
        },
        _ if retry.should_retry_status(status) => RequestError::Upstream {
            service,
            status,
            retry_after: response.retry_after.filter(|_| status == 503),
        },
        400..=499 => RequestError::HttpClient { service, status },
        _ => RequestError::UnexpectedStatus { service, status },
    })
}

fn decode_cached(service: &str, read: StaleRead) -> Option<Response> {
    match serde_json::from_value::<CachedResponse>(read.value) {
        Ok(document) => Some(Response {
            status_code: document.status,
            body: document.body,
            from_cache: true,
            age: read.age,
            is_stale: read.is_stale,
        }),
        Err(error) => {
            tracing::warn!(service, %error, "cached response has unexpected shape; ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpError;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedHttpClient {
        responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
        calls: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttpClient {
        fn with(responses: Vec<Result<HttpResponse, HttpError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().expect("lock").len()
        }
    }

    impl HttpClient for ScriptedHttpClient {
        fn execute<'a>(
            &'a self,
            request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
            self.calls.lock().expect("lock").push(request);
            let next = self
                .responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(HttpError::connect("script exhausted")));
            Box::pin(async move { next })
        }
    }

    fn executor(http: Arc<ScriptedHttpClient>) -> RequestExecutor {
        RequestExecutor::new(http, CacheStore::memory_only(), Arc::new(FailureTracker::default()))
            .with_config(ExecutorConfig {
                retry: RetryConfig::fixed(Duration::from_millis(1), 3),
                ..ExecutorConfig::default()
            })
    }

    #[tokio::test]
    async fn caches_successful_response() {
        let http = ScriptedHttpClient::with(vec![Ok(HttpResponse::ok_json("[1]"))]);
        let executor = executor(Arc::clone(&http));
        let options = RequestOptions::get("metar", "https://x.test/metar").with_cache_key("kjfk");

        let first = executor.execute(options.clone()).await.expect("network");
        let second = executor.execute(options).await.expect("cache");

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.body, "[1]");
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let http = ScriptedHttpClient::with(vec![
            Ok(HttpResponse::new(503, "busy")),
            Err(HttpError::timeout("slow")),
            Ok(HttpResponse::ok_json("{}")),
        ]);
        let executor = executor(Arc::clone(&http));

        let response = executor
            .execute(RequestOptions::get("readsb", "https://x.test/v2/hex/abc"))
            .await
            .expect("third attempt succeeds");

        assert_eq!(response.status_code, 200);
        assert_eq!(http.calls(), 3);
        assert_eq!(executor.breaker().health("readsb").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried_but_counted() {
        let http = ScriptedHttpClient::with(vec![Ok(HttpResponse::new(404, "nope"))]);
        let executor = executor(Arc::clone(&http));

        let error = executor
            .execute(RequestOptions::get("notam", "https://x.test/notams"))
            .await
            .expect_err("404 surfaces");

        assert_eq!(
            error,
            RequestError::HttpClient {
                service: String::from("notam"),
                status: 404
            }
        );
        assert_eq!(http.calls(), 1);
        assert_eq!(executor.breaker().health("notam").consecutive_failures, 1);
    }

    #[tokio::test]
    async fn redirects_are_reported_as_unexpected_and_not_retried() {
        let http = ScriptedHttpClient::with(vec![Ok(HttpResponse::new(302, ""))]);
        let executor = executor(Arc::clone(&http));

        let error = executor
            .execute(RequestOptions::get("opensky", "https://x.test/states/all"))
            .await
            .expect_err("302 surfaces");

        assert_eq!(
            error,
            RequestError::UnexpectedStatus {
                service: String::from("opensky"),
                status: 302
            }
        );
        assert!(error.to_string().contains("unexpected response status"));
        assert_eq!(http.calls(), 1);
    }

    #[test]
    fn statuses_follow_the_retry_policy() {
        let retry = RetryConfig::default();
        let classify_status = |status| {
            classify("metar", HttpResponse::new(status, ""), &retry).expect_err("not a success")
        };

        assert!(matches!(classify_status(429), RequestError::RateLimited { .. }));
        assert!(matches!(classify_status(502), RequestError::Upstream { status: 502, .. }));
        assert!(matches!(classify_status(404), RequestError::HttpClient { status: 404, .. }));
        assert!(matches!(classify_status(101), RequestError::UnexpectedStatus { status: 101, .. }));
        assert!(matches!(classify_status(304), RequestError::UnexpectedStatus { status: 304, .. }));
        for status in [429, 500, 503] {
            assert_eq!(classify_status(status).retryable(), retry.should_retry_status(status));
        }
        for status in [101, 304, 400, 404] {
            assert!(!classify_status(status).retryable());
        }
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_any_call() {
        let http = ScriptedHttpClient::with(vec![]);
        let executor = executor(Arc::clone(&http));

        let error = executor
            .execute(RequestOptions::get("", "https://x.test"))
            .await
            .expect_err("empty service");

        assert_eq!(error, RequestError::Invalid(ValidationError::EmptyServiceName));
        assert_eq!(http.calls(), 0);
    }

    #[test]
    fn error_messages_do_not_include_urls() {
        let error = RequestError::Upstream {
            service: String::from("opensky"),
            status: 502,
            retry_after: None,
        };
        assert_eq!(error.to_string(), "opensky: upstream error (http 502)");
        assert!(error.retryable());
    }
}
