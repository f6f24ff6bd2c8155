//! Shared test doubles for the behaviour suites.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aerofeed_core::data_source::FetchFuture;
use aerofeed_core::{
    CacheStore, DataSource, ExecutorConfig, FailureTracker, HttpClient, HttpError, HttpRequest,
    HttpResponse, QueryTarget, RequestExecutor, RetryConfig, SourceError, SourceRecord, UtcDateTime,
};

type Reply = Result<HttpResponse, HttpError>;

/// Replays scripted responses in order and records every request it sees.
/// Once the script runs out every call fails with a connection error.
#[derive(Default)]
pub struct ScriptedHttpClient {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl ScriptedHttpClient {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    /// Every call waits `delay` before answering.
    pub fn slow(delay: Duration, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("lock").len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Reply> + Send + 'a>> {
        self.requests.lock().expect("lock").push(request);
        let reply = self
            .replies
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(HttpError::connect("no scripted reply left")));
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            reply
        })
    }
}

/// Answers by URL substring, so concurrent fan-out is deterministic.
#[derive(Default)]
pub struct RoutedHttpClient {
    routes: Vec<(String, u16, String)>,
    requests: Mutex<Vec<String>>,
}

impl RoutedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, url_fragment: &str, status: u16, body: &str) -> Self {
        self.routes
            .push((url_fragment.to_owned(), status, body.to_owned()));
        self
    }

    pub fn calls_matching(&self, url_fragment: &str) -> usize {
        self.requests
            .lock()
            .expect("lock")
            .iter()
            .filter(|url| url.contains(url_fragment))
            .count()
    }
}

impl HttpClient for RoutedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Reply> + Send + 'a>> {
        self.requests.lock().expect("lock").push(request.url.clone());
        let reply = self
            .routes
            .iter()
            .find(|(fragment, _, _)| request.url.contains(fragment.as_str()))
            .map(|(_, status, body)| Ok(HttpResponse::new(*status, body.clone())))
            .unwrap_or_else(|| Err(HttpError::connect("no route")));
        Box::pin(async move { reply })
    }
}

/// Executor over a memory-only cache with millisecond retry delays.
pub fn executor(http: Arc<dyn HttpClient>, max_attempts: u32) -> RequestExecutor {
    executor_with_cache(http, CacheStore::memory_only(), max_attempts)
}

pub fn executor_with_cache(
    http: Arc<dyn HttpClient>,
    cache: CacheStore,
    max_attempts: u32,
) -> RequestExecutor {
    RequestExecutor::new(http, cache, Arc::new(FailureTracker::default())).with_config(
        ExecutorConfig {
            retry: RetryConfig::fixed(Duration::from_millis(1), max_attempts),
            ..ExecutorConfig::default()
        },
    )
}

/// A source that returns canned records (or a canned error) without touching the network.
pub struct StaticSource {
    id: String,
    priority: u32,
    result: Result<Vec<SourceRecord>, SourceError>,
    delay: Option<Duration>,
    calls: Mutex<usize>,
}

impl StaticSource {
    pub fn new(id: &str, priority: u32, records: Vec<SourceRecord>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            priority,
            result: Ok(records),
            delay: None,
            calls: Mutex::new(0),
        })
    }

    pub fn failing(id: &str, priority: u32, error: SourceError) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            priority,
            result: Err(error),
            delay: None,
            calls: Mutex::new(0),
        })
    }

    pub fn hanging(id: &str, priority: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            priority,
            result: Ok(Vec::new()),
            delay: Some(delay),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("lock")
    }
}

impl DataSource for StaticSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn supports(&self, _target: &QueryTarget) -> bool {
        true
    }

    fn fetch<'a>(&'a self, _executor: &'a RequestExecutor, _target: &'a QueryTarget) -> FetchFuture<'a> {
        *self.calls.lock().expect("lock") += 1;
        let result = self.result.clone();
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

pub fn at(input: &str) -> UtcDateTime {
    UtcDateTime::parse(input).expect("valid timestamp")
}

pub fn seconds_ago(seconds: u64) -> UtcDateTime {
    UtcDateTime::now().checked_minus(Duration::from_secs(seconds)).expect("in range")
}

pub fn record(source: &str, priority: u32, key: &str, observed_at: UtcDateTime) -> SourceRecord {
    SourceRecord::new(source, priority, key, observed_at).expect("valid record")
}
