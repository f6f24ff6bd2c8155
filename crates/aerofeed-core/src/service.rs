//! The assembled acquisition layer.
//!
//! [`AcquisitionService`] wires one [`CacheStore`], one [`FailureTracker`]
//! and one [`Notifier`] into a [`RequestExecutor`] and a [`SourceAggregator`]
//! built from a [`CoreConfig`].
//!
//! # Lifecycle
//!
//! 1. **Creation**: [`AcquisitionService::new`] builds every component; no I/O happens yet.
//! 2. **Start**: [`start`](AcquisitionService::start) restores the failure
//!    checkpoint and spawns the periodic cache sweep.
//! 3. **Operation**: [`query`](AcquisitionService::query) and the health/cache accessors.
//! 4. **Stop**: [`stop`](AcquisitionService::stop) cancels the sweep, waits for
//!    pending cache writes and saves the failure checkpoint.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregateReport, SourceAggregator};
use crate::cache::{CacheStats, CacheStore, StaleCeiling};
use crate::circuit_breaker::{FailureTracker, ServiceHealth};
use crate::config::CoreConfig;
use crate::executor::RequestExecutor;
use crate::feeds::build_feed;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::notify::{Notification, Notifier};
use crate::throttling::ServiceThrottle;
use crate::{CoreError, QueryTarget, ValidationError};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Facade over the cache, failure tracker, executor and aggregator.
pub struct AcquisitionService {
    config: CoreConfig,
    notifier: Notifier,
    cache: CacheStore,
    breaker: Arc<FailureTracker>,
    aggregator: SourceAggregator,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for AcquisitionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionService")
            .field("aggregator", &self.aggregator)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AcquisitionService {
    /// Builds the service with the production HTTP client, reading feed credentials from the process environment.
    pub fn new(config: CoreConfig) -> Result<Self, CoreError> {
        Self::with_http_client(config, Arc::new(ReqwestHttpClient::new()), |name| {
            std::env::var(name).ok()
        })
    }

    pub fn with_http_client<F>(
        config: CoreConfig,
        http: Arc<dyn HttpClient>,
        lookup_env: F,
    ) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        config.validate()?;

        let notifier = Notifier::default();
        let cache = CacheStore::with_notifier(config.cache.clone(), notifier.clone());
        let breaker = Arc::new(FailureTracker::with_notifier(
            config.breaker.clone(),
            notifier.clone(),
        ));

        let throttle = ServiceThrottle::new();
        for source in &config.sources {
            if let Some(limit) = source.rate_limit {
                throttle.configure(source.id.clone(), limit);
            }
        }

        let executor = RequestExecutor::new(http, cache.clone(), Arc::clone(&breaker))
            .with_config(config.executor.clone())
            .with_throttle(throttle);

        let mut aggregator = SourceAggregator::new(executor, config.aggregator.clone());
        for source in &config.sources {
            let feed = build_feed(source.settings(), &source.feed, &lookup_env);
            aggregator.register(feed)?;
        }

        info!(
            sources = config.sources.len(),
            persistent = config.cache.root_dir.is_some(),
            "acquisition service configured"
        );

        Ok(Self {
            config,
            notifier,
            cache,
            breaker,
            aggregator,
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &SourceAggregator {
        &self.aggregator
    }

    pub fn is_running(&self) -> bool {
        self.sweeper_slot().is_some()
    }

    /// Restores the failure checkpoint and starts the background cache sweep.
    /// A no-op on a running service.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.is_running() {
            return Ok(());
        }

        let restored = self.breaker.restore().await?;
        if restored > 0 {
            info!(services = restored, "failure tracker state restored");
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(
            self.cache.clone(),
            self.sweep_ceiling(),
            token.clone(),
        ));

        let mut slot = self.sweeper_slot();
        if slot.is_some() {
            // Lost a race with a concurrent start.
            token.cancel();
            return Ok(());
        }
        *slot = Some(Sweeper { token, handle });
        info!("acquisition service started");
        Ok(())
    }

    /// Stops the sweep, waits for pending cache writes and saves the failure checkpoint.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let sweeper = self.sweeper_slot().take();
        if let Some(Sweeper { token, handle }) = sweeper {
            token.cancel();
            if let Err(error) = handle.await {
                warn!(%error, "cache sweep task ended abnormally");
            }
        }

        self.cache.flush().await;
        self.breaker.checkpoint().await?;
        info!("acquisition service stopped");
        Ok(())
    }

    pub async fn query(&self, target: &QueryTarget) -> AggregateReport {
        self.aggregator.query(target).await
    }

    /// Queries with an explicit merge mode; `false` returns every per-source record unmerged.
    pub async fn query_with(&self, target: &QueryTarget, merge: bool) -> AggregateReport {
        self.aggregator.query_with(target, merge).await
    }

    pub fn health(&self, service: &str) -> ServiceHealth {
        self.breaker.health(service)
    }

    /// Health of every configured source, plus any other service the tracker has seen.
    pub fn health_all(&self) -> Vec<ServiceHealth> {
        let mut by_service: BTreeMap<String, ServiceHealth> = self
            .breaker
            .snapshot()
            .into_iter()
            .map(|health| (health.service.clone(), health))
            .collect();
        for id in self.aggregator.source_ids() {
            by_service
                .entry(id.to_owned())
                .or_insert_with(|| self.breaker.health(id));
        }
        by_service.into_values().collect()
    }

    /// Re-enables a service whose circuit opened. Returns whether it was open.
    pub async fn reset(&self, service: &str) -> Result<bool, CoreError> {
        if service.trim().is_empty() {
            return Err(ValidationError::EmptyServiceName.into());
        }
        let was_open = self.breaker.reset(service);
        self.breaker.checkpoint().await?;
        Ok(was_open)
    }

    pub fn cache_stats(&self, namespace: &str) -> CacheStats {
        self.cache.stats(namespace)
    }

    pub fn all_cache_stats(&self) -> BTreeMap<String, CacheStats> {
        self.cache.all_stats()
    }

    pub async fn clear_cache(&self, namespace: &str) -> Result<(), CoreError> {
        self.cache.clear(namespace).await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Notifications not yet dismissed (open circuits, degraded cache namespaces).
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifier.outstanding()
    }

    /// The widest staleness ceiling any request may use; nothing younger is swept.
    fn sweep_ceiling(&self) -> StaleCeiling {
        let ceilings = std::iter::once(self.config.executor.stale_ceiling)
            .chain(self.config.sources.iter().map(|source| source.max_stale));
        widest_ceiling(ceilings)
    }

    fn sweeper_slot(&self) -> std::sync::MutexGuard<'_, Option<Sweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn widest_ceiling(ceilings: impl IntoIterator<Item = StaleCeiling>) -> StaleCeiling {
    let mut widest = Duration::ZERO;
    for ceiling in ceilings {
        match ceiling.as_duration() {
            None => return StaleCeiling::Unlimited,
            Some(max) => widest = widest.max(max),
        }
    }
    StaleCeiling::Within(widest)
}

async fn sweep_loop(cache: CacheStore, ceiling: StaleCeiling, token: CancellationToken) {
    if ceiling == StaleCeiling::Unlimited {
        debug!("stale ceiling is unlimited; cache sweep disabled");
        token.cancelled().await;
        return;
    }

    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                cache.sweep(ceiling).await;
            }
        }
    }
}
