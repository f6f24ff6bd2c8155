//! # Aerofeed Core
//!
//! Resilient data acquisition for aviation feeds: weather observations,
//! notices to air missions and live aircraft positions.
//!
//! ## Overview
//!
//! - **Two-tier cache** with TTLs, per-namespace LRU and an optional
//!   persistent tier that survives restarts
//! - **Request executor** that serves fresh cache hits, retries transient
//!   failures with backoff and falls back to stale data
//! - **Failure tracker** that disables a service after repeated failures
//!   until an operator resets it
//! - **Source aggregator** that queries every eligible feed concurrently and
//!   merges their reports into one canonical record per entity
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`aggregator`] | Concurrent fan-out and priority merge |
//! | [`cache`] | Memory and persistent cache tiers |
//! | [`circuit_breaker`] | Per-service failure tracking |
//! | [`config`] | JSON configuration and data directory resolution |
//! | [`data_source`] | Data source trait and source errors |
//! | [`domain`] | Records, query targets and timestamps |
//! | [`error`] | Core error types |
//! | [`executor`] | Cached, retried outbound requests |
//! | [`feeds`] | METAR, NOTAM, readsb and OpenSky sources |
//! | [`http_client`] | HTTP client abstraction |
//! | [`notify`] | Operator notifications |
//! | [`redact`] | Credential redaction for logs |
//! | [`retry`] | Backoff strategies |
//! | [`service`] | The assembled service with start/stop |
//! | [`throttling`] | Client-side rate limits |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use aerofeed_core::{AcquisitionService, CoreConfig, QueryTarget};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = AcquisitionService::new(CoreConfig::default())?;
//!     service.start().await?;
//!
//!     let report = service.query(&QueryTarget::identity("KJFK")?).await;
//!     for record in &report.records {
//!         println!("{} from {:?}", record.identity_key, record.contributing_sources);
//!     }
//!
//!     service.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  AcquisitionService  │
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐     ┌──────────────────┐
//! │  SourceAggregator    │────▶│  CacheStore      │
//! └──────────┬───────────┘     │  (canonical)     │
//!            │ fan-out         └──────────────────┘
//!            ▼
//! ┌──────────────────────┐
//! │  DataSource (feeds)  │
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐     ┌──────────────────┐
//! │  RequestExecutor     │────▶│  FailureTracker  │
//! └──────────┬───────────┘     └──────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │  HttpClient          │
//! └──────────────────────┘
//! ```
//!
//! ## Security
//!
//! - Feed credentials are read from environment variables named in the config
//! - Credential-bearing headers and query parameters are redacted before logging

pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod data_source;
pub mod domain;
pub mod error;
pub mod executor;
pub mod feeds;
pub mod http_client;
pub mod notify;
pub mod redact;
pub mod retry;
pub mod service;
pub mod throttling;

// Aggregation
pub use aggregator::{
    AggregateReport, AggregatorConfig, SkipReason, SourceAggregator, SourceOutcome, SourceStatus,
};

// Caching
pub use cache::{CacheConfig, CacheEntry, CacheHit, CacheStats, CacheStore, StaleCeiling, StaleRead};

// Failure tracking
pub use circuit_breaker::{BreakerConfig, CircuitState, FailureOutcome, FailureTracker, ServiceHealth};

// Configuration
pub use config::{resolve_aerofeed_home, ConfigError, CoreConfig, SourceConfig};

// Data source trait and errors
pub use data_source::{DataSource, SourceError, SourceErrorKind};

// Domain models
pub use domain::{AreaFilter, CanonicalRecord, FieldMap, GeoPoint, QueryTarget, SourceRecord, UtcDateTime};

// Error types
pub use error::{CoreError, ValidationError};

// Request execution
pub use executor::{ExecutorConfig, RequestError, RequestExecutor, RequestOptions, Response};

// Feeds
pub use feeds::{FeedConfig, FeedSettings, MetarFeed, NotamFeed, OpenSkyFeed, ReadsbFeed};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
};

// Notifications
pub use notify::{Notification, Notifier};

// Retry logic
pub use retry::{Backoff, RetryConfig};

// Service
pub use service::AcquisitionService;

// Throttling
pub use throttling::{RateLimit, ServiceThrottle};
