//! Runtime configuration for the acquisition layer.
//!
//! A [`CoreConfig`] is read from a JSON file (every section optional) and
//! validated before anything is constructed from it:
//!
//! ```json
//! {
//!   "cache": { "max_entries": 1024, "default_ttl_secs": 120 },
//!   "breaker": { "failure_threshold": 3 },
//!   "sources": [
//!     { "id": "adsb_lol", "kind": "readsb", "priority": 1, "ttl_secs": 5 },
//!     { "id": "opensky", "kind": "opensky", "priority": 2, "max_stale": "unlimited" }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::AggregatorConfig;
use crate::cache::{validate_namespace, CacheConfig, StaleCeiling};
use crate::circuit_breaker::BreakerConfig;
use crate::executor::ExecutorConfig;
use crate::feeds::{FeedConfig, FeedSettings};
use crate::throttling::RateLimit;
use crate::ValidationError;

const CACHE_DIR: &str = "cache";
const CHECKPOINT_FILE: &str = "breaker.json";

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

/// Everything needed to assemble an [`AcquisitionService`](crate::service::AcquisitionService).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
    pub breaker: BreakerConfig,
    pub aggregator: AggregatorConfig,
    pub sources: Vec<SourceConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            executor: ExecutorConfig::default(),
            breaker: BreakerConfig::default(),
            aggregator: AggregatorConfig::default(),
            sources: default_sources(),
        }
    }
}

/// One configured upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source id, also used as its service name and cache namespace.
    pub id: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub max_stale: StaleCeiling,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    #[serde(flatten)]
    pub feed: FeedConfig,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, priority: u32, feed: FeedConfig) -> Self {
        Self {
            id: id.into(),
            priority,
            enabled: true,
            timeout_secs: None,
            ttl_secs: None,
            max_stale: StaleCeiling::default(),
            rate_limit: None,
            feed,
        }
    }

    pub fn settings(&self) -> FeedSettings {
        FeedSettings {
            id: self.id.clone(),
            priority: self.priority,
            enabled: self.enabled,
            ttl: self.ttl_secs.map(Duration::from_secs),
            timeout: self.timeout_secs.map(Duration::from_secs),
            stale_ceiling: Some(self.max_stale),
        }
    }
}

impl CoreConfig {
    /// Reads and validates a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cache.max_entries == 0 {
            return Err(ValidationError::ZeroValue {
                field: "cache.max_entries",
            });
        }
        if self.cache.default_ttl.is_zero() {
            return Err(ValidationError::ZeroValue {
                field: "cache.default_ttl_secs",
            });
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ValidationError::ZeroValue {
                field: "breaker.failure_threshold",
            });
        }
        if self.executor.timeout.is_zero() {
            return Err(ValidationError::ZeroValue {
                field: "executor.timeout_secs",
            });
        }
        if self.aggregator.per_source_timeout.is_zero() {
            return Err(ValidationError::ZeroValue {
                field: "aggregator.per_source_timeout_secs",
            });
        }
        validate_namespace(&self.aggregator.canonical_namespace)?;

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(ValidationError::EmptyServiceName);
            }
            validate_namespace(&source.id)?;
            if !seen.insert(source.id.as_str()) {
                return Err(ValidationError::DuplicateSource {
                    id: source.id.clone(),
                });
            }
            if source.timeout_secs == Some(0) {
                return Err(ValidationError::ZeroValue {
                    field: "sources.timeout_secs",
                });
            }
            if source.ttl_secs == Some(0) {
                return Err(ValidationError::ZeroValue {
                    field: "sources.ttl_secs",
                });
            }
            if let Some(limit) = source.rate_limit {
                if limit.limit == 0 || limit.window.is_zero() {
                    return Err(ValidationError::ZeroValue {
                        field: "sources.rate_limit",
                    });
                }
            }
        }
        Ok(())
    }

    /// Fills unset storage paths with locations under `home`.
    pub fn with_home_defaults(mut self, home: &Path) -> Self {
        if self.cache.root_dir.is_none() {
            self.cache.root_dir = Some(home.join(CACHE_DIR));
        }
        if self.breaker.checkpoint_path.is_none() {
            self.breaker.checkpoint_path = Some(home.join(CHECKPOINT_FILE));
        }
        self
    }
}

/// Public feeds that work without an account, plus the FAA NOTAM API when
/// its credentials are present in the environment.
pub fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new("aviationweather", 1, FeedConfig::metar()),
        SourceConfig::new("faa_notam", 1, FeedConfig::notam()),
        SourceConfig::new("adsb_lol", 1, FeedConfig::readsb()),
        SourceConfig::new("opensky", 2, FeedConfig::opensky()),
    ]
}

/// Resolves the data directory from `AEROFEED_HOME`, falling back to `$HOME/.aerofeed`.
pub fn resolve_aerofeed_home() -> PathBuf {
    home_from(env::var_os("AEROFEED_HOME"), env::var_os("HOME"))
}

fn home_from(aerofeed_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    if let Some(path) = aerofeed_home {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = home {
        return PathBuf::from(home).join(".aerofeed");
    }

    PathBuf::from(".aerofeed")
}

/// Serde adapter for `Duration` fields written as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde adapter for `Duration` fields written as whole milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
