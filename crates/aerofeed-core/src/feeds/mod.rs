//! # Feeds
//!
//! Concrete [`DataSource`] implementations, selected by [`FeedConfig`].
//!
//! | Feed | Upstream | Identity key |
//! |------|----------|--------------|
//! | [`MetarFeed`] | aviationweather.gov METAR API | Station ICAO code |
//! | [`NotamFeed`] | FAA NOTAM API | NOTAM id |
//! | [`ReadsbFeed`] | readsb v2 JSON (adsb.lol, airplanes.live) | ICAO 24-bit address |
//! | [`OpenSkyFeed`] | OpenSky Network `states/all` | ICAO 24-bit address |
//!
//! Traffic feeds share field names (`callsign`, `altitude_ft`,
//! `ground_speed_kt`, `track_deg`, `latitude`, `longitude`, `squawk`,
//! `aircraft_type`, `registration`, `on_ground`) so their reports merge.

mod metar;
mod notam;
mod opensky;
mod readsb;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::StaleCeiling;
use crate::data_source::DataSource;
use crate::executor::{RequestOptions, Response};
use crate::SourceRecord;

pub use metar::MetarFeed;
pub use notam::{NotamCredentials, NotamFeed};
pub use opensky::OpenSkyFeed;
pub use readsb::ReadsbFeed;

pub const DEFAULT_METAR_URL: &str = "https://aviationweather.gov/api/data";
pub const DEFAULT_NOTAM_URL: &str = "https://external-api.faa.gov/notamapi/v1";
pub const DEFAULT_READSB_URL: &str = "https://api.adsb.lol/v2";
pub const DEFAULT_OPENSKY_URL: &str = "https://opensky-network.org/api";

const FEET_PER_METER: f64 = 3.280_84;
const KNOTS_PER_MPS: f64 = 1.943_844;

/// Which upstream a configured source talks to, plus feed-specific settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedConfig {
    Metar {
        #[serde(default = "default_metar_url")]
        base_url: String,
    },
    Notam {
        #[serde(default = "default_notam_url")]
        base_url: String,
        #[serde(default = "default_notam_client_id_env")]
        client_id_env: String,
        #[serde(default = "default_notam_client_secret_env")]
        client_secret_env: String,
    },
    Readsb {
        #[serde(default = "default_readsb_url")]
        base_url: String,
    },
    Opensky {
        #[serde(default = "default_opensky_url")]
        base_url: String,
        #[serde(default)]
        username_env: Option<String>,
        #[serde(default)]
        password_env: Option<String>,
    },
}

impl FeedConfig {
    pub fn metar() -> Self {
        Self::Metar {
            base_url: default_metar_url(),
        }
    }

    pub fn notam() -> Self {
        Self::Notam {
            base_url: default_notam_url(),
            client_id_env: default_notam_client_id_env(),
            client_secret_env: default_notam_client_secret_env(),
        }
    }

    pub fn readsb() -> Self {
        Self::Readsb {
            base_url: default_readsb_url(),
        }
    }

    /// Anonymous OpenSky access.
    pub fn opensky() -> Self {
        Self::Opensky {
            base_url: default_opensky_url(),
            username_env: None,
            password_env: None,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Metar { .. } => "metar",
            Self::Notam { .. } => "notam",
            Self::Readsb { .. } => "readsb",
            Self::Opensky { .. } => "opensky",
        }
    }
}

fn default_metar_url() -> String {
    String::from(DEFAULT_METAR_URL)
}

fn default_notam_url() -> String {
    String::from(DEFAULT_NOTAM_URL)
}

fn default_notam_client_id_env() -> String {
    String::from("FAA_NOTAM_CLIENT_ID")
}

fn default_notam_client_secret_env() -> String {
    String::from("FAA_NOTAM_CLIENT_SECRET")
}

fn default_readsb_url() -> String {
    String::from(DEFAULT_READSB_URL)
}

fn default_opensky_url() -> String {
    String::from(DEFAULT_OPENSKY_URL)
}

/// Settings every feed shares: identity, merge rank and caching policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    pub id: String,
    pub priority: u32,
    pub enabled: bool,
    /// Cache TTL for raw responses; the cache default when unset.
    pub ttl: Option<Duration>,
    /// Whole-fetch timeout; the aggregator default when unset.
    pub timeout: Option<Duration>,
    pub stale_ceiling: Option<StaleCeiling>,
}

impl FeedSettings {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            priority,
            enabled: true,
            ttl: None,
            timeout: None,
            stale_ceiling: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cached GET against this source's service and namespace.
    fn request(&self, url: String, cache_key: String) -> RequestOptions {
        let mut options = RequestOptions::get(self.id.clone(), url).with_cache_key(cache_key);
        options.ttl = self.ttl;
        options.stale_ceiling = self.stale_ceiling;
        options
    }
}

/// Builds the source described by `feed`, reading credentials through `lookup_env`.
pub fn build_feed<F>(settings: FeedSettings, feed: &FeedConfig, lookup_env: F) -> Arc<dyn DataSource>
where
    F: Fn(&str) -> Option<String>,
{
    match feed {
        FeedConfig::Metar { base_url } => {
            Arc::new(MetarFeed::new(settings).with_base_url(base_url.clone()))
        }
        FeedConfig::Notam {
            base_url,
            client_id_env,
            client_secret_env,
        } => {
            let credentials = match (lookup_env(client_id_env), lookup_env(client_secret_env)) {
                (Some(client_id), Some(client_secret)) => Some(NotamCredentials {
                    client_id,
                    client_secret,
                }),
                _ => {
                    tracing::warn!(
                        source = %settings.id,
                        client_id_env = %client_id_env,
                        client_secret_env = %client_secret_env,
                        "NOTAM credentials not set; source disabled"
                    );
                    None
                }
            };
            Arc::new(NotamFeed::new(settings, credentials).with_base_url(base_url.clone()))
        }
        FeedConfig::Readsb { base_url } => {
            Arc::new(ReadsbFeed::new(settings).with_base_url(base_url.clone()))
        }
        FeedConfig::Opensky {
            base_url,
            username_env,
            password_env,
        } => {
            let username = username_env.as_deref().and_then(&lookup_env);
            let password = password_env.as_deref().and_then(&lookup_env);
            let mut feed = OpenSkyFeed::new(settings).with_base_url(base_url.clone());
            if let (Some(username), Some(password)) = (username, password) {
                feed = feed.with_basic_auth(username, password);
            }
            Arc::new(feed)
        }
    }
}

/// Carries a stale cache read over to every record parsed from it.
pub(crate) fn mark_stale(mut records: Vec<SourceRecord>, response: &Response) -> Vec<SourceRecord> {
    if response.is_stale {
        for record in &mut records {
            record.is_stale = true;
        }
    }
    records
}

/// Three or four alphanumerics, e.g. `kjfk` or `jfk`.
pub(crate) fn is_location_code(key: &str) -> bool {
    (3..=4).contains(&key.len()) && key.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Six hex digits, optionally prefixed by `~` for non-ICAO (TIS-B) addresses.
pub(crate) fn is_icao24(key: &str) -> bool {
    let hex = key.strip_prefix('~').unwrap_or(key);
    hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Numeric value from a JSON number or numeric string.
pub(crate) fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Trimmed, non-empty string.
pub(crate) fn text(value: Option<&Value>) -> Option<String> {
    let trimmed = value?.as_str()?.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

pub(crate) fn meters_to_feet(meters: f64) -> i64 {
    (meters * FEET_PER_METER).round() as i64
}

pub(crate) fn mps_to_knots(mps: f64) -> f64 {
    round_to(mps * KNOTS_PER_MPS, 1)
}
