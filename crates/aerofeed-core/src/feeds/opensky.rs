use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::data_source::{DataSource, FetchFuture, SourceError};
use crate::executor::RequestExecutor;
use crate::feeds::{
    is_icao24, mark_stale, meters_to_feet, mps_to_knots, number, round_to, text, FeedSettings,
    DEFAULT_OPENSKY_URL,
};
use crate::http_client::HttpAuth;
use crate::{QueryTarget, SourceRecord, UtcDateTime};

// Positions within a state vector array.
const ICAO24: usize = 0;
const CALLSIGN: usize = 1;
const ORIGIN_COUNTRY: usize = 2;
const TIME_POSITION: usize = 3;
const LAST_CONTACT: usize = 4;
const LONGITUDE: usize = 5;
const LATITUDE: usize = 6;
const BARO_ALTITUDE: usize = 7;
const ON_GROUND: usize = 8;
const VELOCITY: usize = 9;
const TRUE_TRACK: usize = 10;
const VERTICAL_RATE: usize = 11;
const GEO_ALTITUDE: usize = 13;
const SQUAWK: usize = 14;

/// State vectors from the OpenSky Network REST API.
///
/// Anonymous access works with a tighter rate limit; configure basic auth
/// credentials to lift it.
#[derive(Debug, Clone)]
pub struct OpenSkyFeed {
    settings: FeedSettings,
    base_url: String,
    auth: HttpAuth,
}

#[derive(Debug, Deserialize)]
struct StatesResponse {
    time: Option<f64>,
    /// `null` when nothing matches.
    #[serde(default)]
    states: Option<Vec<Vec<Value>>>,
}

impl OpenSkyFeed {
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            settings,
            base_url: String::from(DEFAULT_OPENSKY_URL),
            auth: HttpAuth::None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = HttpAuth::Basic {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    fn query_for(target: &QueryTarget) -> Option<String> {
        match target {
            // OpenSky has no entry for non-ICAO (`~`) addresses.
            QueryTarget::Identity { key } if is_icao24(key) && !key.starts_with('~') => {
                Some(format!("icao24={key}"))
            }
            QueryTarget::Identity { .. } => None,
            QueryTarget::Area(area) => {
                let (south, west, north, east) = area.center.bounding_box(area.radius_nm);
                Some(format!(
                    "lamin={south:.4}&lomin={west:.4}&lamax={north:.4}&lomax={east:.4}"
                ))
            }
        }
    }

    fn parse(&self, body: &str, retrieved_at: UtcDateTime) -> Result<Vec<SourceRecord>, SourceError> {
        let response: StatesResponse = serde_json::from_str(body)?;
        let states = response.states.unwrap_or_default();
        let snapshot_time = response.time.and_then(UtcDateTime::from_unix_seconds);

        let mut records = Vec::with_capacity(states.len());
        for state in &states {
            let Some(icao24) = text(state.get(ICAO24)) else {
                continue;
            };

            let observed_at = [TIME_POSITION, LAST_CONTACT]
                .into_iter()
                .find_map(|index| number(state.get(index)).and_then(UtcDateTime::from_unix_seconds))
                .or(snapshot_time)
                .unwrap_or(retrieved_at);

            let altitude_ft = number(state.get(BARO_ALTITUDE))
                .or_else(|| number(state.get(GEO_ALTITUDE)))
                .map(meters_to_feet);

            let record = SourceRecord::new(&self.settings.id, self.settings.priority, &icao24, observed_at)
                .map_err(|error| SourceError::invalid_response(error.to_string()))?
                .with_optional_field("callsign", text(state.get(CALLSIGN)))
                .with_optional_field("origin_country", text(state.get(ORIGIN_COUNTRY)))
                .with_optional_field("altitude_ft", altitude_ft)
                .with_optional_field("on_ground", state.get(ON_GROUND).and_then(Value::as_bool))
                .with_optional_field("ground_speed_kt", number(state.get(VELOCITY)).map(mps_to_knots))
                .with_optional_field(
                    "track_deg",
                    number(state.get(TRUE_TRACK)).map(|track| round_to(track, 1)),
                )
                .with_optional_field(
                    "vertical_rate_fpm",
                    number(state.get(VERTICAL_RATE)).map(|rate| meters_to_feet(rate * 60.0)),
                )
                .with_optional_field("squawk", text(state.get(SQUAWK)))
                .with_optional_field("latitude", number(state.get(LATITUDE)))
                .with_optional_field("longitude", number(state.get(LONGITUDE)));
            records.push(record);
        }
        Ok(records)
    }
}

impl DataSource for OpenSkyFeed {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn priority(&self) -> u32 {
        self.settings.priority
    }

    fn enabled(&self) -> bool {
        self.settings.enabled
    }

    fn supports(&self, target: &QueryTarget) -> bool {
        Self::query_for(target).is_some()
    }

    fn timeout(&self) -> Option<Duration> {
        self.settings.timeout
    }

    fn fetch<'a>(&'a self, executor: &'a RequestExecutor, target: &'a QueryTarget) -> FetchFuture<'a> {
        Box::pin(async move {
            let query = Self::query_for(target).ok_or_else(|| SourceError::unsupported_target(target))?;
            let url = format!("{}/states/all?{query}", self.base_url);
            let options = self
                .settings
                .request(url, format!("opensky:{query}"))
                .with_auth(&self.auth);

            let response = executor.execute(options).await?;
            let records = self.parse(&response.body, response.retrieved_at())?;
            Ok(mark_stale(records, &response))
        })
    }
}
