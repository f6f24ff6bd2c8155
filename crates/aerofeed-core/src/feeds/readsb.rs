use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::data_source::{DataSource, FetchFuture, SourceError};
use crate::executor::RequestExecutor;
use crate::feeds::{is_icao24, mark_stale, number, round_to, FeedSettings, DEFAULT_READSB_URL};
use crate::{QueryTarget, SourceRecord, UtcDateTime};

/// The v2 `point` endpoint caps the radius at 250 nm.
const MAX_RADIUS_NM: f64 = 250.0;

/// Live traffic from a readsb-compatible v2 JSON API (adsb.lol, airplanes.live).
#[derive(Debug, Clone)]
pub struct ReadsbFeed {
    settings: FeedSettings,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ReadsbResponse {
    #[serde(default)]
    ac: Vec<ReadsbAircraft>,
    /// Server time in milliseconds since the epoch.
    now: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ReadsbAircraft {
    hex: Option<String>,
    flight: Option<String>,
    #[serde(rename = "r")]
    registration: Option<String>,
    #[serde(rename = "t")]
    aircraft_type: Option<String>,
    /// Feet, or the string `"ground"`.
    alt_baro: Option<Value>,
    alt_geom: Option<Value>,
    gs: Option<Value>,
    track: Option<Value>,
    squawk: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    /// Seconds since any message was received.
    seen: Option<f64>,
    /// Seconds since the last position update.
    seen_pos: Option<f64>,
}

impl ReadsbFeed {
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            settings,
            base_url: String::from(DEFAULT_READSB_URL),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn path_for(target: &QueryTarget) -> Option<String> {
        match target {
            QueryTarget::Identity { key } if is_icao24(key) => Some(format!("hex/{key}")),
            QueryTarget::Identity { .. } => None,
            QueryTarget::Area(area) => Some(format!(
                "point/{:.4}/{:.4}/{:.0}",
                area.center.latitude,
                area.center.longitude,
                area.radius_nm.min(MAX_RADIUS_NM).ceil()
            )),
        }
    }

    fn parse(&self, body: &str, retrieved_at: UtcDateTime) -> Result<Vec<SourceRecord>, SourceError> {
        let response: ReadsbResponse = serde_json::from_str(body)?;
        let server_time = response
            .now
            .and_then(|millis| UtcDateTime::from_unix_seconds(millis / 1000.0))
            .unwrap_or(retrieved_at);

        let mut records = Vec::with_capacity(response.ac.len());
        for aircraft in response.ac {
            let Some(hex) = aircraft.hex.as_deref().map(str::trim).filter(|hex| !hex.is_empty()) else {
                continue;
            };

            let lag = aircraft.seen_pos.or(aircraft.seen).unwrap_or(0.0).max(0.0);
            let Some(observed_at) = Duration::try_from_secs_f64(lag)
                .ok()
                .and_then(|lag| server_time.checked_minus(lag))
            else {
                tracing::debug!(source = %self.settings.id, hex, lag, "skipping aircraft with out-of-range age");
                continue;
            };

            let on_ground = match &aircraft.alt_baro {
                Some(Value::String(state)) => Some(state.eq_ignore_ascii_case("ground")),
                Some(Value::Number(_)) => Some(false),
                _ => None,
            };
            let altitude_ft = number(aircraft.alt_baro.as_ref())
                .or_else(|| number(aircraft.alt_geom.as_ref()))
                .map(|feet| feet.round() as i64);

            let record = SourceRecord::new(&self.settings.id, self.settings.priority, hex, observed_at)
                .map_err(|error| SourceError::invalid_response(error.to_string()))?
                .with_optional_field("callsign", callsign(aircraft.flight.as_deref()))
                .with_optional_field("registration", aircraft.registration)
                .with_optional_field("aircraft_type", aircraft.aircraft_type)
                .with_optional_field("altitude_ft", altitude_ft)
                .with_optional_field("on_ground", on_ground)
                .with_optional_field(
                    "ground_speed_kt",
                    number(aircraft.gs.as_ref()).map(|speed| round_to(speed, 1)),
                )
                .with_optional_field(
                    "track_deg",
                    number(aircraft.track.as_ref()).map(|track| round_to(track, 1)),
                )
                .with_optional_field("squawk", aircraft.squawk)
                .with_optional_field("latitude", aircraft.lat)
                .with_optional_field("longitude", aircraft.lon);
            records.push(record);
        }
        Ok(records)
    }
}

/// Callsigns arrive space-padded to eight characters.
fn callsign(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

impl DataSource for ReadsbFeed {
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
        Self::path_for(target).is_some()
    }

    fn timeout(&self) -> Option<Duration> {
        self.settings.timeout
    }

    fn fetch<'a>(&'a self, executor: &'a RequestExecutor, target: &'a QueryTarget) -> FetchFuture<'a> {
        Box::pin(async move {
            let path = Self::path_for(target).ok_or_else(|| SourceError::unsupported_target(target))?;
            let url = format!("{}/{path}", self.base_url);
            let options = self.settings.request(url, format!("readsb:{path}"));

            let response = executor.execute(options).await?;
            let records = self.parse(&response.body, response.retrieved_at())?;
            Ok(mark_stale(records, &response))
        })
    }
}
