use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::data_source::{DataSource, FetchFuture, SourceError};
use crate::executor::RequestExecutor;
use crate::feeds::{is_location_code, mark_stale, number, FeedSettings, DEFAULT_METAR_URL};
use crate::{QueryTarget, SourceRecord, UtcDateTime};

/// Surface observations from the aviationweather.gov data API.
#[derive(Debug, Clone)]
pub struct MetarFeed {
    settings: FeedSettings,
    base_url: String,
}

/// Subset of the METAR JSON document this feed reads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetarObservation {
    icao_id: Option<String>,
    obs_time: Option<f64>,
    report_time: Option<String>,
    raw_ob: Option<String>,
    temp: Option<Value>,
    dewp: Option<Value>,
    wdir: Option<Value>,
    wspd: Option<Value>,
    wgst: Option<Value>,
    visib: Option<Value>,
    altim: Option<Value>,
    flt_cat: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    elev: Option<Value>,
    name: Option<String>,
    #[serde(default)]
    clouds: Vec<Value>,
}

impl MetarFeed {
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            settings,
            base_url: String::from(DEFAULT_METAR_URL),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn query_for(target: &QueryTarget) -> Option<String> {
        match target {
            QueryTarget::Identity { key } if is_location_code(key) => {
                Some(format!("ids={}", key.to_ascii_uppercase()))
            }
            QueryTarget::Identity { .. } => None,
            QueryTarget::Area(area) => {
                let (south, west, north, east) = area.center.bounding_box(area.radius_nm);
                Some(format!("bbox={south:.2},{west:.2},{north:.2},{east:.2}"))
            }
        }
    }

    /// Observations without a timestamp are dated `retrieved_at`.
    fn parse(&self, body: &str, retrieved_at: UtcDateTime) -> Result<Vec<SourceRecord>, SourceError> {
        // The API answers an empty body (204) when nothing matches.
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let observations: Vec<MetarObservation> = serde_json::from_str(body)?;

        let mut records = Vec::with_capacity(observations.len());
        for observation in observations {
            let Some(station) = observation.icao_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
            else {
                tracing::debug!(source = %self.settings.id, "skipping observation without station id");
                continue;
            };

            let observed_at = observation
                .obs_time
                .and_then(UtcDateTime::from_unix_seconds)
                .or_else(|| {
                    observation
                        .report_time
                        .as_deref()
                        .and_then(|time| UtcDateTime::parse(time).ok())
                })
                .unwrap_or(retrieved_at);

            let record = SourceRecord::new(&self.settings.id, self.settings.priority, station, observed_at)
                .map_err(|error| SourceError::invalid_response(error.to_string()))?
                .with_field("station", station.to_ascii_uppercase())
                .with_optional_field("name", observation.name)
                .with_optional_field("raw_text", observation.raw_ob)
                .with_optional_field("temperature_c", number(observation.temp.as_ref()))
                .with_optional_field("dewpoint_c", number(observation.dewp.as_ref()))
                .with_field("wind_dir_deg", observation.wdir.unwrap_or(Value::Null))
                .with_optional_field("wind_speed_kt", number(observation.wspd.as_ref()))
                .with_optional_field("wind_gust_kt", number(observation.wgst.as_ref()))
                .with_field("visibility_sm", observation.visib.unwrap_or(Value::Null))
                .with_optional_field("altimeter_hpa", number(observation.altim.as_ref()))
                .with_optional_field("flight_category", observation.flt_cat)
                .with_optional_field("latitude", observation.lat)
                .with_optional_field("longitude", observation.lon)
                .with_optional_field("elevation_m", number(observation.elev.as_ref()))
                .with_optional_field(
                    "clouds",
                    (!observation.clouds.is_empty()).then(|| Value::Array(observation.clouds)),
                );
            records.push(record);
        }
        Ok(records)
    }
}

impl DataSource for MetarFeed {
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
            let url = format!("{}/metar?{query}&format=json", self.base_url);
            let options = self.settings.request(url, format!("metar:{query}"));

            let response = executor.execute(options).await?;
            let records = self.parse(&response.body, response.retrieved_at())?;
            Ok(mark_stale(records, &response))
        })
    }
}
