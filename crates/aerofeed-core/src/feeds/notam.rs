use std::time::Duration;

use serde::Deserialize;

use crate::data_source::{DataSource, FetchFuture, SourceError};
use crate::executor::RequestExecutor;
use crate::feeds::{is_location_code, mark_stale, FeedSettings, DEFAULT_NOTAM_URL};
use crate::http_client::HttpAuth;
use crate::{QueryTarget, SourceRecord, UtcDateTime};

const PAGE_SIZE: u32 = 100;
/// The API rejects larger search radii.
const MAX_RADIUS_NM: f64 = 100.0;

/// FAA API client credentials, sent as `client_id` / `client_secret` headers.
#[derive(Clone, PartialEq, Eq)]
pub struct NotamCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for NotamCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotamCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Notices to air missions from the FAA NOTAM API.
#[derive(Debug, Clone)]
pub struct NotamFeed {
    settings: FeedSettings,
    base_url: String,
    credentials: Option<NotamCredentials>,
}

#[derive(Debug, Deserialize)]
struct NotamPage {
    #[serde(default)]
    items: Vec<NotamItem>,
}

#[derive(Debug, Deserialize)]
struct NotamItem {
    properties: NotamProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotamProperties {
    #[serde(rename = "coreNOTAMData")]
    core: NotamCore,
}

#[derive(Debug, Deserialize)]
struct NotamCore {
    notam: NotamData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotamData {
    id: Option<String>,
    number: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    issued: Option<String>,
    last_updated: Option<String>,
    location: Option<String>,
    icao_location: Option<String>,
    effective_start: Option<String>,
    effective_end: Option<String>,
    text: Option<String>,
    classification: Option<String>,
    selection_code: Option<String>,
}

impl NotamFeed {
    pub fn new(settings: FeedSettings, credentials: Option<NotamCredentials>) -> Self {
        Self {
            settings,
            base_url: String::from(DEFAULT_NOTAM_URL),
            credentials,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn query_for(target: &QueryTarget) -> Option<String> {
        match target {
            QueryTarget::Identity { key } if is_location_code(key) => {
                Some(format!("icaoLocation={}", key.to_ascii_uppercase()))
            }
            QueryTarget::Identity { .. } => None,
            QueryTarget::Area(area) => Some(format!(
                "locationLatitude={:.4}&locationLongitude={:.4}&locationRadius={:.0}",
                area.center.latitude,
                area.center.longitude,
                area.radius_nm.min(MAX_RADIUS_NM).ceil()
            )),
        }
    }

    /// Notices stay in force long after issue, so records are dated when they
    /// were retrieved; the issue and update times are kept as fields.
    fn parse(&self, body: &str, retrieved_at: UtcDateTime) -> Result<Vec<SourceRecord>, SourceError> {
        let page: NotamPage = serde_json::from_str(body)?;

        let mut records = Vec::with_capacity(page.items.len());
        for item in page.items {
            let notam = item.properties.core.notam;
            let Some(id) = notam.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) else {
                continue;
            };

            let record = SourceRecord::new(&self.settings.id, self.settings.priority, id, retrieved_at)
                .map_err(|error| SourceError::invalid_response(error.to_string()))?
                .with_optional_field("number", notam.number)
                .with_optional_field("notam_type", notam.kind)
                .with_optional_field("location", notam.icao_location.or(notam.location))
                .with_optional_field("text", notam.text)
                .with_optional_field("classification", notam.classification)
                .with_optional_field("selection_code", notam.selection_code)
                .with_optional_field("issued", notam.issued)
                .with_optional_field("last_updated", notam.last_updated)
                .with_optional_field("effective_start", notam.effective_start)
                .with_optional_field("effective_end", notam.effective_end);
            records.push(record);
        }
        Ok(records)
    }
}

impl DataSource for NotamFeed {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn priority(&self) -> u32 {
        self.settings.priority
    }

    /// Requires credentials; the API refuses anonymous calls.
    fn enabled(&self) -> bool {
        self.settings.enabled && self.credentials.is_some()
    }

    fn supports(&self, target: &QueryTarget) -> bool {
        Self::query_for(target).is_some()
    }

    fn timeout(&self) -> Option<Duration> {
        self.settings.timeout
    }

    fn fetch<'a>(&'a self, executor: &'a RequestExecutor, target: &'a QueryTarget) -> FetchFuture<'a> {
        Box::pin(async move {
            let credentials = self
                .credentials
                .as_ref()
                .ok_or_else(|| SourceError::invalid_request("NOTAM API credentials are not configured"))?;
            let query = Self::query_for(target).ok_or_else(|| SourceError::unsupported_target(target))?;
            let url = format!(
                "{}/notams?{query}&pageSize={PAGE_SIZE}&sortBy=effectiveStartDate&sortOrder=Desc",
                self.base_url
            );

            let options = self
                .settings
                .request(url, format!("notam:{query}"))
                .with_auth(&HttpAuth::Header {
                    name: String::from("client_id"),
                    value: credentials.client_id.clone(),
                })
                .with_auth(&HttpAuth::Header {
                    name: String::from("client_secret"),
                    value: credentials.client_secret.clone(),
                });

            let response = executor.execute(options).await?;
            let records = self.parse(&response.body, response.retrieved_at())?;
            Ok(mark_stale(records, &response))
        })
    }
}
