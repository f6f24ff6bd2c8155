//! Data source trait and structured source errors.
//!
//! A [`DataSource`] turns a [`QueryTarget`] into zero or more
//! [`SourceRecord`]s. All network access goes through the shared
//! [`RequestExecutor`], so caching, retries and circuit breaking apply to
//! every feed uniformly.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::executor::{RequestError, RequestExecutor};
use crate::{QueryTarget, SourceRecord};

/// Source-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    UnsupportedTarget,
    Unavailable,
    Timeout,
    RateLimited,
    Rejected,
    CircuitOpen,
    InvalidRequest,
    InvalidResponse,
    Internal,
}

/// Structured error returned by [`DataSource::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
    retryable: bool,
}

impl SourceError {
    fn new(kind: SourceErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn unsupported_target(target: &QueryTarget) -> Self {
        Self::new(
            SourceErrorKind::UnsupportedTarget,
            format!("target '{target}' is not supported by this source"),
            false,
        )
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Unavailable, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Timeout, message, true)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::InvalidRequest, message, false)
    }

    /// The upstream answered, but not with anything this source can parse.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::InvalidResponse, message, false)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Internal, message, false)
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::UnsupportedTarget => "source.unsupported_target",
            SourceErrorKind::Unavailable => "source.unavailable",
            SourceErrorKind::Timeout => "source.timeout",
            SourceErrorKind::RateLimited => "source.rate_limited",
            SourceErrorKind::Rejected => "source.rejected",
            SourceErrorKind::CircuitOpen => "source.circuit_open",
            SourceErrorKind::InvalidRequest => "source.invalid_request",
            SourceErrorKind::InvalidResponse => "source.invalid_response",
            SourceErrorKind::Internal => "source.internal",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for SourceError {}

impl From<RequestError> for SourceError {
    fn from(error: RequestError) -> Self {
        let message = error.to_string();
        match error {
            RequestError::Invalid(_) => Self::invalid_request(message),
            RequestError::Timeout { .. } => Self::timeout(message),
            RequestError::Network { retryable, .. } => {
                Self::new(SourceErrorKind::Unavailable, message, retryable)
            }
            RequestError::Upstream { .. } => Self::unavailable(message),
            RequestError::HttpClient { .. } => Self::new(SourceErrorKind::Rejected, message, false),
            RequestError::UnexpectedStatus { .. } => Self::invalid_response(message),
            RequestError::RateLimited { .. } => Self::new(SourceErrorKind::RateLimited, message, true),
            RequestError::CircuitOpen { .. } => {
                Self::new(SourceErrorKind::CircuitOpen, message, false)
            }
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(error: serde_json::Error) -> Self {
        Self::invalid_response(format!("malformed payload: {error}"))
    }
}

/// Boxed future returned by [`DataSource::fetch`].
pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<SourceRecord>, SourceError>> + Send + 'a>>;

/// Feed contract used by the aggregator.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`id`](DataSource::id) | Unique source identifier, recorded as provenance |
/// | [`priority`](DataSource::priority) | Merge rank; lower wins |
/// | [`enabled`](DataSource::enabled) | Disabled sources are never queried |
/// | [`service_name`](DataSource::service_name) | Circuit breaker and cache partition |
/// | [`supports`](DataSource::supports) | Whether a target makes sense for this feed |
/// | [`fetch`](DataSource::fetch) | Query the feed through the executor |
///
/// Implementations must be `Send + Sync`; the aggregator polls every source
/// of a query concurrently.
pub trait DataSource: Send + Sync {
    fn id(&self) -> &str;

    /// Lower value means higher priority.
    fn priority(&self) -> u32;

    fn enabled(&self) -> bool {
        true
    }

    /// Service the circuit breaker tracks for this source.
    fn service_name(&self) -> &str {
        self.id()
    }

    fn supports(&self, target: &QueryTarget) -> bool;

    /// Upper bound for one whole `fetch`, retries included. `None` uses the aggregator default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Fetches records for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the upstream fails (see [`From<RequestError>`])
    /// or answers with a payload that cannot be parsed.
    fn fetch<'a>(&'a self, executor: &'a RequestExecutor, target: &'a QueryTarget) -> FetchFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_errors_map_to_source_kinds() {
        let open = SourceError::from(RequestError::CircuitOpen {
            service: String::from("metar"),
        });
        assert_eq!(open.kind(), SourceErrorKind::CircuitOpen);
        assert_eq!(open.code(), "source.circuit_open");
        assert!(!open.retryable());

        let rejected = SourceError::from(RequestError::HttpClient {
            service: String::from("notam"),
            status: 401,
        });
        assert_eq!(rejected.kind(), SourceErrorKind::Rejected);

        let timeout = SourceError::from(RequestError::Timeout {
            service: String::from("readsb"),
            after: Duration::from_secs(5),
        });
        assert!(timeout.retryable());
        assert_eq!(timeout.code(), "source.timeout");
    }

    #[test]
    fn display_includes_code() {
        let error = SourceError::invalid_response("unexpected field");
        assert_eq!(error.to_string(), "unexpected field (source.invalid_response)");
    }
}
