use thiserror::Error;

/// Validation and contract errors exposed by `aerofeed-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("identity key cannot be empty")]
    EmptyIdentityKey,
    #[error("service name cannot be empty")]
    EmptyServiceName,

    #[error("cache namespace '{value}' must be non-empty and free of path separators")]
    InvalidNamespace { value: String },
    #[error("cache key cannot be empty")]
    EmptyCacheKey,

    #[error("invalid http method '{value}', expected GET or POST")]
    InvalidMethod { value: String },

    #[error("latitude {value} is outside [-90, 90]")]
    InvalidLatitude { value: String },
    #[error("longitude {value} is outside [-180, 180]")]
    InvalidLongitude { value: String },
    #[error("radius must be positive and finite, got {value}")]
    InvalidRadius { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("source '{id}' is configured more than once")]
    DuplicateSource { id: String },
    #[error("field '{field}' must be greater than zero")]
    ZeroValue { field: &'static str },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
