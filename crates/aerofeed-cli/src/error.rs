use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] aerofeed_core::ValidationError),

    #[error(transparent)]
    Config(#[from] aerofeed_core::ConfigError),

    #[error(transparent)]
    Core(#[from] aerofeed_core::CoreError),

    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::UnknownSource(_) => 2,
            Self::Config(_) => 7,
            Self::Core(_) => 8,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}
