mod cache;
mod health;
mod query;

use aerofeed_core::{resolve_aerofeed_home, AcquisitionService, CoreConfig};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub struct CommandResult {
    pub data: Value,
    /// No source answered and nothing cached could stand in.
    pub unanswered: bool,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            unanswered: false,
        }
    }
}

pub async fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    let config = load_config(cli)?;
    let service = AcquisitionService::new(config)?;
    service.start().await?;

    let result = match &cli.command {
        Command::Query(args) => query::run(args, &service, !cli.no_merge).await,
        Command::Health(args) => health::status(args, &service),
        Command::Reset(args) => health::reset(args, &service).await,
        Command::Cache(args) => cache::run(args, &service).await,
    };

    // Persist breaker state and pending cache writes even when the command failed.
    let stopped = service.stop().await.map_err(CliError::from);
    settle(result, stopped)
}

/// A command error takes precedence over a shutdown error, which is logged instead.
fn settle<T>(result: Result<T, CliError>, stopped: Result<(), CliError>) -> Result<T, CliError> {
    match (result, stopped) {
        (Err(error), Err(stop_error)) => {
            tracing::warn!(error = %stop_error, "shutdown after failed command also failed");
            Err(error)
        }
        (result, stopped) => {
            stopped?;
            result
        }
    }
}

fn load_config(cli: &Cli) -> Result<CoreConfig, CliError> {
    let config = match &cli.config {
        Some(path) => CoreConfig::from_json_file(path)?,
        None => CoreConfig::default(),
    };
    Ok(config.with_home_defaults(&resolve_aerofeed_home()))
}

/// Rejects service names that are not configured sources.
fn ensure_known_source(service: &AcquisitionService, name: &str) -> Result<(), CliError> {
    if service.aggregator().source_ids().contains(&name) {
        Ok(())
    } else {
        Err(CliError::UnknownSource(name.to_owned()))
    }
}
