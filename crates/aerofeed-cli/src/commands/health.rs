use serde_json::json;

use aerofeed_core::AcquisitionService;

use crate::cli::{HealthArgs, ResetArgs};
use crate::error::CliError;

use super::{ensure_known_source, CommandResult};

pub fn status(args: &HealthArgs, service: &AcquisitionService) -> Result<CommandResult, CliError> {
    let data = match &args.service {
        Some(name) => {
            ensure_known_source(service, name)?;
            serde_json::to_value(service.health(name))?
        }
        None => json!({
            "services": service.health_all(),
            "notifications": service.notifications(),
        }),
    };
    Ok(CommandResult::ok(data))
}

pub async fn reset(args: &ResetArgs, service: &AcquisitionService) -> Result<CommandResult, CliError> {
    ensure_known_source(service, &args.service)?;
    let was_open = service.reset(&args.service).await?;
    Ok(CommandResult::ok(json!({
        "service": args.service,
        "was_open": was_open,
        "health": service.health(&args.service),
    })))
}
