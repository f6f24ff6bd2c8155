use serde_json::json;

use aerofeed_core::cache::validate_namespace;
use aerofeed_core::AcquisitionService;

use crate::cli::{CacheArgs, CacheCommand};
use crate::error::CliError;

use super::CommandResult;

pub async fn run(args: &CacheArgs, service: &AcquisitionService) -> Result<CommandResult, CliError> {
    let data = match &args.command {
        CacheCommand::Stats {
            namespace: Some(namespace),
        } => {
            validate_namespace(namespace)?;
            json!({ "namespace": namespace, "stats": service.cache_stats(namespace) })
        }
        CacheCommand::Stats { namespace: None } => json!({ "namespaces": service.all_cache_stats() }),
        CacheCommand::Clear { namespace } => {
            service.clear_cache(namespace).await?;
            json!({ "namespace": namespace, "cleared": true })
        }
    };
    Ok(CommandResult::ok(data))
}
