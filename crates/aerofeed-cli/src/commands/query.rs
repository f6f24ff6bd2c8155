use std::time::Duration;

use aerofeed_core::{AcquisitionService, AreaFilter, GeoPoint, QueryTarget};

use crate::cli::{QueryArgs, QueryCommand};
use crate::error::CliError;

use super::CommandResult;

pub async fn run(
    args: &QueryArgs,
    service: &AcquisitionService,
    merge: bool,
) -> Result<CommandResult, CliError> {
    let target = target_for(&args.command)?;
    let report = service.query_with(&target, merge).await;

    let unanswered = report.records.is_empty()
        && !report.from_cache
        && !report.outcomes.iter().any(|outcome| outcome.succeeded());

    Ok(CommandResult {
        data: serde_json::to_value(&report)?,
        unanswered,
    })
}

fn target_for(command: &QueryCommand) -> Result<QueryTarget, CliError> {
    let target = match command {
        QueryCommand::Station { icao } => QueryTarget::identity(icao)?,
        QueryCommand::Aircraft { hex } => QueryTarget::identity(hex)?,
        QueryCommand::Area(area) => {
            let center = GeoPoint::new(area.lat, area.lon)?;
            let mut filter = AreaFilter::new(center, area.radius_nm)?;
            if let Some(max_age) = area.max_age_secs {
                filter = filter.with_max_age(Duration::from_secs(max_age));
            }
            QueryTarget::area(filter)
        }
    };
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::AreaArgs;

    #[test]
    fn area_arguments_are_validated() {
        let command = QueryCommand::Area(AreaArgs {
            lat: 91.0,
            lon: 0.0,
            radius_nm: 10.0,
            max_age_secs: None,
        });
        assert!(matches!(target_for(&command), Err(CliError::Validation(_))));
    }

    #[test]
    fn station_codes_become_identity_targets() {
        let target = target_for(&QueryCommand::Station {
            icao: String::from("KJFK"),
        })
        .expect("valid");
        assert_eq!(target.identity_key(), Some("kjfk"));
    }
}
