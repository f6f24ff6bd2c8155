use std::io::{self, Write};

use serde_json::Value;

use crate::error::CliError;

/// Writes one JSON document to stdout. A closed pipe surfaces as [`CliError::Io`].
pub fn render(data: &Value, pretty: bool) -> Result<(), CliError> {
    let payload = if pretty {
        serde_json::to_string_pretty(data)?
    } else {
        serde_json::to_string(data)?
    };

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{payload}")?;
    stdout.flush()?;
    Ok(())
}
