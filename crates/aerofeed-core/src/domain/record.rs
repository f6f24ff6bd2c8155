use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{UtcDateTime, ValidationError};

/// Field map shared by source and canonical records. `Value::Null` means "not reported".
pub type FieldMap = BTreeMap<String, Value>;

/// One report about a real-world entity, as delivered by a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub priority: u32,
    pub identity_key: String,
    pub fields: FieldMap,
    pub observed_at: UtcDateTime,
    /// Parsed from a cached response served past its TTL.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_stale: bool,
}

impl SourceRecord {
    pub fn new(
        source_id: impl Into<String>,
        priority: u32,
        identity_key: impl AsRef<str>,
        observed_at: UtcDateTime,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            source_id: source_id.into(),
            priority,
            identity_key: normalize_identity_key(identity_key.as_ref())?,
            fields: FieldMap::new(),
            observed_at,
            is_stale: false,
        })
    }

    /// Sets a field; `None` and JSON null are stored as null so merges can fill them later.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_optional_field<V: Into<Value>>(
        mut self,
        name: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        self.fields
            .insert(name.into(), value.map(Into::into).unwrap_or(Value::Null));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }

    /// Reported WGS84 position, when the record carries `latitude`/`longitude` fields.
    pub fn position(&self) -> Option<(f64, f64)> {
        let latitude = self.field("latitude")?.as_f64()?;
        let longitude = self.field("longitude")?.as_f64()?;
        Some((latitude, longitude))
    }
}

/// Merged, priority-resolved view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub identity_key: String,
    pub fields: FieldMap,
    /// Every source that contributed a record, highest priority first.
    pub contributing_sources: Vec<String>,
    /// Which source supplied each populated field.
    pub provenance: BTreeMap<String, String>,
    /// Observation time of the oldest contributing record.
    pub observed_at: UtcDateTime,
    pub is_stale: bool,
}

impl CanonicalRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }
}

/// Identity keys are trimmed and lower-cased so `"ABC123"` and `"abc123 "` match across feeds.
pub fn normalize_identity_key(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyIdentityKey);
    }
    Ok(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keys_are_normalized() {
        let record = SourceRecord::new("readsb", 1, " A1B2C3 ", UtcDateTime::now())
            .expect("valid key");
        assert_eq!(record.identity_key, "a1b2c3");
    }

    #[test]
    fn rejects_blank_identity_key() {
        let err = SourceRecord::new("readsb", 1, "   ", UtcDateTime::now()).expect_err("blank");
        assert_eq!(err, ValidationError::EmptyIdentityKey);
    }

    #[test]
    fn null_fields_are_treated_as_absent() {
        let record = SourceRecord::new("opensky", 2, "abc", UtcDateTime::now())
            .expect("valid key")
            .with_optional_field::<String>("callsign", None)
            .with_field("altitude_ft", 3500);

        assert!(record.field("callsign").is_none());
        assert_eq!(record.field("altitude_ft"), Some(&Value::from(3500)));
        assert!(record.position().is_none());
    }
}
