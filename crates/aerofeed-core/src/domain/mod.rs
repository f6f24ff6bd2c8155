//! # Domain Models
//!
//! Feed-neutral types shared by sources, the aggregator and consumers.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SourceRecord`] | One source's report about one entity |
//! | [`CanonicalRecord`] | Priority-merged view of all reports for an entity |
//! | [`QueryTarget`] | Identity lookup or area filter |
//! | [`GeoPoint`] / [`AreaFilter`] | Spatial filtering helpers |
//! | [`UtcDateTime`] | UTC timestamp |

mod record;
mod target;
mod timestamp;

pub use record::{normalize_identity_key, CanonicalRecord, FieldMap, SourceRecord};
pub use target::{AreaFilter, GeoPoint, QueryTarget};
pub use timestamp::UtcDateTime;
