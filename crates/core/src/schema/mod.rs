//! JSON-schema handling split into two independent concerns: tolerant
//! parsing of a model's raw text output, and schema sanitization/structural
//! comparison (spec §4.1, §4.3, §4.6).

pub mod sanitize;
pub mod tolerant_json;

pub use sanitize::{sanitize_for_strict_mode, sanitize_nulls, schemas_structurally_compatible, validate};
pub use tolerant_json::parse_tolerant;
