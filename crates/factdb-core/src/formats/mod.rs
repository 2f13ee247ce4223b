//! # Formats Module
//!
//! Binary encoding of stored schema snapshots and the JSON encoding of values
//! shared by fact files, dumps and query results.

pub mod json;
pub mod persistence;

pub use persistence::{PersistenceHeader, schema_from_bytes, schema_to_bytes};
