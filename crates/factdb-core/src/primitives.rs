//! # Engine Primitives
//!
//! Hardcoded runtime constants for the factdb engine.
//!
//! These are compiled into the binary and are immutable at runtime.

/// The first fact id assigned in every database.
///
/// Ids below this are reserved; a fresh database's first fact is always `1024`.
pub const FIRST_FACT_ID: u64 = 1024;

/// Magic bytes for the persisted schema snapshot header.
pub const MAGIC_BYTES: &[u8; 4] = b"FDB1";

/// Current serialization format version of persisted snapshots.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum nesting depth when inlining referenced facts.
///
/// Expansion also tracks visited `(origin, target)` pairs, so this only
/// bounds pathological acyclic chains.
pub const MAX_EXPANSION_DEPTH: usize = 64;

/// Maximum nesting of derived predicates that refer to other derived predicates.
pub const MAX_DERIVATION_DEPTH: usize = 32;

/// Name of the builtin schema that is always registered.
pub const BUILTIN_SCHEMA_NAME: &str = "sys";

/// Source of the builtin schema.
pub const BUILTIN_SCHEMA: &str = "schema sys.1 {\n  predicate Blob : string\n}\n";

/// Name of umbrella schemas that decide the "latest" version of a predicate.
pub const UMBRELLA_SCHEMA_NAME: &str = "all";

/// File extension of schema source files read by `reload`.
pub const SCHEMA_FILE_EXTENSION: &str = "angle";

/// File holding one database under `<root>/<name>/<hash>/`.
pub const DATABASE_FILE_NAME: &str = "facts.redb";

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum size of a single fact file accepted by ingestion (100 MB).
pub const MAX_FACT_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum length of a string value in a fact.
pub const MAX_STRING_LENGTH: usize = 16 * 1024 * 1024;

/// Maximum length of query source text.
pub const MAX_QUERY_LENGTH: usize = 64 * 1024;

/// Maximum nesting of brackets in query patterns and schema types.
pub const MAX_NESTING_DEPTH: usize = 128;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fact_id_is_1024() {
        assert_eq!(FIRST_FACT_ID, 1024);
    }

    #[test]
    fn builtin_schema_declares_blob() {
        assert!(BUILTIN_SCHEMA.contains("predicate Blob"));
        assert!(BUILTIN_SCHEMA.starts_with("schema sys.1"));
    }
}
