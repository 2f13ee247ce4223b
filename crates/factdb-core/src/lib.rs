//! # factdb-core
//!
//! The engine of factdb: an append-only, content-addressed store of typed
//! facts, a registry of versioned schemas, and a compiled pattern-matching
//! query language.
//!
//! ## Layers
//!
//! - `store`: fact storage, in memory or on disk (redb)
//! - `schema`: schema parsing, registration, live reload, and conversion of
//!   facts between predicate versions
//! - `query`: parse → typecheck → bytecode → evaluation → JSON results
//! - `db`: database identities and the build lifecycle
//!
//! ## Guarantees
//!
//! - Identical `(predicate, key, value)` always yields the same fact id
//! - Facts never change once an id is assigned
//! - Compiled queries pin their schema snapshot; a reload never changes the
//!   results of a query already compiled
//! - No async and no network dependencies

// =============================================================================
// MODULES
// =============================================================================

pub mod db;
pub mod export;
pub mod formats;
pub mod ingestor;
pub mod ownership;
pub mod primitives;
pub mod query;
pub mod schema;
pub mod store;
pub mod syntax;
pub mod system;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{Fact, FactDbError, FactId, PredicateRef, Value};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use db::{Database, DatabaseInfo, DatabaseManager, Repo};
pub use export::{dump, dump_json};
pub use ingestor::{FactEntry, FactFile, FactGroup, Ingestor, parse_fact_file, read_fact_file};
pub use ownership::Ownership;
pub use query::{
    Binding, CompiledQuery, ExpandPolicy, QueryOptions, QueryResults, SchemaMode, compile, execute,
};
pub use schema::{DirSchemaSource, Schema, SchemaRegistry, SchemaSource};
pub use store::{FactBatch, FactStore, MemoryStore, RedbStore, StoreState};

// =============================================================================
// RE-EXPORTS: System (from system module)
// =============================================================================

pub use system::{PredicateStats, Profile, Statistics};
