//! # Core Type Definitions
//!
//! This module contains the types shared by every layer of the engine:
//! - Fact and predicate identifiers (`FactId`, `PredicateRef`)
//! - The structured runtime value (`Value`)
//! - Stored facts (`Fact`)
//! - Error types (`FactDbError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`
//! - Have a canonical postcard encoding, which is what content hashes are taken over

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of a fact within one database.
///
/// Ids are dense and assigned in insertion order, starting at
/// [`crate::primitives::FIRST_FACT_ID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactId(pub u64);

impl FactId {
    /// The id following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fully versioned predicate name, e.g. `example.Class.1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PredicateRef {
    /// Qualified name without version (`example.Class`).
    pub name: String,
    /// Version of the predicate; the version of the schema that declared it.
    pub version: u32,
}

impl PredicateRef {
    /// Create a new predicate reference.
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Parse `name.version`. Returns `None` if the last segment is not numeric.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let (name, version) = text.rsplit_once('.')?;
        let version = version.parse().ok()?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, version))
    }
}

impl fmt::Display for PredicateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

// =============================================================================
// VALUES
// =============================================================================

/// A structured runtime value conforming to some schema type.
///
/// Records are positional: field names live in the type, not in the value.
/// Sums carry the index of the selected alternative.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Byte(u8),
    Nat(u64),
    Bool(bool),
    String(String),
    Array(Vec<Value>),
    Record(Vec<Value>),
    Alt(u32, Box<Value>),
    Fact(FactId),
}

impl Value {
    /// The unit value `{}`.
    #[must_use]
    pub const fn unit() -> Self {
        Self::Record(Vec::new())
    }

    /// Whether this is the unit value.
    #[must_use]
    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Record(fields) if fields.is_empty())
    }

    /// Build a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Short name of the value's shape, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Byte(_) => "byte",
            Self::Nat(_) => "nat",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Record(_) => "record",
            Self::Alt(..) => "alternative",
            Self::Fact(_) => "fact",
        }
    }

    /// Visit every fact reference contained in this value.
    pub fn for_each_fact(&self, f: &mut impl FnMut(FactId)) {
        match self {
            Self::Fact(id) => f(*id),
            Self::Array(items) | Self::Record(items) => {
                for item in items {
                    item.for_each_fact(f);
                }
            }
            Self::Alt(_, inner) => inner.for_each_fact(f),
            Self::Byte(_) | Self::Nat(_) | Self::Bool(_) | Self::String(_) => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(b) => write!(f, "{b}"),
            Self::Nat(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Record(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, "}}")
            }
            Self::Alt(index, inner) => write!(f, "#{index}({inner})"),
            Self::Fact(id) => write!(f, "${id}"),
        }
    }
}

// =============================================================================
// FACT
// =============================================================================

/// An immutable stored fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    /// The id assigned at insertion.
    pub id: FactId,
    /// The predicate this fact was stored under.
    pub predicate: PredicateRef,
    /// The key, conforming to the predicate's key type.
    pub key: Value,
    /// The value; unit for key-only predicates.
    pub value: Value,
}

impl Fact {
    /// The value, or `None` for key-only predicates.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        if self.value.is_unit() {
            None
        } else {
            Some(&self.value)
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur anywhere in the engine.
///
/// - No silent failures
/// - Use `Result<T, FactDbError>` for fallible operations
/// - No error corrupts persisted state
#[derive(Debug, Error)]
pub enum FactDbError {
    /// The predicate name is not known to the schema in use.
    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),

    /// The predicate exists, but not at this version.
    #[error("unknown version of predicate {name}: {version}")]
    UnknownVersion { name: String, version: u32 },

    /// A query, schema or fact does not conform to its type.
    #[error("type error: {0}")]
    TypeError(String),

    /// A variable was used before any binding occurrence.
    #[error("unbound variable: {0}")]
    UnboundVariable(String),

    /// A `(name, version)` pair was redefined with different content.
    #[error("duplicate definition: {0}")]
    DuplicateDefinition(String),

    /// A schema inherits from or imports an undeclared schema.
    #[error("unknown schema dependency: {0}")]
    UnknownDependency(String),

    /// Query or schema source text could not be parsed.
    #[error("parse error at {line}:{col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
    },

    /// A fact id (or other named item) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The database identity already exists.
    #[error("database already exists: {0}")]
    AlreadyExists(String),

    /// The store is complete and accepts no more facts.
    #[error("fact store is sealed")]
    StoreSealed,

    /// A fact file could not be read or parsed.
    #[error("{file}: {reason}")]
    IngestionParseFailure { file: String, reason: String },

    /// No database with this identity exists.
    #[error("UnknownDatabase: {0}")]
    UnknownDatabase(String),

    /// The operation requires a complete database.
    #[error("database is incomplete: {0}")]
    Incomplete(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An I/O or storage error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

impl FactDbError {
    /// Shorthand for a [`FactDbError::TypeError`].
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::TypeError(message.into())
    }
}

// =============================================================================
// TESTS
// =============================================================================
