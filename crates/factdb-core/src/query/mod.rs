//! # Query Engine
//!
//! Source text → [`ast`] → typed [`ir`] → [`bytecode`], then evaluation
//! against a fact store.
//!
//! Compilation is pure: identical text and schema snapshot always produce an
//! identical [`CompiledQuery`]. The snapshot is pinned in the compiled query,
//! so a schema reload never changes the meaning of a query already compiled.

pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod eval;
pub mod ir;
pub mod parser;
pub mod render;
pub mod typecheck;

pub use ast::Query;
pub use bytecode::Program;
pub use eval::{Binding, QueryResults, execute};
pub use ir::{Ir, ResultType};
pub use parser::parse_query;

use crate::FactDbError;
use crate::PredicateRef;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

// =============================================================================
// OPTIONS
// =============================================================================

/// Which schema a query is compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    /// The live registry. Facts stored under older versions are converted.
    #[default]
    Current,
    /// The schema the database was built with.
    Stored,
}

impl FromStr for SchemaMode {
    type Err = FactDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(Self::Current),
            "stored" => Ok(Self::Stored),
            other => Err(FactDbError::type_error(format!(
                "unknown schema mode {other:?} (expected current or stored)"
            ))),
        }
    }
}

impl fmt::Display for SchemaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => write!(f, "current"),
            Self::Stored => write!(f, "stored"),
        }
    }
}

/// How fact references inside results are rendered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExpandPolicy {
    /// Every reference stays `{"id": N}`.
    Off,
    /// Referenced facts are inlined recursively.
    #[default]
    On,
    /// Only facts of the named predicates are inlined.
    Only(BTreeSet<String>),
    /// Every fact except those of the named predicates is inlined.
    Except(BTreeSet<String>),
}

impl ExpandPolicy {
    /// Whether a reference to a fact of `predicate` is inlined. Names match
    /// with or without a version.
    #[must_use]
    pub fn expands(&self, predicate: &PredicateRef) -> bool {
        let named = |names: &BTreeSet<String>| {
            names.contains(&predicate.name) || names.contains(&predicate.to_string())
        };
        match self {
            Self::Off => false,
            Self::On => true,
            Self::Only(names) => named(names),
            Self::Except(names) => !named(names),
        }
    }
}

fn names(list: &str) -> BTreeSet<String> {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl FromStr for ExpandPolicy {
    type Err = FactDbError;

    /// `on`, `off`, `except:P,Q`, or a list of predicate names to expand.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "" => Err(FactDbError::type_error("empty expansion policy")),
            _ => match s.strip_prefix("except:") {
                Some(rest) => Ok(Self::Except(names(rest))),
                None => Ok(Self::Only(names(s))),
            },
        }
    }
}

impl fmt::Display for ExpandPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |names: &BTreeSet<String>| names.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
            Self::Only(names) => write!(f, "{}", join(names)),
            Self::Except(names) => write!(f, "except:{}", join(names)),
        }
    }
}

/// Per-query settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub mode: SchemaMode,
    pub expand: ExpandPolicy,
    /// Maximum number of results; `None` is unlimited.
    pub limit: Option<usize>,
    /// Record per-predicate counts of facts examined.
    pub profile: bool,
}

// =============================================================================
// COMPILED QUERY
// =============================================================================

/// A query compiled against a pinned schema snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    schema: Arc<Schema>,
    mode: SchemaMode,
    ir: Ir,
    program: Program,
}

impl CompiledQuery {
    /// The typed IR; its `Display` is the `ir:` listing.
    #[must_use]
    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    /// The bytecode; its `Display` is the `bytecode:` listing.
    #[must_use]
    pub fn bytecode(&self) -> &Program {
        &self.program
    }

    /// The snapshot the query was compiled against.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[must_use]
    pub fn mode(&self) -> SchemaMode {
        self.mode
    }
}

/// Parse, typecheck and lower `text` against `schema`.
pub fn compile(text: &str, schema: Arc<Schema>, mode: SchemaMode) -> Result<CompiledQuery, FactDbError> {
    let started = Instant::now();
    let query = parse_query(text)?;
    let ir = typecheck::typecheck(&query, &schema)?;
    let program = codegen::codegen(&ir);
    tracing::debug!(
        %mode,
        stages = program.blocks.len(),
        derived = program.derived.len(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "query compiled"
    );
    Ok(CompiledQuery {
        schema,
        mode,
        ir,
        program,
    })
}
