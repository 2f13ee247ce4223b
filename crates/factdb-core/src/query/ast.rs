//! # Query Syntax Tree
//!
//! Untyped syntax produced by the parser. Names are unresolved: a bare
//! capitalized name with no pattern may turn out to be a predicate or a
//! variable, decided by the typechecker against the schema in scope.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A query: one or more pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub statements: Vec<Statement>,
}

/// One stage: `[pattern =] source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub bind: Option<Pattern>,
    pub source: Source,
}

/// Where a stage draws its results from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// `Pred[.N] [pattern [-> pattern]]`
    Predicate {
        name: String,
        version: Option<u32>,
        pattern: Option<Pattern>,
        value: Option<Pattern>,
    },
    /// `prim.NAME expr`
    Prim { name: String, arg: Pattern },
    /// `$N`, a bare `N` or `{N}`
    FactId(u64),
    /// Any other expression.
    Expr(Pattern),
}

/// A pattern (or, in expression position, an expression).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    Wild,
    Var(String),
    Nat(u64),
    String(String),
    /// `"s"..`
    Prefix(String),
    Bool(bool),
    Array(Vec<Pattern>),
    /// `{ f = p, ... }`
    Fields(Vec<(String, Pattern)>),
    /// `{ p, ... }`
    Tuple(Vec<Pattern>),
    /// `p..`: the matched field is never expanded when rendered.
    NoExpand(Box<Pattern>),
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wild => write!(f, "_"),
            Self::Var(v) => write!(f, "{v}"),
            Self::Nat(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Prefix(s) => write!(f, "{s:?}.."),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Array(items) => {
                write!(f, "[")?;
                write_list(f, items)?;
                write!(f, "]")
            }
            Self::Fields(fields) => {
                write!(f, "{{ ")?;
                for (i, (name, pat)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name} = {pat}")?;
                }
                write!(f, " }}")
            }
            Self::Tuple(items) => {
                write!(f, "{{ ")?;
                write_list(f, items)?;
                write!(f, " }}")
            }
            Self::NoExpand(inner) => write!(f, "{inner}.."),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate {
                name,
                version,
                pattern,
                value,
            } => {
                write!(f, "{name}")?;
                if let Some(v) = version {
                    write!(f, ".{v}")?;
                }
                match (pattern, value) {
                    (Some(p), Some(v)) => write!(f, " {p} -> {v}"),
                    (Some(p), None) => write!(f, " {p}"),
                    (None, Some(v)) => write!(f, " _ -> {v}"),
                    (None, None) => Ok(()),
                }
            }
            Self::Prim { name, arg } => write!(f, "prim.{name} {arg}"),
            Self::FactId(id) => write!(f, "${id}"),
            Self::Expr(p) => write!(f, "{p}"),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(bind) = &self.bind {
            write!(f, "{bind} = ")?;
        }
        write!(f, "{}", self.source)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stmt) in self.statements.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{stmt}")?;
        }
        Ok(())
    }
}
