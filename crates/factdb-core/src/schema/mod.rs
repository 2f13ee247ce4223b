//! # Schema Model
//!
//! Resolved predicate definitions and immutable schema snapshots.
//!
//! A [`Schema`] is the unit the rest of the engine works against: the query
//! compiler typechecks against one, a database pins one as its stored schema,
//! and the live [`SchemaRegistry`] publishes a new one on every reload.
//!
//! ## Naming
//!
//! A predicate `P` declared in schema `ns.V` is `ns.P` at version `V`. The
//! "latest" version of a name is the one exported by the highest umbrella
//! schema `all.N` when one exists, else the highest registered version.

pub mod convert;
pub mod parser;
pub mod registry;

pub use convert::Conversion;
pub use parser::{SchemaDecl, parse_schema};
pub use registry::{DirSchemaSource, SchemaRegistry, SchemaSource};

use crate::primitives::UMBRELLA_SCHEMA_NAME;
use crate::query::ast::{Pattern, Query};
use crate::{FactDbError, PredicateRef, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// TYPES
// =============================================================================

/// A resolved schema type. Aliases, `maybe` and `enum` are already expanded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Byte,
    Nat,
    Bool,
    String,
    Array(Box<Type>),
    Record(Vec<Field>),
    Sum(Vec<Field>),
    Predicate(PredicateRef),
}

/// A named record field or sum alternative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    /// Explicit `= literal` default, if declared.
    pub default: Option<Value>,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    /// The value used when this field is missing: the declared default, else
    /// the zero value of its type.
    pub fn default_value(&self) -> Option<Value> {
        self.default.clone().or_else(|| self.ty.zero())
    }
}

impl Type {
    /// The unit type `{}`.
    #[must_use]
    pub const fn unit() -> Self {
        Self::Record(Vec::new())
    }

    /// Whether this is the unit type.
    #[must_use]
    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Record(fields) if fields.is_empty())
    }

    /// The zero value of a type. Predicate references have none.
    pub fn zero(&self) -> Option<Value> {
        match self {
            Self::Byte => Some(Value::Byte(0)),
            Self::Nat => Some(Value::Nat(0)),
            Self::Bool => Some(Value::Bool(false)),
            Self::String => Some(Value::String(String::new())),
            Self::Array(_) => Some(Value::Array(Vec::new())),
            Self::Record(fields) => fields
                .iter()
                .map(Field::default_value)
                .collect::<Option<Vec<_>>>()
                .map(Value::Record),
            Self::Sum(alts) => alts
                .first()
                .and_then(|alt| alt.ty.zero().map(|v| Value::Alt(0, Box::new(v)))),
            Self::Predicate(_) => None,
        }
    }

    /// Visit every predicate referenced by this type.
    pub fn for_each_predicate(&self, f: &mut impl FnMut(&PredicateRef)) {
        match self {
            Self::Predicate(p) => f(p),
            Self::Array(elem) => elem.for_each_predicate(f),
            Self::Record(fields) | Self::Sum(fields) => {
                for field in fields {
                    field.ty.for_each_predicate(f);
                }
            }
            Self::Byte | Self::Nat | Self::Bool | Self::String => {}
        }
    }

    /// Check that `value` conforms to this type. Fact references are only
    /// checked structurally; their predicate is checked by the caller.
    pub fn check(&self, value: &Value) -> Result<(), FactDbError> {
        let mismatch = || FactDbError::type_error(format!("expected {self}, found {}", value.kind()));
        match (self, value) {
            (Self::Byte, Value::Byte(_))
            | (Self::Nat, Value::Nat(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::String, Value::String(_))
            | (Self::Predicate(_), Value::Fact(_)) => Ok(()),
            (Self::Array(elem), Value::Array(items)) => items.iter().try_for_each(|v| elem.check(v)),
            (Self::Record(fields), Value::Record(values)) if fields.len() == values.len() => fields
                .iter()
                .zip(values)
                .try_for_each(|(field, v)| field.ty.check(v)),
            (Self::Sum(alts), Value::Alt(index, inner)) => alts
                .get(*index as usize)
                .ok_or_else(mismatch)
                .and_then(|alt| alt.ty.check(inner)),
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte => write!(f, "byte"),
            Self::Nat => write!(f, "nat"),
            Self::Bool => write!(f, "bool"),
            Self::String => write!(f, "string"),
            Self::Array(elem) => write!(f, "[{elem}]"),
            Self::Record(fields) if fields.is_empty() => write!(f, "{{}}"),
            Self::Record(fields) | Self::Sum(fields) => {
                let sep = if matches!(self, Self::Sum(_)) { " | " } else { ", " };
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{sep}")?;
                    }
                    write!(f, "{} : {}", field.name, field.ty)?;
                    if let Some(default) = &field.default {
                        write!(f, " = {default}")?;
                    }
                }
                write!(f, " }}")
            }
            Self::Predicate(p) => write!(f, "{p}"),
        }
    }
}

// =============================================================================
// PREDICATES
// =============================================================================

/// How a predicate's facts come into being.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefKind {
    /// Facts are ingested and stored.
    Stored,
    /// Facts are computed at query time from `body`, yielding `key`.
    Derived(Derivation),
}

/// The body of a derived predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    /// Expression producing the derived fact's key.
    pub key: Pattern,
    pub body: Query,
    /// Short names visible to the body, resolved in the declaring schema.
    pub scope: BTreeMap<String, PredicateRef>,
}

/// A resolved predicate definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateDef {
    pub predicate: PredicateRef,
    pub key_type: Type,
    /// Unit when the predicate has no value.
    pub value_type: Type,
    pub kind: DefKind,
}

impl PredicateDef {
    #[must_use]
    pub fn is_derived(&self) -> bool {
        matches!(self.kind, DefKind::Derived(_))
    }
}

impl fmt::Display for PredicateDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "predicate {} : {}", self.predicate, self.key_type)?;
        if !self.value_type.is_unit() {
            write!(f, " -> {}", self.value_type)?;
        }
        if let DefKind::Derived(d) = &self.kind {
            write!(f, "\n  {} where {}", d.key, d.body)?;
        }
        Ok(())
    }
}

// =============================================================================
// SCHEMA SNAPSHOT
// =============================================================================

/// Identifier of a declared schema, e.g. `example.2`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaRef {
    pub name: String,
    pub version: u32,
}

impl fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

/// What a registered schema declares and makes visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// The declaration as registered; identical re-registration is a no-op.
    pub decl: SchemaDecl,
    /// Predicates of this schema: its own plus inherited, by short name.
    pub exports: BTreeMap<String, PredicateRef>,
    /// Type aliases of this schema: its own plus inherited.
    pub types: BTreeMap<String, Type>,
}

/// An immutable set of resolved predicate definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub(crate) predicates: BTreeMap<PredicateRef, PredicateDef>,
    pub(crate) schemas: BTreeMap<SchemaRef, SchemaInfo>,
}

impl Schema {
    /// Look up an exact `(name, version)`.
    pub fn get(&self, predicate: &PredicateRef) -> Option<&PredicateDef> {
        self.predicates.get(predicate)
    }

    /// Resolve a qualified name, at `version` or the latest version.
    pub fn resolve(&self, name: &str, version: Option<u32>) -> Result<&PredicateDef, FactDbError> {
        match version {
            Some(version) => {
                let key = PredicateRef::new(name, version);
                self.predicates.get(&key).ok_or_else(|| {
                    if self.has_name(name) {
                        FactDbError::UnknownVersion {
                            name: name.to_string(),
                            version,
                        }
                    } else {
                        FactDbError::UnknownPredicate(name.to_string())
                    }
                })
            }
            None => self
                .latest(name)
                .and_then(|p| self.predicates.get(&p))
                .ok_or_else(|| FactDbError::UnknownPredicate(name.to_string())),
        }
    }

    /// Resolve a short name (`Expr`) when exactly one qualified name ends with it.
    pub fn resolve_short(&self, short: &str) -> Result<&PredicateDef, FactDbError> {
        let suffix = format!(".{short}");
        let mut names: Vec<&str> = self
            .predicates
            .keys()
            .map(|p| p.name.as_str())
            .filter(|n| n.ends_with(&suffix))
            .collect();
        names.dedup();
        match names.as_slice() {
            [name] => self.resolve(name, None),
            [] => Err(FactDbError::UnknownPredicate(short.to_string())),
            _ => Err(FactDbError::UnknownPredicate(format!(
                "{short} is ambiguous: {}",
                names.join(", ")
            ))),
        }
    }

    fn has_name(&self, name: &str) -> bool {
        self.predicates.keys().any(|p| p.name == name)
    }

    /// The latest version of `name`.
    pub fn latest(&self, name: &str) -> Option<PredicateRef> {
        let umbrella = self
            .schemas
            .iter()
            .rev()
            .find(|(id, _)| id.name == UMBRELLA_SCHEMA_NAME)
            .map(|(_, info)| info);
        if let Some(info) = umbrella {
            if let Some(p) = info.exports.values().find(|p| p.name == name) {
                return Some(p.clone());
            }
        }
        self.predicates
            .keys()
            .filter(|p| p.name == name)
            .max_by_key(|p| p.version)
            .cloned()
    }

    /// Every version of every predicate, in order.
    pub fn predicates(&self) -> impl Iterator<Item = &PredicateDef> {
        self.predicates.values()
    }

    /// The latest version of every predicate name.
    pub fn latest_predicates(&self) -> Vec<PredicateRef> {
        let mut names: Vec<&str> = self.predicates.keys().map(|p| p.name.as_str()).collect();
        names.dedup();
        names.into_iter().filter_map(|n| self.latest(n)).collect()
    }

    /// Predicates whose `name` or `name.version` starts with `prefix`.
    pub fn predicates_with_prefix(&self, prefix: &str) -> Vec<PredicateRef> {
        self.predicates
            .keys()
            .filter(|p| p.name.starts_with(prefix) || p.to_string().starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Registered schema declarations, in order.
    pub fn schemas(&self) -> impl Iterator<Item = (&SchemaRef, &SchemaInfo)> {
        self.schemas.iter()
    }
}

// =============================================================================
// TESTS
// =============================================================================
