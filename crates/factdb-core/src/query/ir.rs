//! # Typed IR
//!
//! The output of typechecking: every name resolved to a versioned predicate,
//! every variable numbered and typed, every pattern annotated with the shape
//! it matches. Codegen lowers this to bytecode.

use crate::schema::Type;
use crate::{PredicateRef, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Index of a variable; variables occupy the first registers of a program.
pub type VarId = usize;

/// A typed variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Var {
    pub name: String,
    pub ty: Type,
}

/// Builtin primitive functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prim {
    ToLower,
    ToUpper,
    Length,
}

impl Prim {
    /// Look up `prim.NAME`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "toLower" => Some(Self::ToLower),
            "toUpper" => Some(Self::ToUpper),
            "length" => Some(Self::Length),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ToLower => "toLower",
            Self::ToUpper => "toUpper",
            Self::Length => "length",
        }
    }
}

/// A typed pattern, matched against a value of a known type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TPat {
    Wild,
    /// First occurrence of a variable.
    Bind(VarId),
    /// Later occurrence: must equal the bound value.
    Same(VarId),
    Lit(Value),
    Prefix(String),
    /// Exact-length array.
    Array(Vec<TPat>),
    /// A record of the given arity; fields by index, unmentioned fields
    /// match anything.
    Record(usize, Vec<(usize, TPat)>),
    /// A specific sum alternative.
    Alt(u32, Box<TPat>),
    /// Follow a fact reference and match the referenced fact's key.
    Deref { predicate: PredicateRef, key: Box<TPat> },
}

impl TPat {
    /// Convert to an expression when the pattern denotes exactly one value
    /// given the variables bound so far. Record patterns must name every field.
    #[must_use]
    pub fn as_expr(&self) -> Option<TExpr> {
        match self {
            Self::Same(v) => Some(TExpr::Var(*v)),
            Self::Lit(value) => Some(TExpr::Lit(value.clone())),
            Self::Array(items) => items
                .iter()
                .map(Self::as_expr)
                .collect::<Option<Vec<_>>>()
                .map(TExpr::Array),
            Self::Record(arity, fields) => {
                let mut slots: Vec<Option<TExpr>> = vec![None; *arity];
                for (index, pat) in fields {
                    *slots.get_mut(*index)? = Some(pat.as_expr()?);
                }
                slots.into_iter().collect::<Option<Vec<_>>>().map(TExpr::Record)
            }
            Self::Alt(index, inner) => inner.as_expr().map(|e| TExpr::Alt(*index, Box::new(e))),
            Self::Wild | Self::Bind(_) | Self::Prefix(_) | Self::Deref { .. } => None,
        }
    }
}

/// A typed expression; every variable in it is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TExpr {
    Lit(Value),
    Var(VarId),
    Array(Vec<TExpr>),
    Record(Vec<TExpr>),
    Alt(u32, Box<TExpr>),
}

impl TExpr {
    /// The constant value, when the expression mentions no variables.
    #[must_use]
    pub fn constant(&self) -> Option<Value> {
        match self {
            Self::Lit(v) => Some(v.clone()),
            Self::Var(_) => None,
            Self::Array(items) => items
                .iter()
                .map(Self::constant)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Self::Record(items) => items
                .iter()
                .map(Self::constant)
                .collect::<Option<Vec<_>>>()
                .map(Value::Record),
            Self::Alt(index, inner) => inner.constant().map(|v| Value::Alt(*index, Box::new(v))),
        }
    }
}

/// Where a stage draws its candidates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrSource {
    /// Facts of a predicate whose key matches `key` and value `value`.
    Facts {
        predicate: PredicateRef,
        derived: bool,
        key: TPat,
        value: TPat,
    },
    /// A single fact by id, plus facts of the same predicate and key.
    FactId(u64),
    Prim { prim: Prim, arg: TExpr },
    Expr(TExpr),
}

/// One pipeline stage: candidates from `source`, filtered through `bind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrStage {
    pub source: IrSource,
    pub bind: TPat,
}

/// What the final stage produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultType {
    /// Facts of one predicate.
    Fact(PredicateRef),
    /// A fact of whatever predicate its id names.
    AnyFact,
    /// Plain values.
    Value(Type),
}

impl ResultType {
    /// The result type of a source producing values of `ty`.
    #[must_use]
    pub fn of(ty: Type) -> Self {
        match ty {
            Type::Predicate(p) => Self::Fact(p),
            other => Self::Value(other),
        }
    }
}

/// First path segment of positions inside a fact's value. Not a valid field
/// name, so it never collides with a key path.
pub const VALUE_ROOT: &str = "->";

/// A typechecked query or derived-predicate body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ir {
    pub vars: Vec<Var>,
    pub stages: Vec<IrStage>,
    pub result: ResultType,
    /// Field paths marked `..`; facts found there are never expanded. Paths
    /// into a fact's value start with [`VALUE_ROOT`].
    pub no_expand: BTreeSet<Vec<String>>,
    /// Bodies of the derived predicates reachable from this query.
    pub derived: BTreeMap<PredicateRef, Ir>,
}

// =============================================================================
// DISPLAY
// =============================================================================

struct Named<'a, T> {
    vars: &'a [Var],
    item: &'a T,
}

fn var_name(vars: &[Var], v: VarId) -> String {
    vars.get(v).map_or_else(|| format!("?{v}"), |var| var.name.clone())
}

fn list<T>(f: &mut fmt::Formatter<'_>, vars: &[Var], items: &[T]) -> fmt::Result
where
    for<'x> Named<'x, T>: fmt::Display,
{
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", Named { vars, item })?;
    }
    Ok(())
}

impl fmt::Display for Named<'_, TPat> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars = self.vars;
        match self.item {
            TPat::Wild => write!(f, "_"),
            TPat::Bind(v) => write!(f, "{}", var_name(vars, *v)),
            TPat::Same(v) => write!(f, "={}", var_name(vars, *v)),
            TPat::Lit(value) => write!(f, "{value}"),
            TPat::Prefix(s) => write!(f, "{s:?}.."),
            TPat::Array(items) => {
                write!(f, "[")?;
                list(f, vars, items)?;
                write!(f, "]")
            }
            TPat::Record(_, fields) => {
                write!(f, "{{")?;
                for (i, (index, pat)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "#{index} = {}", Named { vars, item: pat })?;
                }
                write!(f, "}}")
            }
            TPat::Alt(index, inner) => write!(f, "#{index}:{}", Named { vars, item: inner.as_ref() }),
            TPat::Deref { predicate, key } => write!(f, "{predicate} {}", Named { vars, item: key.as_ref() }),
        }
    }
}

impl fmt::Display for Named<'_, TExpr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars = self.vars;
        match self.item {
            TExpr::Lit(value) => write!(f, "{value}"),
            TExpr::Var(v) => write!(f, "{}", var_name(vars, *v)),
            TExpr::Array(items) => {
                write!(f, "[")?;
                list(f, vars, items)?;
                write!(f, "]")
            }
            TExpr::Record(items) => {
                write!(f, "{{")?;
                list(f, vars, items)?;
                write!(f, "}}")
            }
            TExpr::Alt(index, inner) => write!(f, "#{index}:{}", Named { vars, item: inner.as_ref() }),
        }
    }
}

impl fmt::Display for Named<'_, IrStage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars = self.vars;
        let stage = self.item;
        if stage.bind != TPat::Wild {
            write!(f, "{} = ", Named { vars, item: &stage.bind })?;
        }
        match &stage.source {
            IrSource::Facts {
                predicate,
                derived,
                key,
                value,
            } => {
                let tag = if *derived { " (derived)" } else { "" };
                write!(f, "{predicate}{tag} {}", Named { vars, item: key })?;
                if *value != TPat::Wild {
                    write!(f, " -> {}", Named { vars, item: value })?;
                }
                Ok(())
            }
            IrSource::FactId(id) => write!(f, "${id}"),
            IrSource::Prim { prim, arg } => write!(f, "prim.{} {}", prim.name(), Named { vars, item: arg }),
            IrSource::Expr(e) => write!(f, "{}", Named { vars, item: e }),
        }
    }
}

impl Ir {
    fn write_body(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        for var in &self.vars {
            writeln!(f, "{indent}var {} : {}", var.name, var.ty)?;
        }
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "{indent}stage {i}: {}", Named { vars: &self.vars, item: stage })?;
        }
        match &self.result {
            ResultType::Fact(p) => writeln!(f, "{indent}result: {p}"),
            ResultType::AnyFact => writeln!(f, "{indent}result: fact"),
            ResultType::Value(ty) => writeln!(f, "{indent}result: {ty}"),
        }
    }
}

impl fmt::Display for Ir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ir:")?;
        self.write_body(f, "  ")?;
        for (predicate, body) in &self.derived {
            writeln!(f, "  derived {predicate}:")?;
            body.write_body(f, "    ")?;
        }
        Ok(())
    }
}
