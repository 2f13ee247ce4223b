//! # Typechecker
//!
//! Resolves a parsed [`Query`] against one schema snapshot and produces the
//! typed [`Ir`].
//!
//! Rules:
//! - A variable is bound by its first occurrence in a pattern; a later
//!   occurrence must have a compatible type and matches by equality.
//! - Expressions (prim arguments, bare sources, derived keys) may only use
//!   bound variables.
//! - A non-variable pattern at a predicate-typed position matches the
//!   referenced fact's key.
//! - Derived predicates reachable from the query are checked once each, in
//!   their declaring schema's scope. A derivation that reaches itself is
//!   rejected.

use super::ast::{Pattern, Query, Source};
use super::ir::{Ir, IrSource, IrStage, Prim, ResultType, TExpr, TPat, VALUE_ROOT, Var, VarId};
use super::parser::is_variable;
use crate::primitives::MAX_DERIVATION_DEPTH;
use crate::schema::{DefKind, Field, PredicateDef, Schema, Type};
use crate::{FactDbError, PredicateRef, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Typecheck `query` against `schema`.
pub fn typecheck(query: &Query, schema: &Schema) -> Result<Ir, FactDbError> {
    let mut checker = Checker {
        schema,
        derived: BTreeMap::new(),
        stack: Vec::new(),
    };
    let mut ir = checker.body(query, None, None)?;
    ir.derived = checker.derived;
    Ok(ir)
}

/// Whether values of two types can be compared. Predicate references are
/// compatible across versions of the same name.
pub(crate) fn compatible(a: &Type, b: &Type) -> bool {
    match (a, b) {
        (Type::Predicate(p), Type::Predicate(q)) => p.name == q.name,
        (Type::Array(x), Type::Array(y)) => compatible(x, y),
        (Type::Record(f), Type::Record(g)) | (Type::Sum(f), Type::Sum(g)) => {
            f.len() == g.len()
                && f
                    .iter()
                    .zip(g)
                    .all(|(x, y)| x.name == y.name && compatible(&x.ty, &y.ty))
        }
        _ => a == b,
    }
}

struct Checker<'s> {
    schema: &'s Schema,
    derived: BTreeMap<PredicateRef, Ir>,
    /// Derived predicates currently being checked.
    stack: Vec<PredicateRef>,
}

/// Variables and short names visible while checking one body.
struct Scope<'s> {
    names: Option<&'s BTreeMap<String, PredicateRef>>,
    vars: Vec<Var>,
    by_name: BTreeMap<String, VarId>,
    no_expand: BTreeSet<Vec<String>>,
}

impl Scope<'_> {
    fn var(&mut self, name: &str, ty: &Type) -> Result<TPat, FactDbError> {
        match self.by_name.get(name) {
            Some(&v) => {
                let bound = &self.vars[v].ty;
                if !compatible(bound, ty) {
                    return Err(FactDbError::type_error(format!(
                        "variable {name} has type {bound} but is used as {ty}"
                    )));
                }
                Ok(TPat::Same(v))
            }
            None => {
                let v = self.vars.len();
                self.vars.push(Var {
                    name: name.to_string(),
                    ty: ty.clone(),
                });
                self.by_name.insert(name.to_string(), v);
                Ok(TPat::Bind(v))
            }
        }
    }
}

impl<'s> Checker<'s> {
    /// Check a sequence of statements. When `key` is given, a final stage
    /// producing that expression at that type is appended.
    fn body(
        &mut self,
        query: &Query,
        names: Option<&'s BTreeMap<String, PredicateRef>>,
        key: Option<(&Pattern, &Type)>,
    ) -> Result<Ir, FactDbError> {
        let mut scope = Scope {
            names,
            vars: Vec::new(),
            by_name: BTreeMap::new(),
            no_expand: BTreeSet::new(),
        };
        let mut stages = Vec::with_capacity(query.statements.len() + 1);
        let mut result = ResultType::Value(Type::unit());

        let count = query.statements.len();
        for (i, stmt) in query.statements.iter().enumerate() {
            let (source, result_type) = self.source(&mut scope, &stmt.source)?;
            if matches!(source, IrSource::FactId(_)) && (i + 1 < count || key.is_some()) {
                return Err(FactDbError::type_error("a fact id lookup must be the last statement"));
            }
            let bind = match (&stmt.bind, &result_type) {
                (None | Some(Pattern::Wild), _) => TPat::Wild,
                (Some(_), ResultType::AnyFact) => {
                    return Err(FactDbError::type_error("a fact id lookup cannot be matched"));
                }
                (Some(pat), ResultType::Fact(p)) => {
                    self.pattern(&mut scope, pat, &Type::Predicate(p.clone()), &mut Vec::new())?
                }
                (Some(pat), ResultType::Value(ty)) => self.pattern(&mut scope, pat, ty, &mut Vec::new())?,
            };
            stages.push(IrStage { source, bind });
            result = result_type;
        }

        if let Some((key, ty)) = key {
            let expr = self.expr(&mut scope, key, Some(ty))?.0;
            stages.push(IrStage {
                source: IrSource::Expr(expr),
                bind: TPat::Wild,
            });
            result = ResultType::of(ty.clone());
        }

        Ok(Ir {
            vars: scope.vars,
            stages,
            result,
            no_expand: scope.no_expand,
            derived: BTreeMap::new(),
        })
    }

    fn resolve(&self, scope: &Scope<'s>, name: &str, version: Option<u32>) -> Result<&'s PredicateDef, FactDbError> {
        let schema = self.schema;
        if version.is_none() {
            if let Some(p) = scope.names.and_then(|names| names.get(name)) {
                return schema
                    .get(p)
                    .ok_or_else(|| FactDbError::UnknownPredicate(p.to_string()));
            }
        }
        if name.contains('.') {
            return schema.resolve(name, version);
        }
        let def = schema.resolve_short(name)?;
        match version {
            Some(v) => schema.resolve(&def.predicate.name, Some(v)),
            None => Ok(def),
        }
    }

    fn source(&mut self, scope: &mut Scope<'s>, source: &Source) -> Result<(IrSource, ResultType), FactDbError> {
        match source {
            Source::FactId(id) => Ok((IrSource::FactId(*id), ResultType::AnyFact)),
            Source::Prim { name, arg } => {
                let prim = Prim::from_name(name)
                    .ok_or_else(|| FactDbError::UnknownPredicate(format!("prim.{name}")))?;
                let (arg, ty) = match prim {
                    Prim::ToLower | Prim::ToUpper => (self.expr(scope, arg, Some(&Type::String))?.0, Type::String),
                    Prim::Length => {
                        let (arg, ty) = self.expr(scope, arg, None)?;
                        if !matches!(ty, Type::Array(_)) {
                            return Err(FactDbError::type_error(format!(
                                "prim.length expects an array, found {ty}"
                            )));
                        }
                        (arg, Type::Nat)
                    }
                };
                Ok((IrSource::Prim { prim, arg }, ResultType::of(ty)))
            }
            Source::Expr(pat) => {
                let (expr, ty) = self.expr(scope, pat, None)?;
                Ok((IrSource::Expr(expr), ResultType::of(ty)))
            }
            Source::Predicate {
                name,
                version,
                pattern,
                value,
            } => {
                let bare_variable = pattern.is_none() && version.is_none() && is_variable(name);
                if bare_variable && scope.by_name.contains_key(name) {
                    return self.source(scope, &Source::Expr(Pattern::Var(name.clone())));
                }
                let def = match self.resolve(scope, name, *version) {
                    Ok(def) => def,
                    Err(FactDbError::UnknownPredicate(_)) if bare_variable => {
                        return Err(FactDbError::UnboundVariable(name.clone()));
                    }
                    Err(e) => return Err(e),
                };
                let derived = def.is_derived();
                if derived {
                    self.derive(def)?;
                }
                let key = match pattern {
                    Some(pat) => self.pattern(scope, pat, &def.key_type, &mut Vec::new())?,
                    None => TPat::Wild,
                };
                let value = match value {
                    Some(pat) => self.pattern(scope, pat, &def.value_type, &mut vec![VALUE_ROOT.to_string()])?,
                    None => TPat::Wild,
                };
                Ok((
                    IrSource::Facts {
                        predicate: def.predicate.clone(),
                        derived,
                        key,
                        value,
                    },
                    ResultType::Fact(def.predicate.clone()),
                ))
            }
        }
    }

    fn derive(&mut self, def: &'s PredicateDef) -> Result<(), FactDbError> {
        let DefKind::Derived(derivation) = &def.kind else {
            return Ok(());
        };
        let p = &def.predicate;
        if self.derived.contains_key(p) {
            return Ok(());
        }
        if self.stack.contains(p) {
            return Err(FactDbError::type_error(format!("recursive derived predicate {p}")));
        }
        if self.stack.len() >= MAX_DERIVATION_DEPTH {
            return Err(FactDbError::type_error(format!(
                "derived predicates nested deeper than {MAX_DERIVATION_DEPTH} at {p}"
            )));
        }
        self.stack.push(p.clone());
        let body = self.body(
            &derivation.body,
            Some(&derivation.scope),
            Some((&derivation.key, &def.key_type)),
        );
        self.stack.pop();
        self.derived.insert(p.clone(), body?);
        Ok(())
    }

    /// Check `pat` against a value of type `ty`. `path` holds the field names
    /// from the root of the matched key.
    fn pattern(
        &mut self,
        scope: &mut Scope<'s>,
        pat: &Pattern,
        ty: &Type,
        path: &mut Vec<String>,
    ) -> Result<TPat, FactDbError> {
        let mismatch = || FactDbError::type_error(format!("pattern {pat} does not match type {ty}"));
        match (pat, ty) {
            (Pattern::Wild, _) => Ok(TPat::Wild),
            (Pattern::NoExpand(inner), _) => {
                scope.no_expand.insert(path.clone());
                self.pattern(scope, inner, ty, path)
            }
            (Pattern::Var(name), _) => scope.var(name, ty),
            (_, Type::Predicate(p)) => {
                let schema = self.schema;
                let def = schema
                    .get(p)
                    .ok_or_else(|| FactDbError::UnknownPredicate(p.to_string()))?;
                self.derive(def)?;
                let key = self.pattern(scope, pat, &def.key_type, path)?;
                Ok(TPat::Deref {
                    predicate: p.clone(),
                    key: Box::new(key),
                })
            }
            (Pattern::Nat(n), Type::Nat) => Ok(TPat::Lit(Value::Nat(*n))),
            (Pattern::Nat(n), Type::Byte) => u8::try_from(*n)
                .map(|b| TPat::Lit(Value::Byte(b)))
                .map_err(|_| FactDbError::type_error(format!("{n} does not fit in a byte"))),
            (Pattern::String(s), Type::String) => Ok(TPat::Lit(Value::string(s.clone()))),
            (Pattern::Prefix(s), Type::String) => Ok(TPat::Prefix(s.clone())),
            (Pattern::Bool(b), Type::Bool) => Ok(TPat::Lit(Value::Bool(*b))),
            (Pattern::Array(items), Type::Array(elem)) => items
                .iter()
                .map(|item| self.pattern(scope, item, elem, path))
                .collect::<Result<Vec<_>, _>>()
                .map(TPat::Array),
            (Pattern::Fields(given), Type::Record(fields)) => {
                let mut matched = Vec::with_capacity(given.len());
                for (name, sub) in given {
                    let index = field_index(fields, name, ty)?;
                    path.push(name.clone());
                    let checked = self.pattern(scope, sub, &fields[index].ty, path);
                    path.pop();
                    matched.push((index, checked?));
                }
                Ok(TPat::Record(fields.len(), matched))
            }
            (Pattern::Fields(given), Type::Sum(alts)) => match given.as_slice() {
                [(name, sub)] => {
                    let index = field_index(alts, name, ty)?;
                    path.push(name.clone());
                    let checked = self.pattern(scope, sub, &alts[index].ty, path);
                    path.pop();
                    Ok(TPat::Alt(alt_index(index)?, Box::new(checked?)))
                }
                _ => Err(FactDbError::type_error(format!(
                    "a pattern for {ty} must select exactly one alternative"
                ))),
            },
            (Pattern::Tuple(items), Type::Record(fields)) => {
                if items.len() != fields.len() {
                    return Err(FactDbError::type_error(format!(
                        "expected {} fields for {ty}, found {}",
                        fields.len(),
                        items.len()
                    )));
                }
                let mut matched = Vec::with_capacity(items.len());
                for (index, (sub, field)) in items.iter().zip(fields).enumerate() {
                    path.push(field.name.clone());
                    let checked = self.pattern(scope, sub, &field.ty, path);
                    path.pop();
                    matched.push((index, checked?));
                }
                Ok(TPat::Record(fields.len(), matched))
            }
            _ => Err(mismatch()),
        }
    }

    /// Check an expression, against `expected` when known.
    fn expr(
        &mut self,
        scope: &mut Scope<'s>,
        pat: &Pattern,
        expected: Option<&Type>,
    ) -> Result<(TExpr, Type), FactDbError> {
        let mismatch = |ty: &Type| FactDbError::type_error(format!("expression {pat} does not have type {ty}"));
        match (pat, expected) {
            (Pattern::NoExpand(inner), _) => self.expr(scope, inner, expected),
            (Pattern::Var(name), _) => {
                let v = *scope
                    .by_name
                    .get(name)
                    .ok_or_else(|| FactDbError::UnboundVariable(name.clone()))?;
                let ty = scope.vars[v].ty.clone();
                if let Some(expected) = expected {
                    if !compatible(&ty, expected) {
                        return Err(mismatch(expected));
                    }
                }
                Ok((TExpr::Var(v), ty))
            }
            (Pattern::Wild | Pattern::Prefix(_), _) => Err(FactDbError::type_error(format!(
                "{pat} is a pattern, not an expression"
            ))),
            (Pattern::Nat(n), Some(Type::Byte)) => u8::try_from(*n)
                .map(|b| (TExpr::Lit(Value::Byte(b)), Type::Byte))
                .map_err(|_| FactDbError::type_error(format!("{n} does not fit in a byte"))),
            (Pattern::Nat(n), None | Some(Type::Nat)) => Ok((TExpr::Lit(Value::Nat(*n)), Type::Nat)),
            (Pattern::String(s), None | Some(Type::String)) => {
                Ok((TExpr::Lit(Value::string(s.clone())), Type::String))
            }
            (Pattern::Bool(b), None | Some(Type::Bool)) => Ok((TExpr::Lit(Value::Bool(*b)), Type::Bool)),
            (Pattern::Array(items), Some(Type::Array(elem))) => {
                let items = items
                    .iter()
                    .map(|item| self.expr(scope, item, Some(elem)).map(|(e, _)| e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((TExpr::Array(items), Type::Array(elem.clone())))
            }
            (Pattern::Array(items), None) => {
                let (first, rest) = items
                    .split_first()
                    .ok_or_else(|| FactDbError::type_error("cannot infer the type of an empty array"))?;
                let (head, elem) = self.expr(scope, first, None)?;
                let mut exprs = vec![head];
                for item in rest {
                    exprs.push(self.expr(scope, item, Some(&elem))?.0);
                }
                Ok((TExpr::Array(exprs), Type::Array(Box::new(elem))))
            }
            (Pattern::Fields(given), Some(ty @ Type::Record(fields))) => {
                if let Some((name, _)) = given.iter().find(|(n, _)| !fields.iter().any(|f| &f.name == n)) {
                    return Err(FactDbError::type_error(format!("unknown field {name} in {ty}")));
                }
                let mut exprs = Vec::with_capacity(fields.len());
                for field in fields {
                    let expr = match given.iter().find(|(n, _)| n == &field.name) {
                        Some((_, sub)) => self.expr(scope, sub, Some(&field.ty))?.0,
                        None => TExpr::Lit(field.default_value().ok_or_else(|| {
                            FactDbError::type_error(format!("missing field {} in {ty}", field.name))
                        })?),
                    };
                    exprs.push(expr);
                }
                Ok((TExpr::Record(exprs), ty.clone()))
            }
            (Pattern::Tuple(items), Some(ty @ Type::Record(fields))) if items.len() == fields.len() => {
                let exprs = items
                    .iter()
                    .zip(fields)
                    .map(|(item, field)| self.expr(scope, item, Some(&field.ty)).map(|(e, _)| e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((TExpr::Record(exprs), ty.clone()))
            }
            (Pattern::Fields(given), Some(ty @ Type::Sum(alts))) => match given.as_slice() {
                [(name, sub)] => {
                    let index = field_index(alts, name, ty)?;
                    let inner = self.expr(scope, sub, Some(&alts[index].ty))?.0;
                    Ok((TExpr::Alt(alt_index(index)?, Box::new(inner)), ty.clone()))
                }
                _ => Err(FactDbError::type_error(format!(
                    "an expression of {ty} must select exactly one alternative"
                ))),
            },
            (Pattern::Fields(given), None) => {
                let mut exprs = Vec::with_capacity(given.len());
                let mut fields: Vec<Field> = Vec::with_capacity(given.len());
                for (name, sub) in given {
                    if fields.iter().any(|f| &f.name == name) {
                        return Err(FactDbError::type_error(format!("duplicate field {name}")));
                    }
                    let (expr, ty) = self.expr(scope, sub, None)?;
                    exprs.push(expr);
                    fields.push(Field::new(name.clone(), ty));
                }
                Ok((TExpr::Record(exprs), Type::Record(fields)))
            }
            (Pattern::Tuple(_), None) => Err(FactDbError::type_error(format!(
                "cannot infer the type of {pat}; name its fields"
            ))),
            (_, Some(ty)) => Err(mismatch(ty)),
        }
    }
}

fn field_index(fields: &[Field], name: &str, ty: &Type) -> Result<usize, FactDbError> {
    fields
        .iter()
        .position(|f| f.name == name)
        .ok_or_else(|| FactDbError::type_error(format!("unknown field {name} in {ty}")))
}

fn alt_index(index: usize) -> Result<u32, FactDbError> {
    u32::try_from(index).map_err(|_| FactDbError::type_error("too many alternatives"))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::query::parser::parse_query;

    const SCHEMA: &str = r#"
        schema example.1 {
          predicate Class : { name : string, line : nat }
          predicate Parent : { child : Class, parent : Class }
          predicate Tag : { kind : enum { red | green }, label : maybe string }
        }
        schema example.2 : example.1 {
          predicate Foo : string S where Class { S, _ }
          predicate Loop : string S where Loop S
        }
    "#;

    fn check(text: &str) -> Result<Ir, FactDbError> {
        let schema = Schema::from_source(SCHEMA).expect("schema");
        typecheck(&parse_query(text).expect("parse"), &schema)
    }

    #[test]
    fn field_pattern_against_record() {
        let ir = check(r#"example.Class { name = "A" }"#).expect("check");
        assert_eq!(ir.result, ResultType::Fact(PredicateRef::new("example.Class", 1)));
        let IrSource::Facts { key, .. } = &ir.stages[0].source else {
            panic!("expected a fact source");
        };
        assert_eq!(key, &TPat::Record(2, vec![(0, TPat::Lit(Value::string("A")))]));
    }

    #[test]
    fn short_name_resolves_when_unambiguous() {
        let ir = check("Class _").expect("check");
        assert_eq!(ir.result, ResultType::Fact(PredicateRef::new("example.Class", 1)));
    }

    #[test]
    fn string_against_predicate_field_derefs() {
        let ir = check(r#"example.Parent { child = { name = "A" } }"#).expect("check");
        let IrSource::Facts { key, .. } = &ir.stages[0].source else {
            panic!("expected a fact source");
        };
        let TPat::Record(_, fields) = key else {
            panic!("expected a record pattern");
        };
        assert!(matches!(&fields[0].1, TPat::Deref { predicate, .. } if predicate.name == "example.Class"));
    }

    #[test]
    fn variables_bind_then_compare() {
        let ir = check("C = example.Class _; example.Parent { child = C }").expect("check");
        assert_eq!(ir.vars.len(), 1);
        assert_eq!(ir.stages[0].bind, TPat::Bind(0));
        let IrSource::Facts { key, .. } = &ir.stages[1].source else {
            panic!("expected a fact source");
        };
        assert_eq!(key, &TPat::Record(2, vec![(0, TPat::Same(0))]));
    }

    #[test]
    fn unknown_field_is_type_error() {
        assert!(matches!(
            check(r#"example.Class { nope = 1 }"#),
            Err(FactDbError::TypeError(_))
        ));
    }

    #[test]
    fn wrong_literal_kind_is_type_error() {
        assert!(matches!(
            check(r#"example.Class { line = "x" }"#),
            Err(FactDbError::TypeError(_))
        ));
    }

    #[test]
    fn mismatched_variable_types() {
        assert!(matches!(
            check("example.Class { name = X, line = X }"),
            Err(FactDbError::TypeError(_))
        ));
    }

    #[test]
    fn unknown_predicate() {
        assert!(matches!(check("example.Nope _"), Err(FactDbError::UnknownPredicate(_))));
        assert!(matches!(
            check("example.Class.7 _"),
            Err(FactDbError::UnknownVersion { version: 7, .. })
        ));
    }

    #[test]
    fn unbound_variable_in_expression() {
        assert!(matches!(check("prim.toLower S"), Err(FactDbError::UnboundVariable(_))));
        assert!(matches!(check("X"), Err(FactDbError::UnboundVariable(_))));
    }

    #[test]
    fn enum_and_maybe_patterns() {
        let ir = check(r#"example.Tag { kind = { green = {} }, label = { just = "x" } }"#).expect("check");
        let IrSource::Facts { key, .. } = &ir.stages[0].source else {
            panic!("expected a fact source");
        };
        assert_eq!(
            key,
            &TPat::Record(
                2,
                vec![
                    (0, TPat::Alt(1, Box::new(TPat::Record(0, Vec::new())))),
                    (1, TPat::Alt(1, Box::new(TPat::Lit(Value::string("x"))))),
                ]
            )
        );
    }

    #[test]
    fn derived_body_is_checked_in_scope() {
        let ir = check("example.Foo _").expect("check");
        let body = ir
            .derived
            .get(&PredicateRef::new("example.Foo", 2))
            .expect("derived body");
        assert_eq!(body.result, ResultType::Value(Type::String));
        assert_eq!(body.stages.len(), 2);
    }

    #[test]
    fn recursive_derivation_is_rejected() {
        let err = check("example.Loop _").expect_err("recursive");
        assert!(err.to_string().contains("recursive"), "{err}");
    }

    #[test]
    fn fact_id_must_be_last() {
        assert!(check("$1024").is_ok());
        assert!(check("$1024; example.Class _").is_err());
    }

    #[test]
    fn no_expand_paths_are_recorded() {
        let ir = check("example.Parent { child = C.. }").expect("check");
        assert!(ir.no_expand.contains(&vec!["child".to_string()]));
    }

    #[test]
    fn value_pattern_checked_against_value_type() {
        let schema = Schema::from_source(
            "schema kv.1 { predicate Named : string -> { name : string, line : nat } }",
        )
        .expect("schema");
        let ir = typecheck(&parse_query(r#"kv.Named "a" -> { line = L }"#).expect("parse"), &schema)
            .expect("check");
        let IrSource::Facts { value, .. } = &ir.stages[0].source else {
            panic!("expected a fact source");
        };
        assert_eq!(value, &TPat::Record(2, vec![(1, TPat::Bind(0))]));
        assert!(typecheck(&parse_query(r#"kv.Named _ -> 3"#).expect("parse"), &schema).is_err());
    }

    #[test]
    fn prims() {
        let ir = check(r#"prim.toLower "AbC""#).expect("check");
        assert_eq!(ir.result, ResultType::Value(Type::String));
        let ir = check("prim.length [0, 0, 0]").expect("check");
        assert_eq!(ir.result, ResultType::Value(Type::Nat));
        assert!(check("prim.length 3").is_err());
        assert!(check("prim.nope 3").is_err());
    }
}
