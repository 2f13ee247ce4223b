//! # Schema Registry
//!
//! Registration resolves [`SchemaDecl`]s into a [`Schema`] snapshot. The live
//! [`SchemaRegistry`] holds the current snapshot behind an [`ArcSwap`]: readers
//! take a snapshot lock-free and keep it for as long as they need, while
//! `register`/`reload` build a new snapshot and publish it with one store.

use super::parser::{FieldExpr, Literal, SchemaItem, TypeExpr};
use super::{DefKind, Derivation, Field, PredicateDef, Schema, SchemaDecl, SchemaInfo, Type, parse_schema};
use crate::primitives::{BUILTIN_SCHEMA, SCHEMA_FILE_EXTENSION};
use crate::syntax::split_version;
use crate::{FactDbError, PredicateRef, Value};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// REGISTRATION
// =============================================================================

/// Names visible while resolving one declaration.
struct Scope<'a> {
    types: &'a BTreeMap<String, Type>,
    predicates: &'a BTreeMap<String, PredicateRef>,
}

impl Schema {
    /// A snapshot containing only the builtin schema.
    pub fn builtin() -> Result<Self, FactDbError> {
        let mut schema = Self::default();
        for decl in parse_schema(BUILTIN_SCHEMA)? {
            schema.register(decl)?;
        }
        Ok(schema)
    }

    /// Parse and register all declarations in `text`, on top of the builtin schema.
    pub fn from_source(text: &str) -> Result<Self, FactDbError> {
        let mut schema = Self::builtin()?;
        for decl in parse_schema(text)? {
            schema.register(decl)?;
        }
        Ok(schema)
    }

    /// Register one declaration. On error the snapshot is unchanged.
    pub fn register(&mut self, decl: SchemaDecl) -> Result<(), FactDbError> {
        let id = decl.id();
        if let Some(existing) = self.schemas.get(&id) {
            if existing.decl == decl {
                return Ok(());
            }
            return Err(FactDbError::DuplicateDefinition(format!("schema {id}")));
        }

        let mut exports: BTreeMap<String, PredicateRef> = BTreeMap::new();
        let mut exported_types: BTreeMap<String, Type> = BTreeMap::new();
        for dep in &decl.inherits {
            let info = self
                .schemas
                .get(dep)
                .ok_or_else(|| FactDbError::UnknownDependency(dep.to_string()))?;
            exports.extend(info.exports.clone());
            exported_types.extend(info.types.clone());
        }

        let mut scope_predicates = exports.clone();
        let mut scope_types = exported_types.clone();
        for dep in &decl.imports {
            let info = self
                .schemas
                .get(dep)
                .ok_or_else(|| FactDbError::UnknownDependency(dep.to_string()))?;
            for (short, p) in &info.exports {
                scope_predicates.entry(short.clone()).or_insert_with(|| p.clone());
            }
            for (name, ty) in &info.types {
                scope_types.entry(name.clone()).or_insert_with(|| ty.clone());
            }
        }

        // Own predicates are visible to every item, in any order.
        let mut own = BTreeSet::new();
        for item in &decl.items {
            if let SchemaItem::Predicate { name, .. } = item {
                let p = PredicateRef::new(format!("{}.{name}", decl.name), decl.version);
                if !own.insert(p.clone()) {
                    return Err(FactDbError::DuplicateDefinition(p.to_string()));
                }
                exports.insert(name.clone(), p.clone());
                scope_predicates.insert(name.clone(), p);
            }
        }

        // Aliases resolve in declaration order.
        for item in &decl.items {
            if let SchemaItem::Type { name, ty } = item {
                let scope = Scope {
                    types: &scope_types,
                    predicates: &scope_predicates,
                };
                let resolved = self.resolve_type(ty, &scope, &own)?;
                scope_types.insert(name.clone(), resolved.clone());
                exported_types.insert(name.clone(), resolved);
            }
        }

        let scope = Scope {
            types: &scope_types,
            predicates: &scope_predicates,
        };
        let mut defs = Vec::new();
        for item in &decl.items {
            let SchemaItem::Predicate {
                name,
                key,
                value,
                derivation,
            } = item
            else {
                continue;
            };
            let predicate = PredicateRef::new(format!("{}.{name}", decl.name), decl.version);
            let key_type = self.resolve_type(key, &scope, &own)?;
            let value_type = match value {
                Some(v) => self.resolve_type(v, &scope, &own)?,
                None => Type::unit(),
            };
            let kind = match derivation {
                Some((key, body)) => {
                    if !value_type.is_unit() {
                        return Err(FactDbError::type_error(format!(
                            "derived predicate {predicate} cannot have a value type"
                        )));
                    }
                    DefKind::Derived(Derivation {
                        key: key.clone(),
                        body: body.clone(),
                        scope: scope_predicates.clone(),
                    })
                }
                None => DefKind::Stored,
            };
            let def = PredicateDef {
                predicate,
                key_type,
                value_type,
                kind,
            };
            if let Some(existing) = self.predicates.get(&def.predicate) {
                if existing != &def {
                    return Err(FactDbError::DuplicateDefinition(def.predicate.to_string()));
                }
            }
            defs.push(def);
        }

        for def in defs {
            self.predicates.insert(def.predicate.clone(), def);
        }
        tracing::debug!(schema = %id, predicates = own.len(), "registered schema");
        self.schemas.insert(
            id,
            SchemaInfo {
                decl,
                exports,
                types: exported_types,
            },
        );
        Ok(())
    }

    fn resolve_type(
        &self,
        expr: &TypeExpr,
        scope: &Scope<'_>,
        own: &BTreeSet<PredicateRef>,
    ) -> Result<Type, FactDbError> {
        Ok(match expr {
            TypeExpr::Byte => Type::Byte,
            TypeExpr::Nat => Type::Nat,
            TypeExpr::Bool => Type::Bool,
            TypeExpr::String => Type::String,
            TypeExpr::Array(elem) => Type::Array(Box::new(self.resolve_type(elem, scope, own)?)),
            TypeExpr::Record(fields) => Type::Record(self.resolve_fields(fields, scope, own)?),
            TypeExpr::Sum(fields) => Type::Sum(self.resolve_fields(fields, scope, own)?),
            TypeExpr::Maybe(inner) => Type::Sum(vec![
                Field::new("nothing", Type::unit()),
                Field::new("just", self.resolve_type(inner, scope, own)?),
            ]),
            TypeExpr::Enum(names) => {
                let mut seen = BTreeSet::new();
                let mut alts = Vec::with_capacity(names.len());
                for name in names {
                    if !seen.insert(name) {
                        return Err(FactDbError::type_error(format!("duplicate alternative: {name}")));
                    }
                    alts.push(Field::new(name.clone(), Type::unit()));
                }
                Type::Sum(alts)
            }
            TypeExpr::Named(name) => self.resolve_named(name, scope, own)?,
        })
    }

    fn resolve_named(
        &self,
        text: &str,
        scope: &Scope<'_>,
        own: &BTreeSet<PredicateRef>,
    ) -> Result<Type, FactDbError> {
        let known = |p: &PredicateRef| own.contains(p) || self.predicates.contains_key(p);
        match split_version(text) {
            (name, Some(version)) => {
                let qualified = scope.predicates.get(name).map_or(name, |p| p.name.as_str());
                let p = PredicateRef::new(qualified, version);
                if known(&p) {
                    Ok(Type::Predicate(p))
                } else {
                    Err(FactDbError::type_error(format!("unknown predicate in type: {text}")))
                }
            }
            (name, None) => {
                if let Some(ty) = scope.types.get(name) {
                    return Ok(ty.clone());
                }
                if let Some(p) = scope.predicates.get(name) {
                    return Ok(Type::Predicate(p.clone()));
                }
                if let Some(p) = scope.predicates.values().find(|p| p.name == name) {
                    return Ok(Type::Predicate(p.clone()));
                }
                self.latest(name)
                    .map(Type::Predicate)
                    .ok_or_else(|| FactDbError::type_error(format!("unknown type: {name}")))
            }
        }
    }

    fn resolve_fields(
        &self,
        fields: &[FieldExpr],
        scope: &Scope<'_>,
        own: &BTreeSet<PredicateRef>,
    ) -> Result<Vec<Field>, FactDbError> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            if !seen.insert(field.name.as_str()) {
                return Err(FactDbError::type_error(format!("duplicate field: {}", field.name)));
            }
            let ty = self.resolve_type(&field.ty, scope, own)?;
            let default = match &field.default {
                Some(lit) => Some(literal_value(lit, &ty, &field.name)?),
                None => None,
            };
            out.push(Field {
                name: field.name.clone(),
                ty,
                default,
            });
        }
        Ok(out)
    }
}

fn literal_value(lit: &Literal, ty: &Type, field: &str) -> Result<Value, FactDbError> {
    match (lit, ty) {
        (Literal::Nat(n), Type::Nat) => Ok(Value::Nat(*n)),
        (Literal::Nat(n), Type::Byte) => u8::try_from(*n)
            .map(Value::Byte)
            .map_err(|_| FactDbError::type_error(format!("default for {field} out of byte range"))),
        (Literal::String(s), Type::String) => Ok(Value::String(s.clone())),
        (Literal::Bool(b), Type::Bool) => Ok(Value::Bool(*b)),
        _ => Err(FactDbError::type_error(format!(
            "default for {field} does not match type {ty}"
        ))),
    }
}

// =============================================================================
// SCHEMA SOURCES
// =============================================================================

/// Where schema source text comes from.
pub trait SchemaSource {
    /// All schema sources as `(origin, text)` pairs, in load order.
    fn load(&self) -> Result<Vec<(String, String)>, FactDbError>;
}

/// Reads every `*.angle` file in a directory, sorted by file name.
#[derive(Debug, Clone)]
pub struct DirSchemaSource {
    dir: PathBuf,
}

impl DirSchemaSource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SchemaSource for DirSchemaSource {
    fn load(&self) -> Result<Vec<(String, String)>, FactDbError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| FactDbError::Io(format!("{}: {e}", self.dir.display())))?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| FactDbError::Io(e.to_string()))?.path();
            if path.extension().is_some_and(|ext| ext == SCHEMA_FILE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        paths
            .into_iter()
            .map(|path| {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| FactDbError::Io(format!("{}: {e}", path.display())))?;
                Ok((path.display().to_string(), text))
            })
            .collect()
    }
}

// =============================================================================
// LIVE REGISTRY
// =============================================================================

/// The live, reloadable schema registry.
#[derive(Debug)]
pub struct SchemaRegistry {
    current: ArcSwap<Schema>,
    /// Serializes writers; readers never take it.
    writer: Mutex<()>,
}

impl SchemaRegistry {
    /// A registry holding only the builtin schema.
    pub fn new() -> Result<Self, FactDbError> {
        Ok(Self::with_schema(Schema::builtin()?))
    }

    /// A registry publishing `schema`.
    #[must_use]
    pub fn with_schema(schema: Schema) -> Self {
        Self {
            current: ArcSwap::from_pointee(schema),
            writer: Mutex::new(()),
        }
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Schema> {
        self.current.load_full()
    }

    /// Register declarations on top of the current snapshot. All or nothing.
    pub fn register(&self, decls: Vec<SchemaDecl>) -> Result<Arc<Schema>, FactDbError> {
        let _guard = self.writer.lock();
        let mut next = Schema::clone(&self.current.load());
        for decl in decls {
            next.register(decl)?;
        }
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        Ok(next)
    }

    /// Build a fresh snapshot from `source` (plus the builtin schema) and
    /// publish it. A failed reload leaves the current snapshot in place.
    pub fn reload(&self, source: &dyn SchemaSource) -> Result<Arc<Schema>, FactDbError> {
        let _guard = self.writer.lock();
        let mut next = Schema::builtin()?;
        for (origin, text) in source.load()? {
            let decls = parse_schema(&text).map_err(|e| {
                tracing::warn!(origin = %origin, error = %e, "schema reload failed");
                e
            })?;
            for decl in decls {
                next.register(decl).map_err(|e| {
                    tracing::warn!(origin = %origin, error = %e, "schema reload failed");
                    e
                })?;
            }
        }
        let count = next.predicates.len();
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        tracing::info!(predicates = count, "schema reloaded");
        Ok(next)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const EXAMPLE: &str = r#"
        schema example.1 {
          type Loc = { line : nat, column : nat = 1 }
          predicate Class : { name : string, loc : Loc }
          predicate Parent : { child : Class, parent : Class }
        }
        schema all.1 : example.1 {}
    "#;

    #[test]
    fn builtin_blob_is_always_present() {
        let schema = Schema::builtin().expect("builtin");
        let def = schema.resolve("sys.Blob", None).expect("resolve");
        assert_eq!(def.key_type, Type::String);
        assert_eq!(def.predicate.version, 1);
    }

    #[test]
    fn resolves_names_aliases_and_references() {
        let schema = Schema::from_source(EXAMPLE).expect("schema");
        let class = schema.resolve("example.Class", None).expect("class");
        let Type::Record(fields) = &class.key_type else {
            panic!("expected record");
        };
        assert_eq!(fields[1].name, "loc");
        let Type::Record(loc) = &fields[1].ty else {
            panic!("alias should be expanded");
        };
        assert_eq!(loc[1].default, Some(Value::Nat(1)));

        let parent = schema.resolve("example.Parent", Some(1)).expect("parent");
        let Type::Record(fields) = &parent.key_type else {
            panic!("expected record");
        };
        assert_eq!(fields[0].ty, Type::Predicate(PredicateRef::new("example.Class", 1)));
    }

    #[test]
    fn unknown_predicate_and_version() {
        let schema = Schema::from_source(EXAMPLE).expect("schema");
        assert!(matches!(
            schema.resolve("example.Nope", None),
            Err(FactDbError::UnknownPredicate(_))
        ));
        assert!(matches!(
            schema.resolve("example.Class", Some(9)),
            Err(FactDbError::UnknownVersion { version: 9, .. })
        ));
    }

    #[test]
    fn identical_registration_is_noop_and_changed_is_duplicate() {
        let mut schema = Schema::from_source(EXAMPLE).expect("schema");
        let decls = parse_schema(EXAMPLE).expect("parse");
        for decl in decls {
            schema.register(decl).expect("identical re-registration");
        }
        let changed = parse_schema("schema example.1 { predicate Class : string }").expect("parse");
        let err = schema
            .register(changed.into_iter().next().expect("decl"))
            .expect_err("changed content must fail");
        assert!(matches!(err, FactDbError::DuplicateDefinition(_)));
    }

    #[test]
    fn unknown_dependency() {
        let err = Schema::from_source("schema a.1 : missing.3 {}").expect_err("should fail");
        assert!(matches!(err, FactDbError::UnknownDependency(ref d) if d == "missing.3"));
        let err = Schema::from_source("schema a.1 { import missing.1 }").expect_err("should fail");
        assert!(matches!(err, FactDbError::UnknownDependency(_)));
    }

    #[test]
    fn unresolvable_type_is_type_error() {
        let err = Schema::from_source("schema a.1 { predicate P : Missing }").expect_err("should fail");
        assert!(matches!(err, FactDbError::TypeError(_)));
    }

    #[test]
    fn latest_follows_highest_umbrella() {
        let schema = Schema::from_source(
            r#"
            schema example.1 { predicate Class : string }
            schema example.2 : example.1 { predicate Class : { name : string } }
            schema all.1 : example.1 {}
            "#,
        )
        .expect("schema");
        // all.1 only exports Class.1, even though Class.2 exists.
        assert_eq!(
            schema.latest("example.Class"),
            Some(PredicateRef::new("example.Class", 1))
        );

        let schema = Schema::from_source(
            r#"
            schema example.1 { predicate Class : string }
            schema example.2 : example.1 { predicate Class : { name : string } }
            "#,
        )
        .expect("schema");
        assert_eq!(
            schema.latest("example.Class"),
            Some(PredicateRef::new("example.Class", 2))
        );
    }

    #[test]
    fn inherited_predicates_are_exported() {
        let schema = Schema::from_source(
            r#"
            schema example.1 { predicate Class : string }
            schema example.2 : example.1 { predicate Foo : string S where Class S }
            schema all.2 : example.2 {}
            "#,
        )
        .expect("schema");
        assert_eq!(
            schema.latest("example.Class"),
            Some(PredicateRef::new("example.Class", 1))
        );
        let foo = schema.resolve("example.Foo", None).expect("foo");
        assert!(foo.is_derived());
        let DefKind::Derived(d) = &foo.kind else {
            panic!("derived");
        };
        assert_eq!(
            d.scope.get("Class"),
            Some(&PredicateRef::new("example.Class", 1))
        );
    }

    #[test]
    fn prefix_listing() {
        let schema = Schema::from_source(EXAMPLE).expect("schema");
        let found = schema.predicates_with_prefix("example.C");
        assert_eq!(found, vec![PredicateRef::new("example.Class", 1)]);
        assert_eq!(schema.predicates_with_prefix("example.").len(), 2);
    }

    #[test]
    fn reload_swaps_and_failed_reload_keeps_old() {
        let dir = tempdir().expect("temp dir");
        std::fs::write(dir.path().join("example.angle"), EXAMPLE).expect("write");
        let registry = SchemaRegistry::new().expect("registry");
        let source = DirSchemaSource::new(dir.path());

        let before = registry.snapshot();
        registry.reload(&source).expect("reload");
        let after = registry.snapshot();
        assert!(before.resolve("example.Class", None).is_err());
        assert!(after.resolve("example.Class", None).is_ok());

        std::fs::write(dir.path().join("broken.angle"), "schema broken {").expect("write");
        assert!(registry.reload(&source).is_err());
        assert!(Arc::ptr_eq(&after, &registry.snapshot()));
    }

    #[test]
    fn register_on_live_registry() {
        let registry = SchemaRegistry::new().expect("registry");
        registry
            .register(parse_schema(EXAMPLE).expect("parse"))
            .expect("register");
        assert!(registry.snapshot().resolve("example.Parent", None).is_ok());
    }
}
