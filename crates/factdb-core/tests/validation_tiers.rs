//! # Validation Tier Tests (T0-T4)
//!
//! End-to-end checks through the database manager.
//!
//! ## Tiers
//! - T0: Ingestion Integrity
//! - T1: Pattern Queries
//! - T2: Database Lifecycle
//! - T3: Derived Predicates After Reload
//! - T4: Schema Evolution and Schema Modes

use factdb_core::{
    DatabaseManager, DirSchemaSource, ExpandPolicy, FactDbError, QueryOptions, Repo, SchemaMode, SchemaRegistry,
    StoreState,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const GLEAN_TEST: &str = r#"
schema glean.test.6 {
  predicate Name : string
  predicate Expr :
    { var_ : Name
    | lit : nat
    | ap : { fun : Expr, arg : Expr }
    | lam : { var_ : Name, body : Expr }
    }
}
schema all.6 : glean.test.6 {}
"#;

const EXPR_FACTS: &str = r#"[
  { "predicate": "glean.test.Name",
    "facts": [ { "id": 1, "key": "x" }, { "id": 2, "key": "y" } ] },
  { "predicate": "glean.test.Expr",
    "facts": [
      { "id": 3, "key": { "var_": 1 } },
      { "id": 4, "key": { "var_": 2 } },
      { "id": 5, "key": { "lit": 7 } },
      { "id": 6, "key": { "lam": { "var_": 1, "body": 3 } } },
      { "id": 7, "key": { "lam": { "var_": 2, "body": 5 } } },
      { "id": 8, "key": { "ap": { "fun": 6, "arg": 7 } } }
    ] }
]"#;

/// A schema directory, a database root and the files written into them.
struct Fixture {
    dir: TempDir,
    manager: DatabaseManager,
}

impl Fixture {
    fn new(schema: &str) -> Self {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("schema")).expect("mkdir");
        std::fs::write(dir.path().join("schema/test.angle"), schema).expect("write schema");
        let registry = Arc::new(SchemaRegistry::new().expect("registry"));
        registry.reload(&DirSchemaSource::new(dir.path().join("schema"))).expect("reload");
        let manager = DatabaseManager::open_dir(dir.path().join("db"), registry).expect("manager");
        Self { dir, manager }
    }

    fn file(&self, name: &str, text: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, text).expect("write facts");
        path
    }

    fn reload(&self, schema: &str) {
        std::fs::write(self.schema_dir().join("test.angle"), schema).expect("write schema");
        self.manager
            .registry()
            .reload(&DirSchemaSource::new(self.schema_dir()))
            .expect("reload");
    }

    fn schema_dir(&self) -> PathBuf {
        self.dir.path().join("schema")
    }

    fn load(&self, name: &str, text: &str) -> Repo {
        let path = self.file(&format!("{name}.json"), text);
        self.manager.load(None, &[path]).expect("load").repo().clone()
    }
}

fn keys(fixture: &Fixture, repo: &Repo, query: &str, options: &QueryOptions) -> Vec<serde_json::Value> {
    fixture
        .manager
        .query(repo, query, options)
        .expect("query")
        .bindings
        .into_iter()
        .map(|b| b.json["key"].clone())
        .collect()
}

fn exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}

// =============================================================================
// TIER T0: INGESTION INTEGRITY
// =============================================================================

mod t0_ingestion {
    use super::*;

    /// T0.1: Identical facts share one id, within a file and across files.
    #[test]
    fn duplicate_facts_share_ids() {
        let fixture = Fixture::new(GLEAN_TEST);
        let db = fixture.manager.create("dups", None).expect("create");
        let text = r#"[{ "predicate": "glean.test.Name", "facts": [ { "key": "x" }, { "key": "x" } ] }]"#;
        let file = factdb_core::parse_fact_file("a", text).expect("parse");
        assert_eq!(db.ingest(&file).expect("first"), 1);
        assert_eq!(db.ingest(&file).expect("second"), 0);
        assert_eq!(db.statistics().total().count, 1);
    }

    /// T0.2: A file that does not typecheck commits nothing.
    #[test]
    fn bad_file_commits_nothing() {
        let fixture = Fixture::new(GLEAN_TEST);
        let db = fixture.manager.create("bad", None).expect("create");
        let text = r#"[
          { "predicate": "glean.test.Name", "facts": [ { "key": "x" } ] },
          { "predicate": "glean.test.Expr", "facts": [ { "key": { "nope": 1 } } ] }
        ]"#;
        let file = factdb_core::parse_fact_file("bad.json", text).expect("parse");
        let err = db.ingest(&file).expect_err("bad alternative");
        assert!(matches!(err, FactDbError::IngestionParseFailure { ref file, .. } if file == "bad.json"));
        assert_eq!(db.statistics().total().count, 0);
        assert_eq!(db.state(), StoreState::Incomplete);
    }
}

// =============================================================================
// TIER T1: PATTERN QUERIES
// =============================================================================

mod t1_queries {
    use super::*;

    /// T1.1: Six Expr facts, one lambda binding `x`.
    #[test]
    fn lambda_over_x() {
        let fixture = Fixture::new(GLEAN_TEST);
        let repo = fixture.load("expr", EXPR_FACTS);
        assert_eq!(repo, Repo::new("expr", "0"));

        let stats = fixture.manager.statistics(&repo).expect("stats");
        let expr = stats
            .predicates
            .iter()
            .find(|(p, _)| p.name == "glean.test.Expr")
            .map(|(_, s)| s.count);
        assert_eq!(expr, Some(6));

        let results = fixture
            .manager
            .query(&repo, r#"glean.test.Expr { lam = { var_ = "x" } }"#, &QueryOptions::default())
            .expect("query");
        assert_eq!(results.bindings.len(), 1);
    }

    /// T1.2: Short names resolve; bare predicates list every fact in order.
    #[test]
    fn bare_predicate_in_store_order() {
        let fixture = Fixture::new(GLEAN_TEST);
        let repo = fixture.load("expr", EXPR_FACTS);
        let names = keys(&fixture, &repo, "Name _", &QueryOptions::default());
        assert_eq!(names, vec![json!("x"), json!("y")]);
    }

    /// T1.3: Variables join stages; only distinct bindings flow on.
    #[test]
    fn pipeline_join() {
        let fixture = Fixture::new(GLEAN_TEST);
        let repo = fixture.load("expr", EXPR_FACTS);
        let options = QueryOptions {
            expand: ExpandPolicy::Off,
            ..QueryOptions::default()
        };
        let bodies = keys(
            &fixture,
            &repo,
            r#"N = glean.test.Name "y" | glean.test.Expr { lam = { var_ = N } }"#,
            &options,
        );
        assert_eq!(bodies, vec![json!({"lam": {"var_": {"id": 1025}, "body": {"id": 1028}}})]);
    }

    /// T1.4: A repeated reference under one fact is inlined once.
    #[test]
    fn expansion_visits_each_pair_once() {
        let fixture = Fixture::new(GLEAN_TEST);
        let text = r#"[
          { "predicate": "glean.test.Name", "facts": [ { "id": 1, "key": "x" } ] },
          { "predicate": "glean.test.Expr", "facts": [
              { "id": 2, "key": { "var_": 1 } },
              { "id": 3, "key": { "ap": { "fun": 2, "arg": 2 } } } ] }
        ]"#;
        let repo = fixture.load("twice", text);
        let results = keys(&fixture, &repo, "glean.test.Expr { ap = _ }", &QueryOptions::default());
        let ap = &results[0]["ap"];
        assert_eq!(ap["fun"]["key"]["var_"]["key"], json!("x"));
        assert_eq!(ap["arg"], json!({"id": 1025}));
    }

    /// T1.5: A fact id lookup returns that fact.
    #[test]
    fn fact_id_lookup() {
        let fixture = Fixture::new(GLEAN_TEST);
        let repo = fixture.load("expr", EXPR_FACTS);
        let results = fixture
            .manager
            .query(&repo, "{1026}", &QueryOptions::default())
            .expect("query");
        assert_eq!(results.bindings.len(), 1);
        assert_eq!(results.bindings[0].json["key"]["var_"]["key"], json!("x"));
    }
}

// =============================================================================
// TIER T2: DATABASE LIFECYCLE
// =============================================================================

mod t2_lifecycle {
    use super::*;

    /// T2.1: A load whose file fails to parse leaves no database.
    #[test]
    fn unparsable_load_leaves_identity_unknown() {
        let fixture = Fixture::new(GLEAN_TEST);
        let bad = fixture.file("broken.json", "[{ \"predicate\": ");
        let err = fixture.manager.load(None, &[bad]).expect_err("parse failure");
        assert!(matches!(err, FactDbError::IngestionParseFailure { ref file, .. } if file.ends_with("broken.json")));
        assert!(matches!(
            fixture.manager.open(&Repo::new("broken", "0")),
            Err(FactDbError::UnknownDatabase(_))
        ));
        assert!(!exists(&fixture.dir.path().join("db/broken")));
    }

    /// T2.2: Loading into an existing identity fails and changes nothing.
    #[test]
    fn load_into_existing_identity() {
        let fixture = Fixture::new(GLEAN_TEST);
        let repo = fixture.load("expr", EXPR_FACTS);
        let more = fixture.file(
            "more.json",
            r#"[{ "predicate": "glean.test.Name", "facts": [ { "key": "z" } ] }]"#,
        );
        let err = fixture.manager.load(Some(repo.clone()), &[more]).expect_err("exists");
        assert!(matches!(err, FactDbError::AlreadyExists(_)));
        assert_eq!(fixture.manager.statistics(&repo).expect("stats").total().count, 8);
        assert_eq!(fixture.manager.open(&repo).expect("open").state(), StoreState::Complete);
    }

    /// T2.3: Dumps re-load with identical statistics.
    #[test]
    fn dump_round_trip() {
        let fixture = Fixture::new(GLEAN_TEST);
        let repo = fixture.load("expr", EXPR_FACTS);
        let dump = fixture.manager.dump(&repo).expect("dump");
        let text = serde_json::to_string(&dump).expect("json");
        let copy = fixture.load("copy", &text);
        assert_eq!(
            fixture.manager.statistics(&copy).expect("stats"),
            fixture.manager.statistics(&repo).expect("stats")
        );
    }

    /// T2.4: Only complete databases can be dumped.
    #[test]
    fn dump_needs_complete_database() {
        let fixture = Fixture::new(GLEAN_TEST);
        let db = fixture.manager.create("partial", None).expect("create");
        assert!(matches!(fixture.manager.dump(db.repo()), Err(FactDbError::Incomplete(_))));
    }

    /// T2.5: A load whose second file parses but does not typecheck stays
    /// listed as incomplete, with the first file's facts kept.
    #[test]
    fn ill_typed_load_is_listed_incomplete() {
        let fixture = Fixture::new(GLEAN_TEST);
        let names = fixture.file(
            "names.json",
            r#"[{ "predicate": "glean.test.Name", "facts": [ { "key": "x" } ] }]"#,
        );
        let wrong = fixture.file(
            "wrong.json",
            r#"[{ "predicate": "glean.test.Name", "facts": [ { "key": 7 } ] }]"#,
        );
        let repo = Repo::new("error", "0");
        let err = fixture
            .manager
            .load(Some(repo.clone()), &[names, wrong])
            .expect_err("type error");
        assert!(matches!(err, FactDbError::IngestionParseFailure { ref file, .. } if file.ends_with("wrong.json")));

        let listed = fixture.manager.list(Some("error/0"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, StoreState::Incomplete);
        assert_eq!(listed[0].facts, 1);
        assert!(matches!(
            fixture.manager.load(Some(repo), &[fixture.file("again.json", EXPR_FACTS)]),
            Err(FactDbError::AlreadyExists(_))
        ));
    }
}

// =============================================================================
// TIER T3: DERIVED PREDICATES AFTER RELOAD
// =============================================================================

mod t3_derived {
    use super::*;

    const WITH_DERIVED: &str = r#"
schema glean.test.6 {
  predicate Name : string
  predicate Expr :
    { var_ : Name
    | lit : nat
    | ap : { fun : Expr, arg : Expr }
    | lam : { var_ : Name, body : Expr }
    }
}
schema glean.test.7 : glean.test.6 {
  predicate LamVar : Name N where Expr { lam = { var_ = N } }
}
schema all.7 : glean.test.7 {}
"#;

    /// T3.1: A derived predicate added by reload is queryable at once.
    #[test]
    fn new_derived_predicate_is_queryable() {
        let fixture = Fixture::new(GLEAN_TEST);
        let repo = fixture.load("expr", EXPR_FACTS);
        assert!(matches!(
            fixture.manager.query(&repo, "glean.test.LamVar _", &QueryOptions::default()),
            Err(FactDbError::UnknownPredicate(_))
        ));

        fixture.reload(WITH_DERIVED);
        let vars = keys(&fixture, &repo, "glean.test.LamVar _", &QueryOptions::default());
        assert_eq!(vars, vec![json!({"id": 1024, "key": "x"}), json!({"id": 1025, "key": "y"})]);
    }

    /// T3.2: Derived predicates need a complete database.
    #[test]
    fn derived_on_building_database() {
        let fixture = Fixture::new(WITH_DERIVED);
        let db = fixture.manager.create("building", None).expect("create");
        let file = factdb_core::parse_fact_file("expr", EXPR_FACTS).expect("parse");
        db.ingest(&file).expect("ingest");
        assert!(matches!(
            fixture.manager.query(db.repo(), "glean.test.LamVar _", &QueryOptions::default()),
            Err(FactDbError::Incomplete(_))
        ));
    }
}

// =============================================================================
// TIER T4: SCHEMA EVOLUTION AND SCHEMA MODES
// =============================================================================

mod t4_schema_modes {
    use super::*;

    const POINT: &str = "schema shape.1 { predicate Point : { x : nat, y : nat } }";
    const POINT_LABELLED: &str =
        r#"schema shape.1 { predicate Point : { x : nat, y : nat, label : string = "origin" } }"#;
    const POINT_V2: &str = r#"
        schema shape.1 { predicate Point : { x : nat, y : nat } }
        schema shape.2 : shape.1 { predicate Point : { x : nat, y : nat, z : nat } }
    "#;
    const FACTS: &str = r#"[{ "predicate": "shape.Point", "facts": [ { "key": { "x": 1, "y": 2 } } ] }]"#;

    fn options(mode: SchemaMode) -> QueryOptions {
        QueryOptions {
            mode,
            ..QueryOptions::default()
        }
    }

    /// T4.1: An added field with a default shows up only in current mode.
    #[test]
    fn added_field_toggles_with_mode() {
        let fixture = Fixture::new(POINT);
        let repo = fixture.load("points", FACTS);
        fixture.reload(POINT_LABELLED);

        let current = keys(&fixture, &repo, "shape.Point _", &options(SchemaMode::Current));
        assert_eq!(current, vec![json!({"x": 1, "y": 2, "label": "origin"})]);
        let stored = keys(&fixture, &repo, "shape.Point _", &options(SchemaMode::Stored));
        assert_eq!(stored, vec![json!({"x": 1, "y": 2})]);

        let introspect = |mode| {
            let schema = fixture.manager.schema(&repo, mode).expect("schema");
            let def = schema.resolve("shape.Point", None).expect("resolve");
            def.key_type.to_string()
        };
        assert!(introspect(SchemaMode::Current).contains("label : string = \"origin\""));
        assert!(!introspect(SchemaMode::Stored).contains("label"));
    }

    /// T4.1b: The stored schema is the one current when the build completes.
    #[test]
    fn reload_during_build_reaches_stored_schema() {
        let fixture = Fixture::new(POINT);
        let db = fixture.manager.create("points", None).expect("create");
        let repo = db.repo().clone();
        fixture.manager.ingest_paths(&repo, &[fixture.file("points.json", FACTS)]).expect("ingest");
        fixture.reload(POINT_V2);
        fixture.manager.finalize(&repo).expect("finalize");

        let stored = fixture.manager.schema(&repo, SchemaMode::Stored).expect("schema");
        assert!(stored.resolve("shape.Point", Some(2)).is_ok());
        fixture
            .manager
            .compile(&repo, "shape.Point.2 _", SchemaMode::Stored)
            .expect("compiles against stored schema");
        let points = keys(&fixture, &repo, "shape.Point.1 _", &options(SchemaMode::Stored));
        assert_eq!(points, vec![json!({"x": 1, "y": 2})]);
    }

    /// T4.1c: A reload that redefines a predicate with facts cannot complete
    /// the build.
    #[test]
    fn reload_changing_built_predicate_is_rejected() {
        let fixture = Fixture::new(POINT);
        let db = fixture.manager.create("points", None).expect("create");
        let repo = db.repo().clone();
        fixture.manager.ingest_paths(&repo, &[fixture.file("points.json", FACTS)]).expect("ingest");
        fixture.reload(POINT_LABELLED);
        assert!(matches!(fixture.manager.finalize(&repo), Err(FactDbError::TypeError(_))));
        assert_eq!(db.state(), StoreState::Building);
    }

    /// T4.2: Facts of an older version read through a newer one get the zero
    /// value of each added field.
    #[test]
    fn older_version_backfilled() {
        let fixture = Fixture::new(POINT);
        let repo = fixture.load("points", FACTS);
        fixture.reload(POINT_V2);

        let current = keys(&fixture, &repo, "shape.Point _", &options(SchemaMode::Current));
        assert_eq!(current, vec![json!({"x": 1, "y": 2, "z": 0})]);
        let matched = keys(&fixture, &repo, "shape.Point { z = 0 }", &options(SchemaMode::Current));
        assert_eq!(matched.len(), 1);
        let stored = keys(&fixture, &repo, "shape.Point _", &options(SchemaMode::Stored));
        assert_eq!(stored, vec![json!({"x": 1, "y": 2})]);
    }

    /// T4.3: A query compiled before a reload keeps its meaning.
    #[test]
    fn compiled_query_is_isolated_from_reload() {
        let fixture = Fixture::new(POINT);
        let repo = fixture.load("points", FACTS);
        let query = fixture
            .manager
            .compile(&repo, "shape.Point _", SchemaMode::Current)
            .expect("compile");
        fixture.reload(POINT_LABELLED);

        let db = fixture.manager.open(&repo).expect("open");
        let results = db.execute(&query, &QueryOptions::default()).expect("execute");
        assert_eq!(results.bindings[0].json["key"], json!({"x": 1, "y": 2}));
    }
}
