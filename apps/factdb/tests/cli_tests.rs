//! End-to-end tests of the command-line front end against on-disk
//! databases.

use clap::Parser;
use factdb::cli::{Cli, Commands, execute};
use factdb_core::{DatabaseManager, ExpandPolicy, FactDbError, Repo, SchemaMode, SchemaRegistry, StoreState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const SCHEMA: &str = r#"
schema cli.1 {
  predicate Name : string
  predicate Ref : { name : Name, line : nat }
}
"#;

const FACTS: &str = r#"[
  { "predicate": "cli.Name", "facts": [ { "id": 1, "key": "alpha" }, { "id": 2, "key": "beta" } ] },
  { "predicate": "cli.Ref",
    "facts": [ { "key": { "name": 1, "line": 3 } }, { "key": { "name": 2, "line": 9 } } ] }
]"#;

/// A workspace with a schema directory, a database root and a fact file.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("schema")).expect("mkdir");
        std::fs::write(dir.path().join("schema/cli.angle"), SCHEMA).expect("write schema");
        std::fs::write(dir.path().join("refs.json"), FACTS).expect("write facts");
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Run `factdb <args>` with the workspace's roots.
    fn run(&self, args: &[&str]) -> Result<(), FactDbError> {
        let root = self.path("db");
        let schema = self.path("schema");
        let mut argv = vec![
            "factdb".to_string(),
            "--quiet".to_string(),
            "--db-root".to_string(),
            root.display().to_string(),
            "--schema-dir".to_string(),
            schema.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        execute(Cli::try_parse_from(argv).expect("arguments"))
    }

    fn manager(&self) -> DatabaseManager {
        let registry = Arc::new(SchemaRegistry::new().expect("registry"));
        DatabaseManager::open_dir(self.path("db"), registry).expect("manager")
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

// =============================================================================
// ARGUMENT PARSING
// =============================================================================

#[test]
#[allow(clippy::panic)]
fn query_flags_parse_into_engine_types() {
    let cli = Cli::try_parse_from([
        "factdb",
        "query",
        "refs/0",
        "cli.Ref _",
        "--limit",
        "5",
        "--expand",
        "except:cli.Name",
        "--schema-mode",
        "stored",
        "--profile",
    ])
    .expect("parse");
    match cli.command {
        Some(Commands::Query {
            db,
            limit,
            expand,
            schema_mode,
            profile,
            debug,
            ..
        }) => {
            assert_eq!(db, Repo::new("refs", "0"));
            assert_eq!(limit, Some(5));
            assert_eq!(expand.map(|e| e.to_string()), Some("except:cli.Name".to_string()));
            assert_eq!(schema_mode, Some(SchemaMode::Stored));
            assert!(profile);
            assert!(!debug);
        }
        other => panic!("expected query, got {other:?}"),
    }
}

#[test]
fn bad_arguments_are_rejected() {
    assert!(Cli::try_parse_from(["factdb", "query", "no-hash", "cli.Ref _"]).is_err());
    assert!(Cli::try_parse_from(["factdb", "query", "a/0", "q", "--schema-mode", "latest"]).is_err());
    assert!(Cli::try_parse_from(["factdb", "load"]).is_err());
    let cli = Cli::try_parse_from(["factdb", "query", "a/0", "q", "--expand", "off"]).expect("parse");
    assert!(matches!(
        cli.command,
        Some(Commands::Query { expand: Some(ExpandPolicy::Off), .. })
    ));
}

// =============================================================================
// COMMANDS
// =============================================================================

#[test]
fn load_then_inspect() {
    let ws = Workspace::new();
    let facts = path_arg(&ws.path("refs.json"));
    ws.run(&["load", &facts]).expect("load");

    let info = ws.manager().list(Some("refs"));
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].repo, Repo::new("refs", "0"));
    assert_eq!(info[0].state, StoreState::Complete);
    assert_eq!(info[0].facts, 4);

    ws.run(&["list"]).expect("list");
    ws.run(&["stat", "refs/0"]).expect("stat");
    ws.run(&["--json-mode", "query", "refs/0", "cli.Ref { line = 3 }", "--debug", "--profile"])
        .expect("query");
    ws.run(&["query", "refs/0", "cli.Name \"al\".."]).expect("prefix query");
    ws.run(&["owner", "refs/0", "1024"]).expect("owner");
    ws.run(&["schema", "cli.R"]).expect("schema");
    ws.run(&["schema", "--db", "refs/0", "--names"]).expect("stored schema");
}

#[test]
fn failures_are_reported() {
    let ws = Workspace::new();
    let facts = path_arg(&ws.path("refs.json"));
    ws.run(&["load", "--db", "refs/1", &facts]).expect("load");

    assert!(matches!(ws.run(&["load", "--db", "refs/1", &facts]), Err(FactDbError::AlreadyExists(_))));
    assert!(matches!(ws.run(&["stat", "none/0"]), Err(FactDbError::UnknownDatabase(_))));
    assert!(matches!(ws.run(&["owner", "refs/1", "9999"]), Err(FactDbError::NotFound(_))));
    assert!(matches!(ws.run(&["schema", "nope."]), Err(FactDbError::UnknownPredicate(_))));
    assert!(ws.run(&["query", "refs/1", "cli.Ref { nope = 1 }"]).is_err());
    assert!(ws.run(&["load", &path_arg(&ws.path("missing.json"))]).is_err());
}

#[test]
fn create_without_finalize_cannot_be_dumped() {
    let ws = Workspace::new();
    let facts = path_arg(&ws.path("refs.json"));
    ws.run(&["create", "partial", "--no-finalize", &facts]).expect("create");
    assert!(matches!(ws.run(&["dump", "partial/0"]), Err(FactDbError::Incomplete(_))));

    ws.run(&["create", "whole", &facts]).expect("create");
    let out = ws.path("whole.json");
    ws.run(&["dump", "whole/0", "--output", &path_arg(&out)]).expect("dump");

    // the dump loads into an identical database
    ws.run(&["load", "--db", "copy/0", &path_arg(&out)]).expect("reload dump");
    let manager = ws.manager();
    let copy = manager.statistics(&Repo::new("copy", "0")).expect("stats");
    let whole = manager.statistics(&Repo::new("whole", "0")).expect("stats");
    assert_eq!(copy, whole);
}

#[test]
fn config_file_supplies_roots() {
    let ws = Workspace::new();
    let config = ws.path("factdb.toml");
    std::fs::write(
        &config,
        format!(
            "db_root = {:?}\nschema_dir = {:?}\n\n[query]\nlimit = 1\nexpand = \"off\"\n",
            path_arg(&ws.path("db")),
            path_arg(&ws.path("schema")),
        ),
    )
    .expect("write config");

    let facts = path_arg(&ws.path("refs.json"));
    let run = |args: &[&str]| {
        let mut argv = vec!["factdb", "--quiet", "--config", config.to_str().expect("utf-8 path")];
        argv.extend_from_slice(args);
        execute(Cli::try_parse_from(argv).expect("arguments"))
    };
    run(&["load", &facts]).expect("load");
    run(&["query", "refs/0", "cli.Ref _"]).expect("query");
    assert_eq!(ws.manager().list(None).len(), 1);
}
