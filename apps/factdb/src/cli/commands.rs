//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands. Each
//! command prints plain text, or a JSON document in `--json-mode`.

use crate::config::Settings;
use factdb_core::{
    DatabaseManager, DirSchemaSource, FactDbError, FactId, QueryOptions, Repo, SchemaMode,
    SchemaRegistry, Statistics,
};
use serde_json::{Map, Value as Json, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of one fact file (1 GB).
///
/// Fact files are parsed whole before anything is committed.
const MAX_FACT_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), FactDbError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| FactDbError::Io(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(FactDbError::Serialization(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve `path` to an existing regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, FactDbError> {
    let canonical = path.canonicalize().map_err(|e| {
        FactDbError::Io(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(FactDbError::Io(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Validate every fact file before any database is touched.
fn validate_fact_files(files: &[PathBuf]) -> Result<Vec<PathBuf>, FactDbError> {
    files
        .iter()
        .map(|path| {
            let canonical = validate_file_path(path)?;
            validate_file_size(&canonical, MAX_FACT_FILE_SIZE)?;
            Ok(canonical)
        })
        .collect()
}

/// The parent directory of an output file must exist.
fn validate_output_path(path: &Path) -> Result<PathBuf, FactDbError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        FactDbError::Io(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(FactDbError::Io(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| FactDbError::Io("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

// =============================================================================
// OUTPUT
// =============================================================================

/// How results are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    fn print_json(self, value: &Json) {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }

    /// A progress line, suppressed by `--quiet`.
    fn note(self, message: &str) {
        if !self.quiet {
            println!("{message}");
        }
    }
}

fn statistics_json(stats: &Statistics) -> Json {
    let predicates: Map<String, Json> = stats
        .predicates
        .iter()
        .map(|(predicate, s)| (predicate.to_string(), json!({ "count": s.count, "bytes": s.bytes })))
        .collect();
    let total = stats.total();
    json!({
        "predicates": predicates,
        "total": { "count": total.count, "bytes": total.bytes },
    })
}

// =============================================================================
// SETUP
// =============================================================================

/// Open the database root with the schema from the configured directory.
pub fn open_manager(settings: &Settings) -> Result<DatabaseManager, FactDbError> {
    let registry = SchemaRegistry::new()?;
    if let Some(dir) = &settings.schema_dir {
        registry.reload(&DirSchemaSource::new(dir))?;
    }
    DatabaseManager::open_dir(&settings.db_root, Arc::new(registry))
}

// =============================================================================
// CREATE COMMAND
// =============================================================================

/// Create a database, ingest `files` in order, and optionally finalize it.
pub fn cmd_create(
    manager: &DatabaseManager,
    out: Output,
    name: &str,
    hash: Option<&str>,
    files: &[PathBuf],
    finalize: bool,
) -> Result<(), FactDbError> {
    let paths = validate_fact_files(files)?;
    let db = manager.create(name, hash)?;
    let repo = db.repo().clone();
    out.note(&format!("Created {repo}"));

    let added = manager.ingest_paths(&repo, &paths)?;
    if finalize {
        manager.finalize(&repo)?;
    }

    let info = db.info();
    if out.json {
        out.print_json(&json!({
            "db": repo.to_string(),
            "state": info.state.to_string(),
            "files": paths.len(),
            "facts_added": added,
        }));
        return Ok(());
    }

    println!("{info}");
    Ok(())
}

// =============================================================================
// LOAD COMMAND
// =============================================================================

/// Build a complete database from `files` in one step.
pub fn cmd_load(
    manager: &DatabaseManager,
    out: Output,
    repo: Option<Repo>,
    files: &[PathBuf],
) -> Result<(), FactDbError> {
    let paths = validate_fact_files(files)?;
    let started = Instant::now();
    let db = manager.load(repo, &paths)?;
    let info = db.info();

    if out.json {
        out.print_json(&json!({
            "db": info.repo.to_string(),
            "state": info.state.to_string(),
            "files": paths.len(),
            "facts": info.facts,
        }));
        return Ok(());
    }

    println!("{info}");
    out.note(&format!(
        "Loaded {} file(s) in {} ms",
        paths.len(),
        started.elapsed().as_millis()
    ));
    Ok(())
}

// =============================================================================
// QUERY COMMAND
// =============================================================================

/// Compile and run a query.
pub fn cmd_query(
    manager: &DatabaseManager,
    out: Output,
    repo: &Repo,
    text: &str,
    options: &QueryOptions,
    debug: bool,
) -> Result<(), FactDbError> {
    let started = Instant::now();
    let query = manager.compile(repo, text, options.mode)?;
    if debug && !out.json {
        print!("{}", query.ir());
        print!("{}", query.bytecode());
    }
    let results = manager.open(repo)?.execute(&query, options)?;
    let elapsed_ms = started.elapsed().as_millis();

    if out.json {
        let mut doc = json!({
            "results": results.bindings.iter().map(|b| b.json.clone()).collect::<Vec<_>>(),
            "truncated": results.truncated,
            "facts_searched": results.facts_searched,
            "elapsed_ms": elapsed_ms as u64,
        });
        if let Some(profile) = &results.profile {
            let searched: Map<String, Json> = profile
                .facts_searched
                .iter()
                .map(|(predicate, n)| (predicate.to_string(), json!(n)))
                .collect();
            doc["profile"] = Json::Object(searched);
        }
        if debug {
            doc["ir"] = json!(query.ir().to_string());
            doc["bytecode"] = json!(query.bytecode().to_string());
        }
        out.print_json(&doc);
        return Ok(());
    }

    for binding in &results.bindings {
        println!("{}", serde_json::to_string(&binding.json).unwrap_or_default());
    }
    println!();
    println!(
        "{} results, {} facts searched, {} ms",
        results.bindings.len(),
        results.facts_searched,
        elapsed_ms
    );
    if results.truncated {
        println!(
            "results truncated at {}, use --limit to see more",
            options.limit.unwrap_or_default()
        );
    }
    if let Some(profile) = &results.profile {
        println!("facts searched:");
        println!("{profile}");
    }
    Ok(())
}

// =============================================================================
// STAT COMMAND
// =============================================================================

/// Show per-predicate statistics.
pub fn cmd_stat(manager: &DatabaseManager, out: Output, repo: &Repo) -> Result<(), FactDbError> {
    let stats = manager.statistics(repo)?;

    if out.json {
        let mut doc = statistics_json(&stats);
        doc["db"] = json!(repo.to_string());
        out.print_json(&doc);
        return Ok(());
    }

    println!("{stats}");
    Ok(())
}

// =============================================================================
// LIST COMMAND
// =============================================================================

/// List databases, optionally filtered.
pub fn cmd_list(manager: &DatabaseManager, out: Output, filter: Option<&str>) -> Result<(), FactDbError> {
    let dbs = manager.list(filter);

    if out.json {
        let entries: Vec<Json> = dbs
            .iter()
            .map(|info| {
                json!({
                    "db": info.repo.to_string(),
                    "state": info.state.to_string(),
                    "facts": info.facts,
                })
            })
            .collect();
        out.print_json(&Json::Array(entries));
        return Ok(());
    }

    if dbs.is_empty() {
        out.note("No databases");
    }
    for info in dbs {
        println!("{info}");
    }
    Ok(())
}

// =============================================================================
// SCHEMA COMMAND
// =============================================================================

/// Show predicate definitions from the live schema, or from the schema a
/// database was built with.
pub fn cmd_schema(
    manager: &DatabaseManager,
    out: Output,
    prefix: Option<&str>,
    repo: Option<&Repo>,
    names_only: bool,
) -> Result<(), FactDbError> {
    let schema = match repo {
        Some(repo) => manager.schema(repo, SchemaMode::Stored)?,
        None => manager.registry().snapshot(),
    };
    let predicates = match prefix {
        Some(prefix) => {
            let found = schema.predicates_with_prefix(prefix);
            if found.is_empty() {
                return Err(FactDbError::UnknownPredicate(prefix.to_string()));
            }
            found
        }
        None => schema.predicates().map(|def| def.predicate.clone()).collect(),
    };

    if out.json {
        let entries: Vec<Json> = predicates
            .iter()
            .map(|predicate| match (names_only, schema.get(predicate)) {
                (false, Some(def)) => json!({
                    "predicate": predicate.to_string(),
                    "definition": def.to_string(),
                    "derived": def.is_derived(),
                }),
                _ => json!(predicate.to_string()),
            })
            .collect();
        out.print_json(&Json::Array(entries));
        return Ok(());
    }

    for predicate in &predicates {
        match schema.get(predicate) {
            Some(def) if !names_only => println!("{def}"),
            _ => println!("{predicate}"),
        }
    }
    Ok(())
}

// =============================================================================
// DUMP COMMAND
// =============================================================================

/// Write every fact of a complete database as a fact file.
pub fn cmd_dump(
    manager: &DatabaseManager,
    out: Output,
    repo: &Repo,
    output: Option<&Path>,
) -> Result<(), FactDbError> {
    let groups = manager.dump(repo)?;
    let text = serde_json::to_string_pretty(&groups).map_err(|e| FactDbError::Serialization(e.to_string()))?;

    match output {
        Some(path) => {
            let path = validate_output_path(path)?;
            std::fs::write(&path, text).map_err(|e| FactDbError::Io(format!("{}: {e}", path.display())))?;
            if out.json {
                out.print_json(&json!({
                    "db": repo.to_string(),
                    "output": path.to_string_lossy(),
                    "predicates": groups.len(),
                }));
            } else {
                out.note(&format!("Dumped {repo} to {}", path.display()));
            }
        }
        None => println!("{text}"),
    }
    Ok(())
}

// =============================================================================
// OWNER COMMAND
// =============================================================================

/// Show the root facts owning a fact.
pub fn cmd_owner(manager: &DatabaseManager, out: Output, repo: &Repo, id: u64) -> Result<(), FactDbError> {
    let id = FactId(id);
    let ownership = manager.ownership(repo)?;
    let owners = ownership
        .owners(id)
        .ok_or_else(|| FactDbError::NotFound(format!("fact {id} in {repo}")))?;

    if out.json {
        out.print_json(&json!({
            "id": id.0,
            "owners": owners.iter().map(|o| o.0).collect::<Vec<_>>(),
        }));
        return Ok(());
    }

    if let Some(described) = ownership.describe(id) {
        println!("{described}");
    }
    Ok(())
}
