//! The registry of databases and the operations on them.

use super::{Database, DatabaseInfo, Repo, check_component};
use crate::ingestor::{FactFile, FactGroup, read_fact_file};
use crate::ownership::Ownership;
use crate::primitives::DATABASE_FILE_NAME;
use crate::query::{CompiledQuery, QueryOptions, QueryResults, SchemaMode, compile};
use crate::schema::{Schema, SchemaRegistry};
use crate::store::{FactStore, MemoryStore, RedbStore, StoreState};
use crate::system::Statistics;
use crate::FactDbError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Owns every known database and the live schema registry.
///
/// With a root directory each database lives in
/// `<root>/<name>/<hash>/facts.redb`; without one databases are in memory.
#[derive(Debug)]
pub struct DatabaseManager {
    root: Option<PathBuf>,
    registry: Arc<SchemaRegistry>,
    dbs: RwLock<BTreeMap<Repo, Arc<Database>>>,
}

impl DatabaseManager {
    /// A manager keeping databases in memory.
    #[must_use]
    pub fn in_memory(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            root: None,
            registry,
            dbs: RwLock::new(BTreeMap::new()),
        }
    }

    /// A manager keeping databases under `root`, reattaching every database
    /// already there.
    pub fn open_dir(root: impl Into<PathBuf>, registry: Arc<SchemaRegistry>) -> Result<Self, FactDbError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| io(&root, e))?;

        let mut dbs = BTreeMap::new();
        for (repo, path) in discover(&root)? {
            let store = RedbStore::open(&path)?;
            let db = Database::reopen(repo.clone(), Box::new(store), Arc::clone(&registry))?;
            dbs.insert(repo, Arc::new(db));
        }
        tracing::info!(root = %root.display(), databases = dbs.len(), "database root opened");

        Ok(Self {
            root: Some(root),
            registry,
            dbs: RwLock::new(dbs),
        })
    }

    /// The live schema registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    fn dir(&self, repo: &Repo) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(&repo.name).join(&repo.hash))
    }

    /// The first unused hash of `name`: `0`, `1`, ...
    fn fresh_hash(dbs: &BTreeMap<Repo, Arc<Database>>, name: &str) -> String {
        (0u64..)
            .map(|n| n.to_string())
            .find(|hash| !dbs.contains_key(&Repo::new(name, hash.as_str())))
            .unwrap_or_default()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Create a building database, pinning the current schema. Without a hash
    /// the first free one is assigned.
    pub fn create(&self, name: &str, hash: Option<&str>) -> Result<Arc<Database>, FactDbError> {
        check_component("name", name)?;
        let mut dbs = self.dbs.write();
        let repo = match hash {
            Some(hash) => {
                check_component("hash", hash)?;
                Repo::new(name, hash)
            }
            None => Repo::new(name, Self::fresh_hash(&dbs, name)),
        };
        if let Some(existing) = dbs.get(&repo) {
            return Err(FactDbError::AlreadyExists(format!("{repo} ({})", existing.state())));
        }

        let store: Box<dyn FactStore> = match self.dir(&repo) {
            Some(dir) => {
                std::fs::create_dir_all(&dir).map_err(|e| io(&dir, e))?;
                Box::new(RedbStore::open(dir.join(DATABASE_FILE_NAME))?)
            }
            None => Box::new(MemoryStore::new()),
        };
        let db = Arc::new(Database::create(repo.clone(), store, Arc::clone(&self.registry))?);
        dbs.insert(repo.clone(), Arc::clone(&db));
        tracing::info!(%repo, "database created");
        Ok(db)
    }

    pub fn open(&self, repo: &Repo) -> Result<Arc<Database>, FactDbError> {
        self.dbs
            .read()
            .get(repo)
            .cloned()
            .ok_or_else(|| FactDbError::UnknownDatabase(repo.to_string()))
    }

    /// Ingest files in order, each one atomically. A failing file marks the
    /// database incomplete; files before it stay committed.
    pub fn ingest(&self, repo: &Repo, files: &[FactFile]) -> Result<u64, FactDbError> {
        let db = self.open(repo)?;
        let mut added = 0u64;
        for file in files {
            added = added.saturating_add(db.ingest(file)?);
        }
        Ok(added)
    }

    /// Read and ingest fact files from disk. A file that fails to parse marks
    /// the database incomplete, like any other ingestion failure.
    pub fn ingest_paths(&self, repo: &Repo, paths: &[PathBuf]) -> Result<u64, FactDbError> {
        let db = self.open(repo)?;
        let mut added = 0u64;
        for path in paths {
            let file = match read_fact_file(path) {
                Ok(file) => file,
                Err(e) => {
                    if let Err(abandon) = db.abandon() {
                        tracing::debug!(%repo, error = %abandon, "abandon after parse failure");
                    }
                    return Err(e);
                }
            };
            added = added.saturating_add(db.ingest(&file)?);
        }
        Ok(added)
    }

    pub fn finalize(&self, repo: &Repo) -> Result<(), FactDbError> {
        self.open(repo)?.finalize()
    }

    pub fn abandon(&self, repo: &Repo) -> Result<(), FactDbError> {
        self.open(repo)?.abandon()
    }

    /// Create, fill and finalize a database from fact files in one step.
    ///
    /// Every file is read and parsed before anything is created, so a file
    /// that does not parse leaves no database behind. Once created, a
    /// failure while ingesting or finalizing leaves the database listed as
    /// incomplete with the files before the failing one committed. The
    /// identity defaults to the first file's stem with a fresh hash.
    pub fn load(&self, repo: Option<Repo>, paths: &[PathBuf]) -> Result<Arc<Database>, FactDbError> {
        let files = paths
            .iter()
            .map(|path| read_fact_file(path))
            .collect::<Result<Vec<_>, _>>()?;

        let db = match repo {
            Some(repo) => self.create(&repo.name, Some(&repo.hash))?,
            None => {
                let name = paths
                    .first()
                    .and_then(|p| p.file_stem())
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| FactDbError::type_error("load needs at least one named file"))?;
                self.create(name, None)?
            }
        };
        let repo = db.repo().clone();

        let outcome = files
            .iter()
            .try_for_each(|file| db.ingest(file).map(drop))
            .and_then(|()| db.finalize());
        if let Err(e) = outcome {
            if db.state() == StoreState::Building {
                if let Err(abandon) = db.abandon() {
                    tracing::debug!(%repo, error = %abandon, "abandon after failed load");
                }
            }
            tracing::warn!(%repo, error = %e, "load failed, database left incomplete");
            return Err(e);
        }
        tracing::info!(%repo, files = files.len(), "database loaded");
        Ok(db)
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Known databases, optionally filtered by name prefix or exact
    /// `name/hash`.
    pub fn list(&self, filter: Option<&str>) -> Vec<DatabaseInfo> {
        self.dbs
            .read()
            .values()
            .filter(|db| filter.is_none_or(|f| db.repo().matches(f)))
            .map(|db| db.info())
            .collect()
    }

    pub fn statistics(&self, repo: &Repo) -> Result<Statistics, FactDbError> {
        Ok(self.open(repo)?.statistics())
    }

    /// The schema queries in `mode` are compiled against.
    pub fn schema(&self, repo: &Repo, mode: SchemaMode) -> Result<Arc<Schema>, FactDbError> {
        match mode {
            SchemaMode::Stored => Ok(self.open(repo)?.stored_schema()),
            SchemaMode::Current => {
                self.open(repo)?;
                Ok(self.registry.snapshot())
            }
        }
    }

    pub fn dump(&self, repo: &Repo) -> Result<Vec<FactGroup>, FactDbError> {
        self.open(repo)?.dump()
    }

    pub fn ownership(&self, repo: &Repo) -> Result<Ownership, FactDbError> {
        self.open(repo)?.ownership()
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Compile `text` for `repo` in `mode`, pinning the schema snapshot.
    pub fn compile(&self, repo: &Repo, text: &str, mode: SchemaMode) -> Result<CompiledQuery, FactDbError> {
        compile(text, self.schema(repo, mode)?, mode)
    }

    /// Compile and run `text`.
    pub fn query(&self, repo: &Repo, text: &str, options: &QueryOptions) -> Result<QueryResults, FactDbError> {
        let query = self.compile(repo, text, options.mode)?;
        self.open(repo)?.execute(&query, options)
    }
}

fn io(path: &Path, e: std::io::Error) -> FactDbError {
    FactDbError::Io(format!("{}: {e}", path.display()))
}

/// Every `<root>/<name>/<hash>/facts.redb`, in repo order.
fn discover(root: &Path) -> Result<Vec<(Repo, PathBuf)>, FactDbError> {
    let mut found = Vec::new();
    for name in std::fs::read_dir(root).map_err(|e| io(root, e))? {
        let name = name.map_err(|e| io(root, e))?.path();
        if !name.is_dir() {
            continue;
        }
        for hash in std::fs::read_dir(&name).map_err(|e| io(&name, e))? {
            let dir = hash.map_err(|e| io(&name, e))?.path();
            let file = dir.join(DATABASE_FILE_NAME);
            let repo = match (name.file_name().and_then(|s| s.to_str()), dir.file_name().and_then(|s| s.to_str())) {
                (Some(n), Some(h)) if file.is_file() => Repo::new(n, h),
                _ => continue,
            };
            found.push((repo, file));
        }
    }
    found.sort();
    Ok(found)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestor::parse_fact_file;
    use tempfile::tempdir;

    fn manager() -> DatabaseManager {
        DatabaseManager::in_memory(Arc::new(SchemaRegistry::new().expect("registry")))
    }

    fn blobs(name: &str, items: &[&str]) -> FactFile {
        let facts: Vec<String> = items.iter().map(|s| format!(r#"{{"key": "{s}"}}"#)).collect();
        let text = format!(r#"[{{"predicate": "sys.Blob", "facts": [{}]}}]"#, facts.join(","));
        parse_fact_file(name, &text).expect("parse")
    }

    #[test]
    fn lifecycle() {
        let manager = manager();
        let db = manager.create("test", None).expect("create");
        assert_eq!(db.repo(), &Repo::new("test", "0"));
        assert_eq!(db.state(), StoreState::Building);

        assert_eq!(manager.ingest(db.repo(), &[blobs("a", &["x", "y"])]).expect("ingest"), 2);
        manager.finalize(db.repo()).expect("finalize");
        assert_eq!(db.state(), StoreState::Complete);
        assert!(matches!(
            manager.ingest(db.repo(), &[blobs("b", &["z"])]),
            Err(FactDbError::StoreSealed)
        ));
        assert!(matches!(manager.finalize(db.repo()), Err(FactDbError::StoreSealed)));

        let second = manager.create("test", None).expect("create");
        assert_eq!(second.repo().hash, "1");
    }

    #[test]
    fn create_rejects_any_existing_identity() {
        let manager = manager();
        manager.create("test", Some("0")).expect("create");
        manager.abandon(&Repo::new("test", "0")).expect("abandon");
        assert!(matches!(
            manager.create("test", Some("0")),
            Err(FactDbError::AlreadyExists(_))
        ));
    }

    #[test]
    fn failed_file_keeps_earlier_files_and_marks_incomplete() {
        let manager = manager();
        let repo = manager.create("test", None).expect("create").repo().clone();
        let bad = parse_fact_file("bad", r#"[{"predicate": "sys.Blob", "facts": [{"key": 3}]}]"#).expect("parse");
        let err = manager
            .ingest(&repo, &[blobs("good", &["x"]), bad, blobs("later", &["y"])])
            .expect_err("bad file");
        assert!(matches!(err, FactDbError::IngestionParseFailure { ref file, .. } if file == "bad"));
        assert_eq!(manager.statistics(&repo).expect("stats").total().count, 1);
        assert_eq!(manager.open(&repo).expect("open").state(), StoreState::Incomplete);
    }

    #[test]
    fn open_unknown_database() {
        assert!(matches!(
            manager().open(&Repo::new("nope", "0")),
            Err(FactDbError::UnknownDatabase(_))
        ));
    }

    #[test]
    fn list_filters() {
        let manager = manager();
        manager.create("alpha", None).expect("create");
        manager.create("alpha", None).expect("create");
        manager.create("beta", None).expect("create");
        assert_eq!(manager.list(None).len(), 3);
        assert_eq!(manager.list(Some("al")).len(), 2);
        let exact = manager.list(Some("alpha/1"));
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].repo, Repo::new("alpha", "1"));
    }

    #[test]
    fn unparsable_load_creates_nothing() {
        let dir = tempdir().expect("tempdir");
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, r#"[{"predicate": "sys.Blob", "facts": [{"key": "x"}]}]"#).expect("write");
        std::fs::write(&bad, "[{").expect("write");

        let manager = manager();
        let err = manager
            .load(Some(Repo::new("t", "0")), &[good.clone(), bad])
            .expect_err("bad file");
        assert!(matches!(err, FactDbError::IngestionParseFailure { .. }));
        assert!(matches!(manager.open(&Repo::new("t", "0")), Err(FactDbError::UnknownDatabase(_))));

        let db = manager.load(None, &[good.clone()]).expect("load");
        assert_eq!(db.repo(), &Repo::new("good", "0"));
        assert_eq!(db.state(), StoreState::Complete);
        assert!(matches!(
            manager.load(Some(Repo::new("good", "0")), &[good]),
            Err(FactDbError::AlreadyExists(_))
        ));
    }

    #[test]
    fn ill_typed_load_is_listed_incomplete() {
        let dir = tempdir().expect("tempdir");
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, r#"[{"predicate": "sys.Blob", "facts": [{"key": "x"}]}]"#).expect("write");
        std::fs::write(&bad, r#"[{"predicate": "sys.Blob", "facts": [{"key": 7}]}]"#).expect("write");

        let manager = DatabaseManager::open_dir(dir.path().join("db"), Arc::new(SchemaRegistry::new().expect("registry")))
            .expect("open");
        let repo = Repo::new("error", "0");
        let err = manager.load(Some(repo.clone()), &[good, bad]).expect_err("ill-typed file");
        assert!(matches!(err, FactDbError::IngestionParseFailure { .. }));

        let listed = manager.list(Some("error/0"));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, StoreState::Incomplete);
        assert_eq!(listed[0].facts, 1);
        assert_eq!(listed[0].to_string(), "error/0 (incomplete, 1 facts)");
        assert!(matches!(manager.dump(&repo), Err(FactDbError::Incomplete(_))));
    }

    #[test]
    fn finalize_freezes_the_schema_current_at_completion() {
        let registry = Arc::new(SchemaRegistry::new().expect("registry"));
        let manager = DatabaseManager::in_memory(Arc::clone(&registry));
        let db = manager.create("test", None).expect("create");
        db.ingest(&blobs("a", &["x"])).expect("ingest");

        let decls = crate::schema::parse_schema("schema late.1 { predicate Tag : string }").expect("parse");
        registry.register(decls).expect("register");
        let tags = parse_fact_file("tags", r#"[{"predicate": "late.Tag", "facts": [{"key": "t"}]}]"#).expect("parse");
        db.ingest(&tags).expect("ingest under reloaded schema");
        db.finalize().expect("finalize");

        assert!(db.stored_schema().resolve("late.Tag", Some(1)).is_ok());
        let results = manager
            .query(
                db.repo(),
                "late.Tag _",
                &QueryOptions { mode: SchemaMode::Stored, ..QueryOptions::default() },
            )
            .expect("stored-mode query");
        assert_eq!(results.bindings.len(), 1);
    }

    #[test]
    fn databases_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let registry = Arc::new(SchemaRegistry::new().expect("registry"));
        {
            let manager = DatabaseManager::open_dir(dir.path(), Arc::clone(&registry)).expect("open");
            let db = manager.create("kept", None).expect("create");
            db.ingest(&blobs("a", &["x", "y"])).expect("ingest");
            db.finalize().expect("finalize");
            let unfinished = manager.create("unfinished", None).expect("create");
            unfinished.ingest(&blobs("a", &["z"])).expect("ingest");
        }

        let manager = DatabaseManager::open_dir(dir.path(), registry).expect("reopen");
        let kept = manager.open(&Repo::new("kept", "0")).expect("kept");
        assert_eq!(kept.state(), StoreState::Complete);
        assert_eq!(kept.statistics().total().count, 2);
        let results = manager
            .query(kept.repo(), r#"sys.Blob "y""#, &QueryOptions::default())
            .expect("query");
        assert_eq!(results.bindings.len(), 1);
        assert_eq!(
            manager.open(&Repo::new("unfinished", "0")).expect("unfinished").state(),
            StoreState::Incomplete
        );
    }
}
