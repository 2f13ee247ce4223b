//! One database: a fact store plus the schema it was built with.

use super::{DatabaseInfo, Repo};
use crate::export::dump;
use crate::formats::{schema_from_bytes, schema_to_bytes};
use crate::ingestor::{FactFile, FactGroup, Ingestor};
use crate::ownership::Ownership;
use crate::query::{CompiledQuery, QueryOptions, QueryResults, execute};
use crate::schema::{Schema, SchemaRegistry};
use crate::store::{FactStore, StoreState};
use crate::system::Statistics;
use crate::{Fact, FactDbError, FactId};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A database handle.
///
/// The store sits behind a lock: ingestion takes it for writing, queries and
/// inspection for reading. Once complete the store never changes, so readers
/// never wait.
///
/// While building, facts are checked against the live registry and the
/// stored schema follows it; `finalize` freezes the snapshot current at
/// completion. Locks are always taken store first, then schema.
pub struct Database {
    repo: Repo,
    store: RwLock<Box<dyn FactStore>>,
    stored: RwLock<Arc<Schema>>,
    registry: Arc<SchemaRegistry>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("repo", &self.repo)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Start a new database in `store`, following `registry` until finalized.
    pub(crate) fn create(
        repo: Repo,
        mut store: Box<dyn FactStore>,
        registry: Arc<SchemaRegistry>,
    ) -> Result<Self, FactDbError> {
        let schema = registry.snapshot();
        store.save_schema(&schema_to_bytes(&schema)?)?;
        store.set_state(StoreState::Building)?;
        Ok(Self {
            repo,
            store: RwLock::new(store),
            stored: RwLock::new(schema),
            registry,
        })
    }

    /// Reattach a database found on disk. A build that never finished is
    /// marked incomplete: builds cannot be resumed.
    pub(crate) fn reopen(
        repo: Repo,
        mut store: Box<dyn FactStore>,
        registry: Arc<SchemaRegistry>,
    ) -> Result<Self, FactDbError> {
        let bytes = store
            .load_schema()?
            .ok_or_else(|| FactDbError::Serialization(format!("{repo}: no stored schema")))?;
        let stored = Arc::new(schema_from_bytes(&bytes)?);
        if store.state() == StoreState::Building {
            tracing::warn!(%repo, "unfinished build found, marking incomplete");
            store.set_state(StoreState::Incomplete)?;
        }
        Ok(Self {
            repo,
            store: RwLock::new(store),
            stored: RwLock::new(stored),
            registry,
        })
    }

    #[must_use]
    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn state(&self) -> StoreState {
        self.store.read().state()
    }

    pub fn info(&self) -> DatabaseInfo {
        let store = self.store.read();
        DatabaseInfo {
            repo: self.repo.clone(),
            state: store.state(),
            facts: store.statistics().total().count,
        }
    }

    /// The schema the database was built with; the build's current
    /// snapshot until it completes.
    pub fn stored_schema(&self) -> Arc<Schema> {
        Arc::clone(&self.stored.read())
    }

    pub fn statistics(&self) -> Statistics {
        self.store.read().statistics()
    }

    pub fn lookup(&self, id: FactId) -> Result<Option<Fact>, FactDbError> {
        self.store.read().lookup(id)
    }

    fn check_building(store: &dyn FactStore) -> Result<(), FactDbError> {
        match store.state() {
            StoreState::Building => Ok(()),
            StoreState::Complete => Err(FactDbError::StoreSealed),
            StoreState::Incomplete => Err(FactDbError::Incomplete("build was abandoned".into())),
        }
    }

    /// Move the build onto the registry's current snapshot. Every predicate
    /// that already has facts must keep its definition.
    fn follow_registry(&self, store: &dyn FactStore) -> Result<Arc<Schema>, FactDbError> {
        let next = self.registry.snapshot();
        let mut stored = self.stored.write();
        if Arc::ptr_eq(&next, &*stored) {
            return Ok(next);
        }
        for predicate in store.statistics().predicates.keys() {
            let same = match (stored.get(predicate), next.get(predicate)) {
                (Some(old), Some(new)) => old.key_type == new.key_type && old.value_type == new.value_type,
                _ => false,
            };
            if !same {
                return Err(FactDbError::type_error(format!(
                    "{predicate} has facts in {} but changed in the reloaded schema",
                    self.repo
                )));
            }
        }
        *stored = Arc::clone(&next);
        Ok(next)
    }

    /// Commit the facts of one file atomically; returns the number of new
    /// facts. Any failure leaves nothing of the file behind and marks the
    /// database incomplete.
    pub fn ingest(&self, file: &FactFile) -> Result<u64, FactDbError> {
        let mut store = self.store.write();
        Self::check_building(store.as_ref())?;

        let before = store.next_id();
        let staged = self
            .follow_registry(store.as_ref())
            .and_then(|schema| Ingestor::new(&schema).stage(file, store.as_ref()))
            .and_then(|batch| store.commit(batch));
        if let Err(e) = staged {
            tracing::warn!(repo = %self.repo, file = %file.name, error = %e, "ingestion failed");
            store.set_state(StoreState::Incomplete)?;
            return Err(e);
        }

        let added = store.next_id().0.saturating_sub(before.0);
        tracing::info!(repo = %self.repo, file = %file.name, facts = added, "file ingested");
        Ok(added)
    }

    /// Snapshot the registry as the stored schema and seal the store.
    pub fn finalize(&self) -> Result<(), FactDbError> {
        let mut store = self.store.write();
        Self::check_building(store.as_ref())?;
        let schema = self.follow_registry(store.as_ref())?;
        store.save_schema(&schema_to_bytes(&schema)?)?;
        store.mark_complete()?;
        tracing::info!(repo = %self.repo, facts = store.statistics().total().count, "database finalized");
        Ok(())
    }

    /// Give up on a build.
    pub fn abandon(&self) -> Result<(), FactDbError> {
        let mut store = self.store.write();
        Self::check_building(store.as_ref())?;
        store.set_state(StoreState::Incomplete)?;
        tracing::info!(repo = %self.repo, "build abandoned");
        Ok(())
    }

    /// Run a compiled query.
    pub fn execute(&self, query: &CompiledQuery, options: &QueryOptions) -> Result<QueryResults, FactDbError> {
        let store = self.store.read();
        execute(query, store.as_ref(), &self.stored.read(), options)
    }

    /// Every fact, as a re-ingestible fact file. Only complete databases can
    /// be dumped.
    pub fn dump(&self) -> Result<Vec<FactGroup>, FactDbError> {
        let store = self.store.read();
        if store.state() != StoreState::Complete {
            return Err(FactDbError::Incomplete(format!("{} is {}", self.repo, store.state())));
        }
        dump(store.as_ref(), &self.stored.read())
    }

    pub fn ownership(&self) -> Result<Ownership, FactDbError> {
        Ownership::compute(self.store.read().as_ref())
    }
}
