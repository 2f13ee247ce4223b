//! # redb-backed Fact Store
//!
//! A disk-backed fact store using the redb embedded database, providing:
//! - ACID transactions: one write transaction per committed batch
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! ## Tables
//!
//! | Table     | Key            | Value                          |
//! |-----------|----------------|--------------------------------|
//! | `facts`   | fact id        | postcard-encoded [`Fact`]      |
//! | `content` | content digest | fact id                        |
//! | `meta`    | name           | `next_id`, `state`             |
//! | `schema`  | name           | encoded stored schema          |
//!
//! Predicate and key indexes and statistics are kept in memory and rebuilt
//! from `facts` on open.

use super::{Digest, FactBatch, FactIndex, FactStore, IndexEntry, StoreState, check_commit};
use crate::primitives::FIRST_FACT_ID;
use crate::system::Statistics;
use crate::{Fact, FactDbError, FactId, PredicateRef, Value};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;

/// Table for facts: FactId(u64) -> serialized Fact bytes
const FACTS: TableDefinition<u64, &[u8]> = TableDefinition::new("facts");

/// Table for content addressing: digest bytes -> FactId(u64)
const CONTENT: TableDefinition<&[u8], u64> = TableDefinition::new("content");

/// Table for metadata: key string -> value u64
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Table for the stored schema: key string -> encoded snapshot
const SCHEMA: TableDefinition<&str, &[u8]> = TableDefinition::new("schema");

const NEXT_ID: &str = "next_id";
const STATE: &str = "state";
const STORED_SCHEMA: &str = "stored";

fn io(e: impl std::fmt::Display) -> FactDbError {
    FactDbError::Io(e.to_string())
}

/// A disk-backed fact store using redb.
pub struct RedbStore {
    /// The redb database handle.
    db: Database,
    /// In-memory indexes, rebuilt on open.
    index: FactIndex,
    next_id: FactId,
    state: StoreState,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("next_id", &self.next_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a fact store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FactDbError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(io)?;
            let _ = write_txn.open_table(FACTS).map_err(io)?;
            let _ = write_txn.open_table(CONTENT).map_err(io)?;
            let _ = write_txn.open_table(META).map_err(io)?;
            let _ = write_txn.open_table(SCHEMA).map_err(io)?;
            write_txn.commit().map_err(io)?;
        }

        let read_txn = db.begin_read().map_err(io)?;

        let (next_id, state) = {
            let table = read_txn.open_table(META).map_err(io)?;
            let next_id = table
                .get(NEXT_ID)
                .map_err(io)?
                .map(|v| v.value())
                .unwrap_or(FIRST_FACT_ID);
            let state = table
                .get(STATE)
                .map_err(io)?
                .map(|v| StoreState::from_code(v.value()))
                .unwrap_or(StoreState::Building);
            (FactId(next_id), state)
        };

        // Rebuild the in-memory indexes
        let index = {
            let content = read_txn.open_table(CONTENT).map_err(io)?;
            let mut digests = std::collections::BTreeMap::new();
            for entry in content.iter().map_err(io)? {
                let (digest, id) = entry.map_err(io)?;
                let digest: Digest = digest
                    .value()
                    .try_into()
                    .map_err(|_| FactDbError::Serialization("malformed content digest".into()))?;
                digests.insert(id.value(), digest);
            }

            let facts = read_txn.open_table(FACTS).map_err(io)?;
            let mut index = FactIndex::default();
            for entry in facts.iter().map_err(io)? {
                let (id, bytes) = entry.map_err(io)?;
                let fact: Fact = postcard::from_bytes(bytes.value())
                    .map_err(|e| FactDbError::Serialization(e.to_string()))?;
                let digest = match digests.get(&id.value()) {
                    Some(d) => *d,
                    None => super::content_digest(&fact.predicate, &fact.key, &fact.value)?,
                };
                index.add(IndexEntry::new(&fact, digest)?);
            }
            index
        };

        tracing::debug!(path = %path.as_ref().display(), next_id = next_id.0, %state, "opened fact store");

        Ok(Self {
            db,
            index,
            next_id,
            state,
        })
    }

    /// Number of stored facts, read from disk.
    pub fn fact_count(&self) -> Result<u64, FactDbError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(FACTS).map_err(io)?;
        table.len().map_err(io)
    }

    /// Compact the database file.
    pub fn compact(&mut self) -> Result<(), FactDbError> {
        self.db.compact().map_err(io)?;
        Ok(())
    }
}

impl FactStore for RedbStore {
    fn lookup(&self, id: FactId) -> Result<Option<Fact>, FactDbError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(FACTS).map_err(io)?;
        match table.get(id.0).map_err(io)? {
            Some(bytes) => postcard::from_bytes(bytes.value())
                .map(Some)
                .map_err(|e| FactDbError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn find(&self, digest: &Digest) -> Option<FactId> {
        self.index.find(digest)
    }

    fn scan(&self, predicate: &PredicateRef) -> Vec<FactId> {
        self.index.scan(predicate)
    }

    fn seek(&self, predicate: &PredicateRef, key: &Value) -> Result<Vec<FactId>, FactDbError> {
        self.index.seek(predicate, key)
    }

    fn predicates(&self) -> Vec<PredicateRef> {
        self.index.predicates()
    }

    fn next_id(&self) -> FactId {
        self.next_id
    }

    fn state(&self) -> StoreState {
        self.state
    }

    fn set_state(&mut self, state: StoreState) -> Result<(), FactDbError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut meta = write_txn.open_table(META).map_err(io)?;
            meta.insert(STATE, state.code()).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;
        self.state = state;
        Ok(())
    }

    fn statistics(&self) -> Statistics {
        self.index.statistics()
    }

    fn commit(&mut self, batch: FactBatch) -> Result<(), FactDbError> {
        check_commit(&batch, self.next_id, self.state)?;
        if batch.is_empty() {
            return Ok(());
        }
        let (_, facts, digests) = batch.into_parts();

        let mut entries = Vec::with_capacity(facts.len());
        let mut next_id = self.next_id;

        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut facts_table = write_txn.open_table(FACTS).map_err(io)?;
            let mut content_table = write_txn.open_table(CONTENT).map_err(io)?;
            let mut meta_table = write_txn.open_table(META).map_err(io)?;

            for (fact, digest) in facts.iter().zip(digests) {
                let bytes = postcard::to_allocvec(fact).map_err(|e| FactDbError::Serialization(e.to_string()))?;
                facts_table.insert(fact.id.0, bytes.as_slice()).map_err(io)?;
                content_table.insert(digest.as_slice(), fact.id.0).map_err(io)?;
                entries.push(IndexEntry::new(fact, digest)?);
                next_id = fact.id.next();
            }

            meta_table.insert(NEXT_ID, next_id.0).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;

        // Update in-memory state only after a successful commit.
        for entry in entries {
            self.index.add(entry);
        }
        self.next_id = next_id;
        Ok(())
    }

    fn save_schema(&mut self, bytes: &[u8]) -> Result<(), FactDbError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(SCHEMA).map_err(io)?;
            table.insert(STORED_SCHEMA, bytes).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;
        Ok(())
    }

    fn load_schema(&self) -> Result<Option<Vec<u8>>, FactDbError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(SCHEMA).map_err(io)?;
        Ok(table.get(STORED_SCHEMA).map_err(io)?.map(|v| v.value().to_vec()))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn blob() -> PredicateRef {
        PredicateRef::new("sys.Blob", 1)
    }

    #[test]
    fn basic_operations() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("facts.redb")).expect("open db");

        let a = store.insert(blob(), Value::string("a"), Value::unit()).expect("insert");
        let b = store.insert(blob(), Value::string("b"), Value::unit()).expect("insert");
        assert_eq!(a, FactId(1024));
        assert_eq!(b, FactId(1025));
        assert_eq!(store.fact_count().expect("count"), 2);
        assert_eq!(store.get(a).expect("get").key, Value::string("a"));
    }

    #[test]
    fn content_deduplication() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("facts.redb")).expect("open db");

        let a = store.insert(blob(), Value::string("x"), Value::unit()).expect("insert");
        let b = store.insert(blob(), Value::string("x"), Value::unit()).expect("insert");
        assert_eq!(a, b);
        assert_eq!(store.fact_count().expect("count"), 1);
    }

    #[test]
    fn recovery_persistence_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("facts.redb");
        let kv = PredicateRef::new("x.KV", 1);

        // Phase 1: Create data
        let (a, b) = {
            let mut store = RedbStore::open(&path).expect("open db");
            let a = store.insert(kv.clone(), Value::string("k"), Value::Nat(1)).expect("insert");
            let b = store
                .insert(kv.clone(), Value::Record(vec![Value::Fact(a)]), Value::unit())
                .expect("insert");
            store.save_schema(b"schema-bytes").expect("save schema");
            store.mark_complete().expect("complete");
            (a, b)
        };
        // Store dropped here, simulating process exit

        // Phase 2: Reopen and verify indexes, boundary, state and schema
        let store = RedbStore::open(&path).expect("reopen db");
        assert_eq!(store.next_id(), b.next());
        assert_eq!(store.state(), StoreState::Complete);
        assert_eq!(store.scan(&kv), vec![a, b]);
        assert_eq!(store.seek(&kv, &Value::string("k")).expect("seek"), vec![a]);
        assert_eq!(store.load_schema().expect("load"), Some(b"schema-bytes".to_vec()));
        assert_eq!(store.statistics().total().count, 2);

        let digest = super::super::content_digest(&kv, &Value::string("k"), &Value::Nat(1)).expect("digest");
        assert_eq!(store.find(&digest), Some(a));
    }

    #[test]
    fn sealed_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("facts.redb");
        {
            let mut store = RedbStore::open(&path).expect("open db");
            store.insert(blob(), Value::string("x"), Value::unit()).expect("insert");
            store.mark_complete().expect("complete");
        }
        let mut store = RedbStore::open(&path).expect("reopen db");
        assert!(matches!(
            store.insert(blob(), Value::string("y"), Value::unit()),
            Err(FactDbError::StoreSealed)
        ));
    }

    #[test]
    fn batch_commit_is_atomic_and_ordered() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("facts.redb")).expect("open db");

        let mut batch = FactBatch::new(&store);
        let ids: Vec<FactId> = (0..10u64)
            .map(|n| {
                batch
                    .insert(&store, blob(), Value::string(format!("fact-{n}")), Value::unit())
                    .expect("stage")
            })
            .collect();
        assert_eq!(store.fact_count().expect("count"), 0);
        store.commit(batch).expect("commit");
        assert_eq!(store.fact_count().expect("count"), 10);
        assert_eq!(store.scan(&blob()), ids);
    }

    #[test]
    fn compact_and_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("facts.redb");
        {
            let mut store = RedbStore::open(&path).expect("open db");
            store.insert(blob(), Value::string("x"), Value::unit()).expect("insert");
            store.compact().expect("compact");
        }
        let store = RedbStore::open(&path).expect("reopen db");
        assert_eq!(store.fact_count().expect("count"), 1);
    }
}
