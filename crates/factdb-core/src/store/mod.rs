//! # Fact Store
//!
//! Content-addressed, append-only storage of facts for one database.
//!
//! Writes go through a [`FactBatch`]: inserts are staged in memory, deduplicated
//! against the committed store and the batch itself, and appended atomically by
//! [`FactStore::commit`]. Dropping a batch leaves no trace. Ids below
//! [`FactStore::next_id`] are committed and never change.
//!
//! Two backends implement [`FactStore`]: [`MemoryStore`] and [`RedbStore`].

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::primitives::FIRST_FACT_ID;
use crate::system::Statistics;
use crate::{Fact, FactDbError, FactId, PredicateRef, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// BLAKE3 digest of a canonical postcard encoding.
pub type Digest = [u8; 32];

/// Digest identifying a fact's content: `(predicate, key, value)`.
pub fn content_digest(predicate: &PredicateRef, key: &Value, value: &Value) -> Result<Digest, FactDbError> {
    let bytes = postcard::to_allocvec(&(predicate, key, value))
        .map_err(|e| FactDbError::Serialization(e.to_string()))?;
    Ok(*blake3::hash(&bytes).as_bytes())
}

/// Digest identifying `(predicate, key)`, used by the key index.
pub fn key_digest(predicate: &PredicateRef, key: &Value) -> Result<Digest, FactDbError> {
    let bytes = postcard::to_allocvec(&(predicate, key)).map_err(|e| FactDbError::Serialization(e.to_string()))?;
    Ok(*blake3::hash(&bytes).as_bytes())
}

fn encoded_size(fact: &Fact) -> Result<u64, FactDbError> {
    postcard::to_allocvec(&(&fact.key, &fact.value))
        .map(|bytes| bytes.len() as u64)
        .map_err(|e| FactDbError::Serialization(e.to_string()))
}

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle state persisted with a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StoreState {
    Building,
    Complete,
    Incomplete,
}

impl StoreState {
    pub(crate) const fn code(self) -> u64 {
        match self {
            Self::Building => 0,
            Self::Complete => 1,
            Self::Incomplete => 2,
        }
    }

    pub(crate) const fn from_code(code: u64) -> Self {
        match code {
            0 => Self::Building,
            1 => Self::Complete,
            _ => Self::Incomplete,
        }
    }
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Building => write!(f, "building"),
            Self::Complete => write!(f, "complete"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

// =============================================================================
// FACTSTORE TRAIT
// =============================================================================

/// Storage operations shared by every backend.
///
/// Lookups by content, predicate and key are served from in-memory indexes,
/// so they are infallible; reading a fact body may hit disk.
pub trait FactStore: fmt::Debug + Send + Sync {
    /// Read a fact by id.
    fn lookup(&self, id: FactId) -> Result<Option<Fact>, FactDbError>;

    /// The id of a committed fact with this content digest.
    fn find(&self, digest: &Digest) -> Option<FactId>;

    /// Ids of all facts of a predicate, in id order.
    fn scan(&self, predicate: &PredicateRef) -> Vec<FactId>;

    /// Ids of facts of a predicate whose key equals `key`, in id order.
    fn seek(&self, predicate: &PredicateRef, key: &Value) -> Result<Vec<FactId>, FactDbError>;

    /// Every predicate with at least one fact.
    fn predicates(&self) -> Vec<PredicateRef>;

    /// The id the next committed fact will receive.
    fn next_id(&self) -> FactId;

    fn state(&self) -> StoreState;

    fn set_state(&mut self, state: StoreState) -> Result<(), FactDbError>;

    fn statistics(&self) -> Statistics;

    /// Append a batch atomically.
    fn commit(&mut self, batch: FactBatch) -> Result<(), FactDbError>;

    /// Persist the encoded stored schema.
    fn save_schema(&mut self, bytes: &[u8]) -> Result<(), FactDbError>;

    /// The encoded stored schema, if one was saved.
    fn load_schema(&self) -> Result<Option<Vec<u8>>, FactDbError>;

    /// Read a fact that must exist.
    fn get(&self, id: FactId) -> Result<Fact, FactDbError> {
        self.lookup(id)?
            .ok_or_else(|| FactDbError::NotFound(format!("fact {id}")))
    }

    /// Seal the store; later inserts fail with [`FactDbError::StoreSealed`].
    fn mark_complete(&mut self) -> Result<(), FactDbError> {
        self.set_state(StoreState::Complete)
    }

    fn is_complete(&self) -> bool {
        self.state() == StoreState::Complete
    }

    /// Insert a single fact in its own batch.
    fn insert(&mut self, predicate: PredicateRef, key: Value, value: Value) -> Result<FactId, FactDbError> {
        let mut batch = FactBatch::new(&*self);
        let id = batch.insert(&*self, predicate, key, value)?;
        self.commit(batch)?;
        Ok(id)
    }
}

// =============================================================================
// BATCH
// =============================================================================

/// Facts staged for one atomic commit.
#[derive(Debug, Clone)]
pub struct FactBatch {
    base: FactId,
    next: FactId,
    facts: Vec<Fact>,
    digests: Vec<Digest>,
    content: BTreeMap<Digest, FactId>,
}

impl FactBatch {
    /// Start a batch at the store's current boundary.
    pub fn new<S: FactStore + ?Sized>(store: &S) -> Self {
        let base = store.next_id();
        Self {
            base,
            next: base,
            facts: Vec::new(),
            digests: Vec::new(),
            content: BTreeMap::new(),
        }
    }

    /// Stage a fact, returning its (possibly existing) id.
    ///
    /// Fact references inside `key`/`value` must point at committed facts or
    /// facts earlier in this batch.
    pub fn insert<S: FactStore + ?Sized>(
        &mut self,
        store: &S,
        predicate: PredicateRef,
        key: Value,
        value: Value,
    ) -> Result<FactId, FactDbError> {
        if store.state() != StoreState::Building {
            return Err(FactDbError::StoreSealed);
        }

        let digest = content_digest(&predicate, &key, &value)?;
        if let Some(id) = store.find(&digest) {
            return Ok(id);
        }
        if let Some(&id) = self.content.get(&digest) {
            return Ok(id);
        }

        let mut dangling = None;
        let mut check = |r: FactId| {
            if (r.0 < FIRST_FACT_ID || r >= self.next) && dangling.is_none() {
                dangling = Some(r);
            }
        };
        key.for_each_fact(&mut check);
        value.for_each_fact(&mut check);
        if let Some(r) = dangling {
            return Err(FactDbError::NotFound(format!("referenced fact {r}")));
        }

        let id = self.next;
        self.next = id.next();
        self.facts.push(Fact {
            id,
            predicate,
            key,
            value,
        });
        self.digests.push(digest);
        self.content.insert(digest, id);
        Ok(id)
    }

    /// A staged fact.
    pub fn get(&self, id: FactId) -> Option<&Fact> {
        let offset = id.0.checked_sub(self.base.0)?;
        self.facts.get(usize::try_from(offset).ok()?)
    }

    /// The id the first staged fact received.
    #[must_use]
    pub fn base(&self) -> FactId {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Staged facts in id order.
    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub(crate) fn into_parts(self) -> (FactId, Vec<Fact>, Vec<Digest>) {
        (self.base, self.facts, self.digests)
    }
}

/// Check a batch is still appendable to a store at `next_id` in `state`.
pub(crate) fn check_commit(batch: &FactBatch, next_id: FactId, state: StoreState) -> Result<(), FactDbError> {
    if state != StoreState::Building {
        return Err(FactDbError::StoreSealed);
    }
    if batch.base() != next_id {
        return Err(FactDbError::Io(format!(
            "stale batch: starts at {}, store is at {next_id}",
            batch.base()
        )));
    }
    Ok(())
}

// =============================================================================
// IN-MEMORY INDEX
// =============================================================================

/// Content, predicate and key indexes, plus statistics. Rebuilt on open by
/// disk-backed stores.
#[derive(Debug, Clone, Default)]
pub(crate) struct FactIndex {
    content: BTreeMap<Digest, FactId>,
    by_predicate: BTreeMap<PredicateRef, Vec<FactId>>,
    by_key: BTreeMap<Digest, Vec<FactId>>,
    stats: Statistics,
}

/// Everything the index needs to know about one fact.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    id: FactId,
    predicate: PredicateRef,
    content: Digest,
    key: Digest,
    size: u64,
}

impl IndexEntry {
    /// Compute the entry for a fact. This is the only fallible step of indexing.
    pub(crate) fn new(fact: &Fact, content: Digest) -> Result<Self, FactDbError> {
        Ok(Self {
            id: fact.id,
            predicate: fact.predicate.clone(),
            content,
            key: key_digest(&fact.predicate, &fact.key)?,
            size: encoded_size(fact)?,
        })
    }
}

impl FactIndex {
    /// Index a fact. Entries must be added in id order.
    pub(crate) fn add(&mut self, entry: IndexEntry) {
        self.content.insert(entry.content, entry.id);
        self.by_key.entry(entry.key).or_default().push(entry.id);
        self.stats.record(&entry.predicate, entry.size);
        self.by_predicate.entry(entry.predicate).or_default().push(entry.id);
    }

    pub(crate) fn find(&self, digest: &Digest) -> Option<FactId> {
        self.content.get(digest).copied()
    }

    pub(crate) fn scan(&self, predicate: &PredicateRef) -> Vec<FactId> {
        self.by_predicate.get(predicate).cloned().unwrap_or_default()
    }

    pub(crate) fn seek(&self, predicate: &PredicateRef, key: &Value) -> Result<Vec<FactId>, FactDbError> {
        let digest = key_digest(predicate, key)?;
        Ok(self.by_key.get(&digest).cloned().unwrap_or_default())
    }

    pub(crate) fn predicates(&self) -> Vec<PredicateRef> {
        self.by_predicate.keys().cloned().collect()
    }

    pub(crate) fn statistics(&self) -> Statistics {
        self.stats.clone()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> PredicateRef {
        PredicateRef::new("sys.Blob", 1)
    }

    #[test]
    fn digest_depends_on_predicate_version() {
        let a = content_digest(&blob(), &Value::string("x"), &Value::unit()).expect("digest");
        let b = content_digest(&PredicateRef::new("sys.Blob", 2), &Value::string("x"), &Value::unit())
            .expect("digest");
        assert_ne!(a, b);
    }

    #[test]
    fn batch_dedups_within_itself() {
        let store = MemoryStore::new();
        let mut batch = FactBatch::new(&store);
        let a = batch.insert(&store, blob(), Value::string("x"), Value::unit()).expect("insert");
        let b = batch.insert(&store, blob(), Value::string("x"), Value::unit()).expect("insert");
        assert_eq!(a, b);
        assert_eq!(a, FactId(FIRST_FACT_ID));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn batch_rejects_dangling_reference() {
        let store = MemoryStore::new();
        let mut batch = FactBatch::new(&store);
        let err = batch
            .insert(
                &store,
                PredicateRef::new("x.Ref", 1),
                Value::Fact(FactId(5000)),
                Value::unit(),
            )
            .expect_err("dangling");
        assert!(matches!(err, FactDbError::NotFound(_)));
    }

    #[test]
    fn dropped_batch_leaves_no_trace() {
        let store = MemoryStore::new();
        {
            let mut batch = FactBatch::new(&store);
            batch.insert(&store, blob(), Value::string("x"), Value::unit()).expect("insert");
        }
        assert_eq!(store.next_id(), FactId(FIRST_FACT_ID));
        assert!(store.scan(&blob()).is_empty());
    }

    #[test]
    fn stale_batch_is_rejected() {
        let mut store = MemoryStore::new();
        let mut first = FactBatch::new(&store);
        let mut second = FactBatch::new(&store);
        first.insert(&store, blob(), Value::string("a"), Value::unit()).expect("insert");
        second.insert(&store, blob(), Value::string("b"), Value::unit()).expect("insert");
        store.commit(first).expect("commit");
        assert!(matches!(store.commit(second), Err(FactDbError::Io(_))));
    }

    #[test]
    fn state_codes_round_trip() {
        for state in [StoreState::Building, StoreState::Complete, StoreState::Incomplete] {
            assert_eq!(StoreState::from_code(state.code()), state);
        }
    }
}
