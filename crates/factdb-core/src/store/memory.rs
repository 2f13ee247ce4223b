//! # In-Memory Fact Store
//!
//! Uses `BTreeMap` exclusively for deterministic ordering.

use super::{FactBatch, FactIndex, FactStore, IndexEntry, StoreState, check_commit};
use crate::primitives::FIRST_FACT_ID;
use crate::system::Statistics;
use crate::{Fact, FactDbError, FactId, PredicateRef, Value};
use std::collections::BTreeMap;

/// A fact store held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    facts: BTreeMap<FactId, Fact>,
    index: FactIndex,
    next_id: FactId,
    state: StoreState,
    schema: Option<Vec<u8>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store in the building state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            facts: BTreeMap::new(),
            index: FactIndex::default(),
            next_id: FactId(FIRST_FACT_ID),
            state: StoreState::Building,
            schema: None,
        }
    }

    /// Number of stored facts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

impl FactStore for MemoryStore {
    fn lookup(&self, id: FactId) -> Result<Option<Fact>, FactDbError> {
        Ok(self.facts.get(&id).cloned())
    }

    fn find(&self, digest: &super::Digest) -> Option<FactId> {
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
        self.state = state;
        Ok(())
    }

    fn statistics(&self) -> Statistics {
        self.index.statistics()
    }

    fn commit(&mut self, batch: FactBatch) -> Result<(), FactDbError> {
        check_commit(&batch, self.next_id, self.state)?;
        let (_, facts, digests) = batch.into_parts();

        let entries = facts
            .iter()
            .zip(digests)
            .map(|(fact, digest)| IndexEntry::new(fact, digest))
            .collect::<Result<Vec<_>, _>>()?;

        for entry in entries {
            self.index.add(entry);
        }
        for fact in facts {
            self.next_id = fact.id.next();
            self.facts.insert(fact.id, fact);
        }
        Ok(())
    }

    fn save_schema(&mut self, bytes: &[u8]) -> Result<(), FactDbError> {
        self.schema = Some(bytes.to_vec());
        Ok(())
    }

    fn load_schema(&self) -> Result<Option<Vec<u8>>, FactDbError> {
        Ok(self.schema.clone())
    }
}
