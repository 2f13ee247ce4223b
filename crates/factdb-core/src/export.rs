//! # Dump
//!
//! Serializes every fact of a store as a fact file that [`crate::ingestor`]
//! reads back.
//!
//! Facts are written in id order. Consecutive facts of the same predicate
//! share one group, each fact carries its id as its label, and references are
//! written as `{"id": N}`. Since a fact can only refer to facts created before
//! it, every reference points at a label defined earlier in the dump.

use crate::formats::json::{OpaqueFacts, encode};
use crate::ingestor::{FactEntry, FactGroup};
use crate::primitives::FIRST_FACT_ID;
use crate::schema::Schema;
use crate::store::FactStore;
use crate::{FactDbError, FactId};

/// Every fact of `store`, encoded with the types of `schema` (the schema the
/// store was built with).
pub fn dump(store: &dyn FactStore, schema: &Schema) -> Result<Vec<FactGroup>, FactDbError> {
    let mut groups: Vec<FactGroup> = Vec::new();
    let mut id = FactId(FIRST_FACT_ID);
    let end = store.next_id();

    while id < end {
        let fact = store.get(id)?;
        let def = schema
            .get(&fact.predicate)
            .ok_or_else(|| FactDbError::UnknownPredicate(fact.predicate.to_string()))?;
        let key = encode(&fact.key, &def.key_type, &mut Vec::new(), &mut OpaqueFacts)?;
        let value = match fact.value() {
            Some(v) => Some(encode(v, &def.value_type, &mut Vec::new(), &mut OpaqueFacts)?),
            None => None,
        };
        let entry = FactEntry {
            id: Some(fact.id.0),
            key,
            value,
        };

        let predicate = fact.predicate.to_string();
        match groups.last_mut() {
            Some(group) if group.predicate == predicate => group.facts.push(entry),
            _ => groups.push(FactGroup {
                predicate,
                facts: vec![entry],
            }),
        }
        id = id.next();
    }

    tracing::debug!(groups = groups.len(), facts = end.0.saturating_sub(FIRST_FACT_ID), "store dumped");
    Ok(groups)
}

/// [`dump`] rendered as pretty-printed JSON.
pub fn dump_json(store: &dyn FactStore, schema: &Schema) -> Result<String, FactDbError> {
    serde_json::to_string_pretty(&dump(store, schema)?).map_err(|e| FactDbError::Serialization(e.to_string()))
}

// =============================================================================
// TESTS
// =============================================================================
