//! # Ownership
//!
//! Maps every fact to the root facts that reach it through fact references.
//! A root is a fact no other fact refers to.
//!
//! A fact can only refer to facts created before it, so every reference
//! points at a lower id. Walking ids from highest to lowest therefore sees
//! all referrers of a fact before the fact itself, and one pass suffices.

use crate::primitives::FIRST_FACT_ID;
use crate::store::FactStore;
use crate::{FactDbError, FactId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Root owners of every fact in a store. Recomputed on demand, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ownership {
    owners: BTreeMap<FactId, BTreeSet<FactId>>,
}

impl Ownership {
    /// Compute ownership for every fact of `store`.
    pub fn compute(store: &dyn FactStore) -> Result<Self, FactDbError> {
        let first = FactId(FIRST_FACT_ID);
        let mut referrers: BTreeMap<FactId, Vec<FactId>> = BTreeMap::new();
        let mut id = first;
        while id < store.next_id() {
            let fact = store.get(id)?;
            let mut record = |target: FactId| referrers.entry(target).or_default().push(id);
            fact.key.for_each_fact(&mut record);
            fact.value.for_each_fact(&mut record);
            id = id.next();
        }

        let mut owners: BTreeMap<FactId, BTreeSet<FactId>> = BTreeMap::new();
        let mut id = store.next_id();
        while id > first {
            id = FactId(id.0 - 1);
            let set = match referrers.get(&id) {
                None => BTreeSet::from([id]),
                Some(parents) => parents
                    .iter()
                    .filter_map(|parent| owners.get(parent))
                    .flatten()
                    .copied()
                    .collect(),
            };
            owners.insert(id, set);
        }

        tracing::debug!(facts = owners.len(), "ownership computed");
        Ok(Self { owners })
    }

    /// The roots owning `id`; a root owns itself.
    #[must_use]
    pub fn owners(&self, id: FactId) -> Option<&BTreeSet<FactId>> {
        self.owners.get(&id)
    }

    /// Owners of `id` rendered as `a || b || c`.
    #[must_use]
    pub fn describe(&self, id: FactId) -> Option<OwnerSet<'_>> {
        self.owners(id).map(OwnerSet)
    }
}

/// Display adapter for a set of owners.
#[derive(Debug, Clone, Copy)]
pub struct OwnerSet<'a>(&'a BTreeSet<FactId>);

impl fmt::Display for OwnerSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " || ")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}
