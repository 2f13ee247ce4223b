//! # Result Rendering
//!
//! Turns result facts and values into JSON, inlining referenced facts as
//! the expansion policy allows.
//!
//! A reference is left as `{"id": N}` when its position was marked `..` in
//! the query, when the policy excludes its predicate, when it points back at
//! a fact already being rendered, or when the same reference was already
//! inlined once under the same result. Depth is capped at
//! [`MAX_EXPANSION_DEPTH`].

use super::ExpandPolicy;
use super::eval::Evaluator;
use super::ir::VALUE_ROOT;
use crate::formats::json::{FactLeaf, encode, fact_ref};
use crate::primitives::MAX_EXPANSION_DEPTH;
use crate::schema::Type;
use crate::{Fact, FactDbError, FactId, PredicateRef, Value};
use serde_json::{Map, Value as Json};
use std::collections::BTreeSet;

/// Renders the results of one query, one binding at a time.
pub(crate) struct Renderer<'r, 'a> {
    eval: &'r mut Evaluator<'a>,
    policy: &'r ExpandPolicy,
    no_expand: &'r BTreeSet<Vec<String>>,
    /// (referencing fact, referenced fact) pairs already inlined.
    visited: BTreeSet<(FactId, FactId)>,
    /// Facts currently being rendered, outermost first.
    ancestors: Vec<FactId>,
}

impl<'r, 'a> Renderer<'r, 'a> {
    pub(crate) fn new(
        eval: &'r mut Evaluator<'a>,
        policy: &'r ExpandPolicy,
        no_expand: &'r BTreeSet<Vec<String>>,
    ) -> Self {
        Self {
            eval,
            policy,
            no_expand,
            visited: BTreeSet::new(),
            ancestors: Vec::new(),
        }
    }

    /// `{"id", "key", "value"?}`
    pub(crate) fn fact(&mut self, fact: &Fact) -> Result<Json, FactDbError> {
        self.object(fact, &mut Vec::new())
    }

    /// `{"key": ...}` for a result that is not a fact.
    pub(crate) fn value(&mut self, value: &Value, ty: &Type) -> Result<Json, FactDbError> {
        let mut object = Map::new();
        object.insert("key".into(), encode(value, ty, &mut Vec::new(), self)?);
        Ok(Json::Object(object))
    }

    /// Render `fact`, whose reference sits at `path`.
    fn object(&mut self, fact: &Fact, path: &mut Vec<String>) -> Result<Json, FactDbError> {
        self.ancestors.push(fact.id);
        let body = self.body(fact, path);
        self.ancestors.pop();
        let (key, value) = body?;

        let mut object = Map::new();
        object.insert("id".into(), Json::from(fact.id.0));
        object.insert("key".into(), key);
        if let Some(value) = value {
            object.insert("value".into(), value);
        }
        Ok(Json::Object(object))
    }

    /// Encoded key and value of `fact`.
    fn body(&mut self, fact: &Fact, path: &mut Vec<String>) -> Result<(Json, Option<Json>), FactDbError> {
        let def = self
            .eval
            .target()
            .get(&fact.predicate)
            .ok_or_else(|| FactDbError::UnknownPredicate(fact.predicate.to_string()))?;
        let key = encode(&fact.key, &def.key_type, path, self)?;
        let value = match fact.value() {
            Some(v) => {
                path.push(VALUE_ROOT.to_string());
                let encoded = encode(v, &def.value_type, path, self);
                path.pop();
                Some(encoded?)
            }
            None => None,
        };
        Ok((key, value))
    }

    fn opaque(&mut self, id: FactId, predicate: &PredicateRef, path: &[String]) -> bool {
        if self.no_expand.contains(path) || !self.policy.expands(predicate) {
            return true;
        }
        if self.ancestors.contains(&id) || self.ancestors.len() >= MAX_EXPANSION_DEPTH {
            return true;
        }
        let origin = self.ancestors.last().copied().unwrap_or(id);
        !self.visited.insert((origin, id))
    }
}

impl FactLeaf for Renderer<'_, '_> {
    fn leaf(&mut self, id: FactId, predicate: &PredicateRef, path: &[String]) -> Result<Json, FactDbError> {
        if self.opaque(id, predicate, path) {
            return Ok(fact_ref(id));
        }
        match self.eval.read(id, predicate)? {
            Some(fact) => self.object(&fact, &mut path.to_vec()),
            None => Ok(fact_ref(id)),
        }
    }
}
