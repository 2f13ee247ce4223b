//! # Ingestor Module
//!
//! Fact-file parsing and validation.
//!
//! A fact file is a JSON array of predicate groups:
//!
//! ```json
//! [
//!   { "predicate": "example.Class.1",
//!     "facts": [ { "id": 1, "key": { "name": "A", "line": 1 } } ] },
//!   { "predicate": "example.Parent",
//!     "facts": [ { "key": { "child": { "id": 1 }, "parent": 2 } } ] }
//! ]
//! ```
//!
//! - The predicate version is optional; the latest version is used.
//! - `id` is a label local to the file. A reference to another fact is its
//!   label (a number or `{"id": N}`) or a nested `{"key": ..., "value": ...}`
//!   definition.
//! - Every fact is validated against its type before anything is staged;
//!   a file is staged into a single [`FactBatch`] so it commits atomically.

use crate::formats::json::{FactRefs, decode};
use crate::primitives::MAX_FACT_FILE_SIZE;
use crate::schema::{PredicateDef, Schema};
use crate::store::{FactBatch, FactStore};
use crate::{FactDbError, FactId, PredicateRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::Path;

// =============================================================================
// FILE FORMAT
// =============================================================================

/// The facts of one predicate in a fact file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactGroup {
    pub predicate: String,
    pub facts: Vec<FactEntry>,
}

/// One fact as written in a fact file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub key: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
}

/// A parsed fact file.
#[derive(Debug, Clone, PartialEq)]
pub struct FactFile {
    /// The name the file was read from, used in error messages.
    pub name: String,
    pub groups: Vec<FactGroup>,
}

impl FactFile {
    /// Total number of top-level fact entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.facts.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read and parse a fact file.
///
/// Any failure is reported as [`FactDbError::IngestionParseFailure`] naming
/// the file as given.
pub fn read_fact_file(path: &Path) -> Result<FactFile, FactDbError> {
    let name = path.display().to_string();
    let failure = |reason: String| FactDbError::IngestionParseFailure {
        file: name.clone(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| failure(e.to_string()))?;
    if metadata.len() > MAX_FACT_FILE_SIZE {
        return Err(failure(format!(
            "file is {} bytes, limit is {MAX_FACT_FILE_SIZE}",
            metadata.len()
        )));
    }
    let text = std::fs::read_to_string(path).map_err(|e| failure(e.to_string()))?;
    parse_fact_file(&name, &text)
}

/// Parse fact-file text.
pub fn parse_fact_file(name: &str, text: &str) -> Result<FactFile, FactDbError> {
    let groups: Vec<FactGroup> =
        serde_json::from_str(text).map_err(|e| FactDbError::IngestionParseFailure {
            file: name.to_string(),
            reason: e.to_string(),
        })?;
    Ok(FactFile {
        name: name.to_string(),
        groups,
    })
}

// =============================================================================
// INGESTOR
// =============================================================================

/// Validates fact files against a schema and stages them into batches.
#[derive(Debug, Clone, Copy)]
pub struct Ingestor<'a> {
    schema: &'a Schema,
}

impl<'a> Ingestor<'a> {
    #[must_use]
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Resolve a predicate named in a fact file: `name.N` or `name` (latest).
    pub fn predicate(&self, text: &str) -> Result<&'a PredicateDef, FactDbError> {
        let def = match PredicateRef::parse(text) {
            Some(p) if self.schema.latest(&p.name).is_some() => self.schema.resolve(&p.name, Some(p.version))?,
            _ => self.schema.resolve(text, None)?,
        };
        if def.is_derived() {
            return Err(FactDbError::type_error(format!(
                "cannot ingest facts of derived predicate {}",
                def.predicate
            )));
        }
        Ok(def)
    }

    /// Stage every fact of `file` into one batch against `store`.
    ///
    /// Nothing is written until the caller commits the batch.
    pub fn stage(&self, file: &FactFile, store: &dyn FactStore) -> Result<FactBatch, FactDbError> {
        let failure = |e: FactDbError| match e {
            FactDbError::StoreSealed | FactDbError::IngestionParseFailure { .. } => e,
            other => FactDbError::IngestionParseFailure {
                file: file.name.clone(),
                reason: other.to_string(),
            },
        };

        let mut staging = Staging {
            schema: self.schema,
            store,
            batch: FactBatch::new(store),
            labels: BTreeMap::new(),
        };

        for group in &file.groups {
            let def = self.predicate(&group.predicate).map_err(failure)?;
            for (n, entry) in group.facts.iter().enumerate() {
                staging
                    .define(def, entry.id, &entry.key, entry.value.as_ref())
                    .map_err(|reason| {
                        failure(FactDbError::type_error(format!(
                            "{} fact #{n}: {reason}",
                            def.predicate
                        )))
                    })?;
            }
        }

        tracing::debug!(file = %file.name, staged = staging.batch.len(), "fact file staged");
        Ok(staging.batch)
    }
}

/// Mutable state while staging one file.
struct Staging<'a, 's> {
    schema: &'a Schema,
    store: &'s dyn FactStore,
    batch: FactBatch,
    /// File-local label -> (id, predicate)
    labels: BTreeMap<u64, (FactId, PredicateRef)>,
}

impl Staging<'_, '_> {
    fn define(
        &mut self,
        def: &PredicateDef,
        label: Option<u64>,
        key: &Json,
        value: Option<&Json>,
    ) -> Result<FactId, String> {
        let key = decode(key, &def.key_type, self)?;
        let value = match value {
            Some(v) => decode(v, &def.value_type, self)?,
            None => def
                .value_type
                .zero()
                .ok_or_else(|| "missing value".to_string())?,
        };
        let store = self.store;
        let id = self
            .batch
            .insert(store, def.predicate.clone(), key, value)
            .map_err(|e| e.to_string())?;
        if let Some(label) = label {
            if let Some((existing, _)) = self.labels.get(&label) {
                if *existing != id {
                    return Err(format!("fact id {label} defined twice"));
                }
            }
            self.labels.insert(label, (id, def.predicate.clone()));
        }
        Ok(id)
    }

    fn label(&self, label: u64, predicate: &PredicateRef) -> Result<FactId, String> {
        let (id, actual) = self
            .labels
            .get(&label)
            .ok_or_else(|| format!("undefined fact id {label}"))?;
        if actual.name != predicate.name {
            return Err(format!(
                "fact id {label} is a {actual}, expected a {}",
                predicate.name
            ));
        }
        Ok(*id)
    }
}

impl FactRefs for Staging<'_, '_> {
    fn resolve(&mut self, json: &Json, predicate: &PredicateRef) -> Result<FactId, String> {
        if let Some(label) = json.as_u64() {
            return self.label(label, predicate);
        }
        let object = json
            .as_object()
            .ok_or_else(|| format!("expected a reference to {predicate}"))?;
        let label = match object.get("id") {
            Some(id) => Some(id.as_u64().ok_or_else(|| "fact id must be a number".to_string())?),
            None => None,
        };
        match (object.get("key"), label) {
            (Some(key), label) => {
                let schema = self.schema;
                let def = schema
                    .get(predicate)
                    .ok_or_else(|| format!("unknown predicate {predicate}"))?;
                self.define(def, label, key, object.get("value"))
            }
            (None, Some(label)) => self.label(label, predicate),
            (None, None) => Err(format!("expected a reference to {predicate}")),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::Value;
    use crate::store::MemoryStore;

    const SCHEMA: &str = r#"
        schema example.1 {
          predicate Class : { name : string, line : nat }
          predicate Parent : { child : Class, parent : Class }
          predicate Named : string -> Class
        }
    "#;

    fn schema() -> Schema {
        Schema::from_source(SCHEMA).expect("schema")
    }

    #[test]
    fn stages_labels_and_references() {
        let schema = schema();
        let mut store = MemoryStore::new();
        let file = parse_fact_file(
            "facts.json",
            r#"[
              {"predicate": "example.Class.1", "facts": [
                {"id": 1, "key": {"name": "A", "line": 1}},
                {"id": 2, "key": {"name": "B", "line": 2}}
              ]},
              {"predicate": "example.Parent", "facts": [
                {"key": {"child": {"id": 2}, "parent": 1}}
              ]}
            ]"#,
        )
        .expect("parse");
        let batch = Ingestor::new(&schema).stage(&file, &store).expect("stage");
        assert_eq!(batch.len(), 3);
        let parent = &batch.facts()[2];
        assert_eq!(
            parent.key,
            Value::Record(vec![Value::Fact(FactId(1025)), Value::Fact(FactId(1024))])
        );
        store.commit(batch).expect("commit");
        assert_eq!(store.next_id(), FactId(1027));
    }

    #[test]
    fn nested_definitions_and_values() {
        let schema = schema();
        let store = MemoryStore::new();
        let file = parse_fact_file(
            "nested.json",
            r#"[{"predicate": "example.Named", "facts": [
                {"key": "a", "value": {"key": {"name": "A", "line": 1}}}
            ]}]"#,
        )
        .expect("parse");
        let batch = Ingestor::new(&schema).stage(&file, &store).expect("stage");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.facts()[0].predicate, PredicateRef::new("example.Class", 1));
        assert_eq!(batch.facts()[1].value, Value::Fact(FactId(1024)));
    }

    #[test]
    fn undefined_label_fails_with_file_name() {
        let schema = schema();
        let store = MemoryStore::new();
        let file = parse_fact_file(
            "bad.json",
            r#"[{"predicate": "example.Parent", "facts": [{"key": {"child": 9, "parent": 9}}]}]"#,
        )
        .expect("parse");
        let err = Ingestor::new(&schema).stage(&file, &store).expect_err("undefined");
        match err {
            FactDbError::IngestionParseFailure { file, reason } => {
                assert_eq!(file, "bad.json");
                assert!(reason.contains("undefined fact id 9"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_predicate_fails() {
        let schema = schema();
        let store = MemoryStore::new();
        let file = parse_fact_file("x.json", r#"[{"predicate": "example.Nope", "facts": []}]"#).expect("parse");
        assert!(matches!(
            Ingestor::new(&schema).stage(&file, &store),
            Err(FactDbError::IngestionParseFailure { .. })
        ));
    }

    #[test]
    fn malformed_json_is_parse_failure() {
        assert!(matches!(
            parse_fact_file("broken.json", "[{"),
            Err(FactDbError::IngestionParseFailure { ref file, .. }) if file == "broken.json"
        ));
    }

    #[test]
    fn missing_file_is_parse_failure() {
        let err = read_fact_file(Path::new("does-not-exist.json")).expect_err("missing");
        assert!(err.to_string().starts_with("does-not-exist.json"));
    }

    #[test]
    fn wrong_label_predicate_is_rejected() {
        let schema = Schema::from_source(
            r#"schema t.1 {
                 predicate A : string
                 predicate B : string
                 predicate R : A
               }"#,
        )
        .expect("schema");
        let store = MemoryStore::new();
        let file = parse_fact_file(
            "r.json",
            r#"[{"predicate": "t.B", "facts": [{"id": 1, "key": "b"}]},
                {"predicate": "t.R", "facts": [{"key": 1}]}]"#,
        )
        .expect("parse");
        assert!(Ingestor::new(&schema).stage(&file, &store).is_err());
    }
}
