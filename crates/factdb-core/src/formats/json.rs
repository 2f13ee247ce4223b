//! # JSON Values
//!
//! Type-directed conversion between [`Value`] and JSON.
//!
//! | Type        | JSON                                            |
//! |-------------|-------------------------------------------------|
//! | byte, nat   | number                                          |
//! | bool        | `true` / `false`                                |
//! | string      | string                                          |
//! | `[T]`       | array                                           |
//! | record      | object keyed by field name                      |
//! | sum         | object with exactly one alternative             |
//! | predicate   | delegated to a [`FactLeaf`] / [`FactRefs`]      |
//!
//! Decoding fills missing record fields with their defaults and accepts a bare
//! string for a sum alternative whose payload is unit.

use crate::primitives::MAX_STRING_LENGTH;
use crate::schema::Type;
use crate::{FactDbError, FactId, PredicateRef, Value};
use serde_json::{Map, Value as Json, json};

// =============================================================================
// ENCODING
// =============================================================================

/// Renders fact references met while encoding.
pub trait FactLeaf {
    /// Encode the reference to `id`, a fact of `predicate`, found at `path`
    /// (field names from the root of the encoded value).
    fn leaf(&mut self, id: FactId, predicate: &PredicateRef, path: &[String]) -> Result<Json, FactDbError>;
}

/// Leaves every reference as `{"id": N}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueFacts;

impl FactLeaf for OpaqueFacts {
    fn leaf(&mut self, id: FactId, _predicate: &PredicateRef, _path: &[String]) -> Result<Json, FactDbError> {
        Ok(fact_ref(id))
    }
}

/// `{"id": N}`
#[must_use]
pub fn fact_ref(id: FactId) -> Json {
    json!({ "id": id.0 })
}

/// Encode `value` of type `ty`.
pub fn encode(value: &Value, ty: &Type, path: &mut Vec<String>, leaf: &mut dyn FactLeaf) -> Result<Json, FactDbError> {
    let mismatch = || FactDbError::type_error(format!("cannot encode {} as {ty}", value.kind()));
    match (ty, value) {
        (Type::Byte, Value::Byte(b)) => Ok(json!(b)),
        (Type::Nat, Value::Nat(n)) => Ok(json!(n)),
        (Type::Bool, Value::Bool(b)) => Ok(json!(b)),
        (Type::String, Value::String(s)) => Ok(json!(s)),
        (Type::Array(elem), Value::Array(items)) => items
            .iter()
            .map(|item| encode(item, elem, path, leaf))
            .collect::<Result<Vec<_>, _>>()
            .map(Json::Array),
        (Type::Record(fields), Value::Record(values)) if fields.len() == values.len() => {
            let mut object = Map::new();
            for (field, v) in fields.iter().zip(values) {
                path.push(field.name.clone());
                let encoded = encode(v, &field.ty, path, leaf);
                path.pop();
                object.insert(field.name.clone(), encoded?);
            }
            Ok(Json::Object(object))
        }
        (Type::Sum(alts), Value::Alt(index, inner)) => {
            let alt = alts.get(*index as usize).ok_or_else(mismatch)?;
            path.push(alt.name.clone());
            let encoded = encode(inner, &alt.ty, path, leaf);
            path.pop();
            let mut object = Map::new();
            object.insert(alt.name.clone(), encoded?);
            Ok(Json::Object(object))
        }
        (Type::Predicate(p), Value::Fact(id)) => leaf.leaf(*id, p, path),
        _ => Err(mismatch()),
    }
}

// =============================================================================
// DECODING
// =============================================================================

/// Resolves fact references met while decoding.
pub trait FactRefs {
    /// Turn the JSON at a predicate-typed position into a fact id.
    fn resolve(&mut self, json: &Json, predicate: &PredicateRef) -> Result<FactId, String>;
}

/// Decode JSON of type `ty`. Errors are human-readable and name the offending
/// field path.
pub fn decode(json: &Json, ty: &Type, refs: &mut dyn FactRefs) -> Result<Value, String> {
    decode_at(json, ty, refs, &mut Vec::new())
}

fn at(path: &[String]) -> String {
    if path.is_empty() {
        "at top level".to_string()
    } else {
        format!("at field {}", path.join("."))
    }
}

fn decode_at(json: &Json, ty: &Type, refs: &mut dyn FactRefs, path: &mut Vec<String>) -> Result<Value, String> {
    let expected = |what: &str| format!("expected {what} {}, found {json}", at(path));
    match ty {
        Type::Byte => json
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .map(Value::Byte)
            .ok_or_else(|| expected("a byte")),
        Type::Nat => json.as_u64().map(Value::Nat).ok_or_else(|| expected("a nat")),
        Type::Bool => json.as_bool().map(Value::Bool).ok_or_else(|| expected("a bool")),
        Type::String => {
            let s = json.as_str().ok_or_else(|| expected("a string"))?;
            if s.len() > MAX_STRING_LENGTH {
                return Err(format!("string too long {}", at(path)));
            }
            Ok(Value::string(s))
        }
        Type::Array(elem) => {
            let items = json.as_array().ok_or_else(|| expected("an array"))?;
            items
                .iter()
                .map(|item| decode_at(item, elem, refs, path))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        Type::Record(fields) => {
            let object = json.as_object().ok_or_else(|| expected("an object"))?;
            if let Some(unknown) = object.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
                return Err(format!("unknown field {unknown} {}", at(path)));
            }
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                path.push(field.name.clone());
                let value = match object.get(&field.name) {
                    Some(v) => decode_at(v, &field.ty, refs, path),
                    None => field
                        .default_value()
                        .ok_or_else(|| format!("missing field {}", at(path))),
                };
                path.pop();
                values.push(value?);
            }
            Ok(Value::Record(values))
        }
        Type::Sum(alts) => {
            if let Some(name) = json.as_str() {
                return match alts.iter().position(|a| a.name == name) {
                    Some(i) if alts[i].ty.is_unit() => Ok(Value::Alt(i as u32, Box::new(Value::unit()))),
                    _ => Err(format!("unknown alternative {name} {}", at(path))),
                };
            }
            let object = json.as_object().ok_or_else(|| expected("an alternative"))?;
            let mut entries = object.iter();
            let (Some((name, payload)), None) = (entries.next(), entries.next()) else {
                return Err(format!("expected exactly one alternative {}", at(path)));
            };
            let index = alts
                .iter()
                .position(|a| &a.name == name)
                .ok_or_else(|| format!("unknown alternative {name} {}", at(path)))?;
            path.push(name.clone());
            let inner = decode_at(payload, &alts[index].ty, refs, path);
            path.pop();
            Ok(Value::Alt(index as u32, Box::new(inner?)))
        }
        Type::Predicate(p) => refs
            .resolve(json, p)
            .map(Value::Fact)
            .map_err(|e| format!("{e} {}", at(path))),
    }
}
