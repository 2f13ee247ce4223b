//! # Type Conversions
//!
//! Reading facts stored under one type through another: record fields match
//! by name (added fields take their default, removed fields are dropped), sum
//! alternatives match by name, arrays convert element-wise and predicate
//! references of the same name pass through.
//!
//! A [`Conversion`] is prepared once per stored predicate before a query
//! emits anything, so incompatible schema changes fail up front.

use super::Type;
use crate::{FactDbError, Value};

/// A prepared conversion from a stored type to a query type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    Identity,
    Array(Box<Conversion>),
    /// One entry per target field.
    Record(Vec<FieldConversion>),
    /// One entry per source alternative: target index and payload conversion.
    Sum(Vec<(u32, Conversion)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldConversion {
    /// Take source field `index`, converted.
    From(usize, Conversion),
    /// The field does not exist in the source type.
    Default(Value),
}

impl Conversion {
    /// Prepare the conversion from `from` to `to`.
    pub fn new(from: &Type, to: &Type) -> Result<Self, FactDbError> {
        if from == to {
            return Ok(Self::Identity);
        }
        match (from, to) {
            (Type::Predicate(a), Type::Predicate(b)) if a.name == b.name => Ok(Self::Identity),
            (Type::Array(a), Type::Array(b)) => Ok(match Self::new(a, b)? {
                Self::Identity => Self::Identity,
                inner => Self::Array(Box::new(inner)),
            }),
            (Type::Record(source), Type::Record(target)) => {
                let mut fields = Vec::with_capacity(target.len());
                for field in target {
                    match source.iter().position(|s| s.name == field.name) {
                        Some(index) => fields.push(FieldConversion::From(
                            index,
                            Self::new(&source[index].ty, &field.ty)?,
                        )),
                        None => {
                            let default = field.default_value().ok_or_else(|| {
                                FactDbError::type_error(format!(
                                    "added field {} has no default value",
                                    field.name
                                ))
                            })?;
                            fields.push(FieldConversion::Default(default));
                        }
                    }
                }
                let identity = fields.len() == source.len()
                    && fields.iter().enumerate().all(|(i, f)| {
                        matches!(f, FieldConversion::From(index, Self::Identity) if *index == i)
                    });
                Ok(if identity {
                    Self::Identity
                } else {
                    Self::Record(fields)
                })
            }
            (Type::Sum(source), Type::Sum(target)) => {
                let mut alts = Vec::with_capacity(source.len());
                for alt in source {
                    let index = target.iter().position(|t| t.name == alt.name).ok_or_else(|| {
                        FactDbError::type_error(format!("alternative {} was removed", alt.name))
                    })?;
                    alts.push((index as u32, Self::new(&alt.ty, &target[index].ty)?));
                }
                let identity = alts.len() == target.len()
                    && alts
                        .iter()
                        .enumerate()
                        .all(|(i, (index, c))| *index as usize == i && *c == Self::Identity);
                Ok(if identity { Self::Identity } else { Self::Sum(alts) })
            }
            _ => Err(FactDbError::type_error(format!("cannot read {from} as {to}"))),
        }
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Convert a value of the source type.
    pub fn apply(&self, value: Value) -> Result<Value, FactDbError> {
        match (self, value) {
            (Self::Identity, value) => Ok(value),
            (Self::Array(inner), Value::Array(items)) => items
                .into_iter()
                .map(|v| inner.apply(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            (Self::Record(fields), Value::Record(values)) => fields
                .iter()
                .map(|field| match field {
                    FieldConversion::From(index, conv) => values
                        .get(*index)
                        .cloned()
                        .ok_or_else(|| FactDbError::type_error("stored record is missing a field"))
                        .and_then(|v| conv.apply(v)),
                    FieldConversion::Default(v) => Ok(v.clone()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Record),
            (Self::Sum(alts), Value::Alt(index, inner)) => {
                let (target, conv) = alts
                    .get(index as usize)
                    .ok_or_else(|| FactDbError::type_error("stored alternative out of range"))?;
                Ok(Value::Alt(*target, Box::new(conv.apply(*inner)?)))
            }
            (_, value) => Err(FactDbError::type_error(format!(
                "stored {} does not match its declared type",
                value.kind()
            ))),
        }
    }
}
