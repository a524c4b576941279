//! Identifiers and identity keys.
//!
//! An [`EntityKey`] is the unit-of-work identity of a row: the root entity
//! name of the mapping hierarchy plus the identifier value(s). Equality and
//! hashing go through [`Value::same_as`] / [`Value::hash_into`] so composite
//! and floating point identifiers behave as values, never as references.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier value(s) of an entity, in declared identifier column order.
///
/// Integer columns are stored as `BigInt` whatever their width, so a key read
/// from an `INTEGER` foreign key column equals the same key read from a
/// `BIGINT` primary key column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<Value>")]
pub struct Identifier(Vec<Value>);

fn widen(value: Value) -> Value {
    match value {
        Value::TinyInt(v) => Value::BigInt(i64::from(v)),
        Value::SmallInt(v) => Value::BigInt(i64::from(v)),
        Value::Int(v) => Value::BigInt(i64::from(v)),
        other => other,
    }
}

impl Identifier {
    /// Create an identifier from its column values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.into_iter().map(widen).collect())
    }

    /// Create a single-column identifier.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![widen(value.into())])
    }

    /// The identifier column values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of identifier columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the identifier has no columns at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// An identifier is null when it is empty or any of its columns is NULL.
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0.iter().any(Value::is_null)
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a.same_as(b))
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            v.hash_into(state);
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                write!(f, "(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for Identifier {
    fn from(v: i64) -> Self {
        Self::single(v)
    }
}

/// Integer literals widen to `BigInt` so they match hydrated `BIGINT` keys.
impl From<i32> for Identifier {
    fn from(v: i32) -> Self {
        Self::single(i64::from(v))
    }
}

impl From<&str> for Identifier {
    fn from(v: &str) -> Self {
        Self::single(v)
    }
}

impl From<Value> for Identifier {
    fn from(v: Value) -> Self {
        Self::single(v)
    }
}

impl From<Vec<Value>> for Identifier {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// Identity of an entity within a unit of work.
///
/// `entity_name` is the root of the entity's mapping hierarchy, so a
/// subclass instance and its root share one key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    entity_name: String,
    id: Identifier,
}

impl EntityKey {
    /// Create a key from a hierarchy root name and identifier.
    pub fn new(entity_name: impl Into<String>, id: Identifier) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
        }
    }

    /// The hierarchy root entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// The identifier.
    pub fn id(&self) -> &Identifier {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.id)
    }
}
