//! Natural-id cross references.
//!
//! For entities declaring a natural id, the session remembers which
//! identifier belongs to which natural-id values (and back), so lookups by
//! natural id can be answered without a query.

use ormstate_core::{AttributeValue, EntityDescriptor, EntityKey, Identifier, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Values of an entity's natural id attributes, in declaration order.
#[derive(Debug, Clone)]
pub struct NaturalId(Vec<Value>);

impl NaturalId {
    /// Create from values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// The values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl PartialEq for NaturalId {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a.same_as(b))
    }
}

impl Eq for NaturalId {}

impl Hash for NaturalId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            v.hash_into(state);
        }
    }
}

/// Pull the natural id out of a state array. `None` when the entity has no
/// natural id.
pub fn extract_natural_id_values(
    state: &[AttributeValue],
    descriptor: &EntityDescriptor,
) -> Option<NaturalId> {
    let indices = descriptor.natural_id_indices()?;
    let values = indices
        .iter()
        .map(|&i| match state.get(i) {
            Some(AttributeValue::Basic(v)) => v.clone(),
            Some(AttributeValue::Entity(reference)) => reference_value(reference),
            Some(AttributeValue::ForeignKey(id)) => Value::Array(id.values().to_vec()),
            _ => Value::Null,
        })
        .collect();
    Some(NaturalId::new(values))
}

fn reference_value(reference: &ormstate_core::EntityReference) -> Value {
    use ormstate_core::EntityReference;
    let id = match reference {
        EntityReference::Loaded(handle) => handle.id(),
        EntityReference::NotLoaded(key) | EntityReference::Removed(key) => Some(key.id().clone()),
    };
    id.map_or(Value::Null, |id| Value::Array(id.values().to_vec()))
}

#[derive(Debug, Default)]
struct EntityResolutions {
    id_by_natural_id: HashMap<NaturalId, Identifier>,
    natural_id_by_id: HashMap<Identifier, NaturalId>,
}

/// Session-scoped natural id resolutions, per hierarchy root.
#[derive(Debug, Default)]
pub struct NaturalIdResolutions {
    by_entity: HashMap<String, EntityResolutions>,
}

impl NaturalIdResolutions {
    /// Create an empty set of resolutions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the natural id of an entity just loaded. Returns `false`
    /// when the entity has no natural id.
    pub fn cache_natural_id_from_load(
        &mut self,
        descriptor: &EntityDescriptor,
        id: &Identifier,
        state: &[AttributeValue],
    ) -> bool {
        let Some(natural_id) = extract_natural_id_values(state, descriptor) else {
            return false;
        };
        tracing::trace!(
            entity = descriptor.name(),
            id = %id,
            natural_id = ?natural_id.values(),
            "Caching natural id resolution"
        );
        let resolutions = self
            .by_entity
            .entry(descriptor.root_name().to_string())
            .or_default();
        if let Some(previous) = resolutions
            .natural_id_by_id
            .insert(id.clone(), natural_id.clone())
        {
            resolutions.id_by_natural_id.remove(&previous);
        }
        resolutions.id_by_natural_id.insert(natural_id, id.clone());
        true
    }

    /// Identifier for natural id values of a hierarchy.
    pub fn find_id(&self, root_entity: &str, natural_id: &NaturalId) -> Option<&Identifier> {
        self.by_entity
            .get(root_entity)?
            .id_by_natural_id
            .get(natural_id)
    }

    /// Natural id of a loaded entity.
    pub fn find_natural_id(&self, key: &EntityKey) -> Option<&NaturalId> {
        self.by_entity
            .get(key.entity_name())?
            .natural_id_by_id
            .get(key.id())
    }

    /// Forget the resolution of `key`.
    pub fn remove(&mut self, key: &EntityKey) -> Option<NaturalId> {
        let resolutions = self.by_entity.get_mut(key.entity_name())?;
        let natural_id = resolutions.natural_id_by_id.remove(key.id())?;
        resolutions.id_by_natural_id.remove(&natural_id);
        Some(natural_id)
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.by_entity.clear();
    }
}
