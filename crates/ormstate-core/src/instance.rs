//! Entity instances and their attribute values.
//!
//! Entities are represented dynamically: an [`EntityInstance`] carries its
//! entity name, identifier and a positional array of [`AttributeValue`]s laid
//! out in the order of its descriptor's attributes. Instances are shared
//! through [`EntityHandle`], an `Arc<RwLock<_>>` whose identity (not its
//! contents) is what the persistence context tracks.

use crate::key::{EntityKey, Identifier};
use crate::value::Value;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an in-memory entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value (useful in logs).
    pub fn get(self) -> u64 {
        self.0
    }
}

/// The state of one entity object.
#[derive(Debug, Clone)]
pub struct EntityInstance {
    entity_name: String,
    id: Option<Identifier>,
    values: Vec<AttributeValue>,
}

impl EntityInstance {
    /// Create an instance with no identifier and all attributes null.
    pub fn new(entity_name: impl Into<String>, attribute_count: usize) -> Self {
        Self {
            entity_name: entity_name.into(),
            id: None,
            values: vec![AttributeValue::Null; attribute_count],
        }
    }

    /// Create an instance with the given identifier and attribute values.
    pub fn with_values(
        entity_name: impl Into<String>,
        id: Option<Identifier>,
        values: Vec<AttributeValue>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            values,
        }
    }

    /// The (concrete) entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// The identifier, if one has been assigned.
    pub fn id(&self) -> Option<&Identifier> {
        self.id.as_ref()
    }

    /// Assign or clear the identifier.
    pub fn set_id(&mut self, id: Option<Identifier>) {
        self.id = id;
    }

    /// All attribute values in descriptor order.
    pub fn values(&self) -> &[AttributeValue] {
        &self.values
    }

    /// The value at attribute position `index`.
    pub fn value(&self, index: usize) -> Option<&AttributeValue> {
        self.values.get(index)
    }

    /// Replace one attribute value. Out-of-range positions are ignored.
    pub fn set_value(&mut self, index: usize, value: AttributeValue) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    /// Replace the whole attribute array.
    pub fn set_values(&mut self, values: Vec<AttributeValue>) {
        self.values = values;
    }
}

/// Shared handle to an entity instance.
///
/// Two handles are equal only when they point at the same instance.
#[derive(Clone)]
pub struct EntityHandle {
    instance_id: InstanceId,
    inner: Arc<RwLock<EntityInstance>>,
}

impl EntityHandle {
    /// Wrap a fresh instance.
    pub fn new(instance: EntityInstance) -> Self {
        Self {
            instance_id: InstanceId::next(),
            inner: Arc::new(RwLock::new(instance)),
        }
    }

    /// The instance identity.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Read access to the instance state.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityInstance> {
        self.inner.read()
    }

    /// Write access to the instance state.
    pub fn write(&self) -> RwLockWriteGuard<'_, EntityInstance> {
        self.inner.write()
    }

    /// The instance's entity name.
    pub fn entity_name(&self) -> String {
        self.inner.read().entity_name().to_string()
    }

    /// The instance's identifier, if any.
    pub fn id(&self) -> Option<Identifier> {
        self.inner.read().id().cloned()
    }

    /// Whether both handles refer to the same instance.
    pub fn same_instance(&self, other: &EntityHandle) -> bool {
        self.instance_id == other.instance_id
    }

    /// Human readable description used in error messages.
    pub fn describe(&self) -> String {
        let guard = self.inner.read();
        match guard.id() {
            Some(id) => format!("{}#{}", guard.entity_name(), id),
            None => format!("{}#<unsaved:{}>", guard.entity_name(), self.instance_id.0),
        }
    }
}

impl PartialEq for EntityHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other)
    }
}

impl Eq for EntityHandle {}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityHandle({}@{})", self.describe(), self.instance_id.0)
    }
}

/// A reference from one entity to another.
///
/// Lazy proxies are modelled explicitly: an uninitialized proxy is
/// `NotLoaded(key)` and unwrapping is a pattern match, not a side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityReference {
    /// The referenced instance is in memory.
    Loaded(EntityHandle),
    /// Uninitialized proxy for a row known to exist.
    NotLoaded(EntityKey),
    /// The referenced entity has been removed in this unit of work.
    Removed(EntityKey),
}

impl EntityReference {
    /// The in-memory instance, if loaded.
    pub fn handle(&self) -> Option<&EntityHandle> {
        match self {
            EntityReference::Loaded(h) => Some(h),
            _ => None,
        }
    }

    /// Description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            EntityReference::Loaded(h) => h.describe(),
            EntityReference::NotLoaded(key) => format!("{key} (proxy)"),
            EntityReference::Removed(key) => format!("{key} (removed)"),
        }
    }
}

/// Value of a composite (embedded) attribute.
///
/// The child array is owned by the containing entity's state; replacing
/// children always installs a new vector through [`EmbeddedValue::replace_values`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedValue {
    values: Vec<AttributeValue>,
}

impl EmbeddedValue {
    /// Create an embedded value from its children, in embeddable attribute order.
    pub fn new(values: Vec<AttributeValue>) -> Self {
        Self { values }
    }

    /// Child values.
    pub fn values(&self) -> &[AttributeValue] {
        &self.values
    }

    /// Install a new child array, returning the previous one.
    pub fn replace_values(&mut self, values: Vec<AttributeValue>) -> Vec<AttributeValue> {
        std::mem::replace(&mut self.values, values)
    }
}

/// One attribute value in hydrated or materialized state.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// SQL NULL / no reference.
    Null,
    /// Scalar column value.
    Basic(Value),
    /// Composite value.
    Embedded(EmbeddedValue),
    /// Resolved association.
    Entity(EntityReference),
    /// Hydrated but not yet resolved to-one foreign key.
    ForeignKey(Identifier),
    /// Hydrated but not yet resolved polymorphic (`Any`) reference.
    AnyKey {
        /// Concrete entity name read from the discriminator column.
        entity_name: String,
        /// Identifier of the referenced row.
        id: Identifier,
    },
    /// Lazy property that has not been fetched.
    Unfetched,
}

impl AttributeValue {
    /// Reference an in-memory entity.
    pub fn entity(handle: &EntityHandle) -> Self {
        AttributeValue::Entity(EntityReference::Loaded(handle.clone()))
    }

    /// Wrap a scalar; `Value::Null` becomes [`AttributeValue::Null`].
    pub fn basic(value: impl Into<Value>) -> Self {
        match value.into() {
            Value::Null => AttributeValue::Null,
            v => AttributeValue::Basic(v),
        }
    }

    /// Build an embedded value.
    pub fn embedded(values: Vec<AttributeValue>) -> Self {
        AttributeValue::Embedded(EmbeddedValue::new(values))
    }

    /// Whether this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// The scalar, if this is a basic value.
    pub fn as_basic(&self) -> Option<&Value> {
        match self {
            AttributeValue::Basic(v) => Some(v),
            _ => None,
        }
    }

    /// The association, if this is a resolved reference.
    pub fn as_reference(&self) -> Option<&EntityReference> {
        match self {
            AttributeValue::Entity(r) => Some(r),
            _ => None,
        }
    }

    /// The embedded value, if this is a composite.
    pub fn as_embedded(&self) -> Option<&EmbeddedValue> {
        match self {
            AttributeValue::Embedded(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this value still needs association resolution.
    pub fn is_unresolved(&self) -> bool {
        match self {
            AttributeValue::ForeignKey(_) | AttributeValue::AnyKey { .. } => true,
            AttributeValue::Embedded(e) => e.values().iter().any(AttributeValue::is_unresolved),
            _ => false,
        }
    }

    /// Description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            AttributeValue::Null => "null".to_string(),
            AttributeValue::Basic(v) => v.to_string(),
            AttributeValue::Embedded(_) => "<embedded>".to_string(),
            AttributeValue::Entity(r) => r.describe(),
            AttributeValue::ForeignKey(id) => format!("<fk {id}>"),
            AttributeValue::AnyKey { entity_name, id } => format!("<any {entity_name}#{id}>"),
            AttributeValue::Unfetched => "<unfetched>".to_string(),
        }
    }
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        AttributeValue::basic(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_identity_not_content() {
        let a = EntityHandle::new(EntityInstance::new("Customer", 1));
        let b = EntityHandle::new(EntityInstance::new("Customer", 1));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.same_instance(&a.clone()));
    }

    #[test]
    fn test_modifications_visible_through_clones() {
        let a = EntityHandle::new(EntityInstance::new("Customer", 1));
        let b = a.clone();
        a.write().set_value(0, AttributeValue::basic("Alice"));
        assert_eq!(
            b.read().value(0),
            Some(&AttributeValue::Basic(Value::Text("Alice".into())))
        );
    }

    #[test]
    fn test_basic_null_collapses() {
        assert_eq!(AttributeValue::basic(Value::Null), AttributeValue::Null);
        assert!(AttributeValue::basic(None::<i64>).is_null());
    }

    #[test]
    fn test_unresolved_detection_recurses_into_embedded() {
        let nested = AttributeValue::embedded(vec![
            AttributeValue::basic("Main St"),
            AttributeValue::ForeignKey(Identifier::from(3)),
        ]);
        assert!(nested.is_unresolved());
        assert!(!AttributeValue::Unfetched.is_unresolved());
    }

    #[test]
    fn test_describe_unsaved_handle() {
        let h = EntityHandle::new(EntityInstance::new("Customer", 0));
        assert!(h.describe().starts_with("Customer#<unsaved:"));
        h.write().set_id(Some(Identifier::from(9)));
        assert_eq!(h.describe(), "Customer#9");
    }
}
