//! Second-level (cross-session) entity cache access.
//!
//! Materialized entities are disassembled into a serializable [`CacheEntry`]
//! and written to a region through [`EntityDataAccess`]. The region decides
//! whether to accept a put; refusals are normal and never surface as errors.

use ormstate_core::{
    AttributeKind, AttributeValue, EntityDescriptor, EntityReference, Identifier, Result, Value,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// How a session interacts with the second-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Read and write.
    #[default]
    Normal,
    /// Read only.
    Get,
    /// Write only.
    Put,
    /// Write only, ignoring minimal puts.
    Refresh,
    /// No interaction.
    Ignore,
}

impl CacheMode {
    /// Whether reads consult the cache.
    pub const fn is_get_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    /// Whether loads write to the cache.
    pub const fn is_put_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }
}

/// Key of a cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    id: Identifier,
    entity_name: String,
    tenant_id: Option<String>,
}

impl CacheKey {
    /// Create a key from identifier, hierarchy root name and tenant.
    pub fn new(id: Identifier, entity_name: impl Into<String>, tenant_id: Option<String>) -> Self {
        Self {
            id,
            entity_name: entity_name.into(),
            tenant_id,
        }
    }

    /// The identifier.
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// The hierarchy root entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// The tenant, if multi-tenant.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }
}

/// One disassembled attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedValue {
    /// No value
    Null,
    /// Scalar
    Basic(Value),
    /// Composite children
    Embedded(Vec<CachedValue>),
    /// Association, stored as the target's key
    Reference {
        /// Target entity name
        entity_name: String,
        /// Target identifier
        id: Identifier,
    },
    /// Lazy property not fetched
    Unfetched,
}

impl CachedValue {
    fn disassemble(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Null => CachedValue::Null,
            AttributeValue::Basic(v) => CachedValue::Basic(v.clone()),
            AttributeValue::Embedded(e) => {
                CachedValue::Embedded(e.values().iter().map(CachedValue::disassemble).collect())
            }
            AttributeValue::Entity(EntityReference::Loaded(handle)) => match handle.id() {
                Some(id) => CachedValue::Reference {
                    entity_name: handle.entity_name(),
                    id,
                },
                None => {
                    tracing::warn!(
                        entity = %handle.describe(),
                        "Reference without identifier cached as null"
                    );
                    CachedValue::Null
                }
            },
            AttributeValue::Entity(
                EntityReference::NotLoaded(key) | EntityReference::Removed(key),
            ) => CachedValue::Reference {
                entity_name: key.entity_name().to_string(),
                id: key.id().clone(),
            },
            AttributeValue::ForeignKey(id) => CachedValue::Basic(id_value(id)),
            AttributeValue::AnyKey { entity_name, id } => CachedValue::Reference {
                entity_name: entity_name.clone(),
                id: id.clone(),
            },
            AttributeValue::Unfetched => CachedValue::Unfetched,
        }
    }

    fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            CachedValue::Null => serde_json::Value::Null,
            CachedValue::Basic(v) => serde_json::to_value(v)?,
            CachedValue::Embedded(children) => serde_json::Value::Array(
                children
                    .iter()
                    .map(CachedValue::to_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            CachedValue::Reference { entity_name, id } => serde_json::json!({
                "entity": entity_name,
                "id": serde_json::to_value(id)?,
            }),
            CachedValue::Unfetched => serde_json::Value::String("<unfetched>".to_string()),
        })
    }
}

fn id_value(id: &Identifier) -> Value {
    match id.values() {
        [single] => single.clone(),
        values => Value::Array(values.to_vec()),
    }
}

/// Disassembled entity state as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    subclass: String,
    version: Option<Value>,
    state: Vec<CachedValue>,
}

impl CacheEntry {
    /// Disassemble a materialized state array.
    pub fn disassemble(
        descriptor: &EntityDescriptor,
        state: &[AttributeValue],
        version: Option<Value>,
    ) -> Self {
        Self {
            subclass: descriptor.name().to_string(),
            version,
            state: state.iter().map(CachedValue::disassemble).collect(),
        }
    }

    /// Concrete entity name of the cached instance.
    pub fn subclass(&self) -> &str {
        &self.subclass
    }

    /// Version at the time of caching.
    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    /// Disassembled attribute values.
    pub fn state(&self) -> &[CachedValue] {
        &self.state
    }

    /// Structured (human-readable) form: a map keyed by attribute name.
    pub fn structure(&self, descriptor: &EntityDescriptor) -> Result<serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert(
            "_subclass".to_string(),
            serde_json::Value::String(self.subclass.clone()),
        );
        if let Some(version) = &self.version {
            map.insert("_version".to_string(), serde_json::to_value(version)?);
        }
        for (attribute, value) in descriptor.attributes().iter().zip(&self.state) {
            let json = match (&attribute.kind, value) {
                (AttributeKind::Embedded(embeddable), CachedValue::Embedded(children)) => {
                    let mut nested = serde_json::Map::new();
                    for (child, child_value) in embeddable.attributes.iter().zip(children) {
                        nested.insert(child.name.clone(), child_value.to_json()?);
                    }
                    serde_json::Value::Object(nested)
                }
                _ => value.to_json()?,
            };
            map.insert(attribute.name.clone(), json);
        }
        Ok(serde_json::Value::Object(map))
    }
}

/// What a region stores for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    /// Standard disassembled entry
    Entry(CacheEntry),
    /// Structured entry
    Structured(serde_json::Value),
}

/// Token returned by [`EntityDataAccess::lock_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftLock(u64);

/// Access strategy for one entity cache region.
pub trait EntityDataAccess: Send + Sync {
    /// Region name.
    fn region_name(&self) -> &str;

    /// Build the key for an entity.
    fn generate_cache_key(
        &self,
        id: &Identifier,
        entity_name: &str,
        tenant_id: Option<&str>,
    ) -> CacheKey {
        CacheKey::new(id.clone(), entity_name, tenant_id.map(str::to_string))
    }

    /// Read an entry; `None` on miss or while the item is locked.
    fn get(&self, key: &CacheKey) -> Option<CacheValue>;

    /// Cache state read from the database. Returns whether the put happened.
    fn put_from_load(
        &self,
        key: &CacheKey,
        value: CacheValue,
        version: Option<&Value>,
        minimal_put: bool,
    ) -> bool;

    /// Replace an entry after a write in this transaction. Returns whether
    /// the cache was changed.
    fn update(
        &self,
        key: &CacheKey,
        value: CacheValue,
        current_version: Option<&Value>,
        previous_version: Option<&Value>,
    ) -> bool;

    /// Soft-lock an item ahead of a write.
    fn lock_item(&self, key: &CacheKey, version: Option<&Value>) -> SoftLock;

    /// Release a soft lock.
    fn unlock_item(&self, key: &CacheKey, lock: SoftLock);

    /// Drop an item.
    fn evict(&self, key: &CacheKey);
}

#[derive(Debug, Clone)]
enum CacheItem {
    Value {
        value: CacheValue,
        version: Option<Value>,
    },
    Locked {
        lock: SoftLock,
        pending: Option<(CacheValue, Option<Value>)>,
    },
}

/// Order two version values; `None` when they are not comparable.
fn compare_versions(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Timestamp(x), Value::Timestamp(y))
        | (Value::TimestampTz(x), Value::TimestampTz(y)) => Some(x.cmp(y)),
        _ => Some(a.as_i64()?.cmp(&b.as_i64()?)),
    }
}

fn is_stale(existing: Option<&Value>, incoming: Option<&Value>) -> bool {
    match (existing, incoming) {
        (Some(existing), Some(incoming)) => {
            compare_versions(existing, incoming) == Some(Ordering::Greater)
        }
        _ => false,
    }
}

/// Thread-safe in-memory region with read-write soft locking.
#[derive(Debug)]
pub struct InMemoryEntityRegion {
    name: String,
    items: RwLock<HashMap<CacheKey, CacheItem>>,
    next_lock: AtomicU64,
}

impl InMemoryEntityRegion {
    /// Create an empty region.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: RwLock::new(HashMap::new()),
            next_lock: AtomicU64::new(1),
        }
    }

    /// Number of items, locked ones included.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the region holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Whether `key` is currently soft-locked.
    pub fn is_locked(&self, key: &CacheKey) -> bool {
        matches!(self.items.read().get(key), Some(CacheItem::Locked { .. }))
    }

    /// Drop every item.
    pub fn clear(&self) {
        self.items.write().clear();
    }
}

impl EntityDataAccess for InMemoryEntityRegion {
    fn region_name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        match self.items.read().get(key)? {
            CacheItem::Value { value, .. } => Some(value.clone()),
            CacheItem::Locked { .. } => None,
        }
    }

    fn put_from_load(
        &self,
        key: &CacheKey,
        value: CacheValue,
        version: Option<&Value>,
        minimal_put: bool,
    ) -> bool {
        let mut items = self.items.write();
        match items.get(key) {
            Some(CacheItem::Locked { .. }) => {
                tracing::debug!(region = %self.name, key = ?key, "Refusing put: item is soft-locked");
                return false;
            }
            Some(CacheItem::Value { .. }) if minimal_put => {
                tracing::trace!(region = %self.name, key = ?key, "Refusing minimal put: item cached");
                return false;
            }
            Some(CacheItem::Value {
                version: existing, ..
            }) if is_stale(existing.as_ref(), version) => {
                tracing::debug!(region = %self.name, key = ?key, "Refusing put: stale version");
                return false;
            }
            _ => {}
        }
        items.insert(
            key.clone(),
            CacheItem::Value {
                value,
                version: version.cloned(),
            },
        );
        true
    }

    fn update(
        &self,
        key: &CacheKey,
        value: CacheValue,
        current_version: Option<&Value>,
        _previous_version: Option<&Value>,
    ) -> bool {
        let mut items = self.items.write();
        if let Some(CacheItem::Locked { pending, .. }) = items.get_mut(key) {
            *pending = Some((value, current_version.cloned()));
            return true;
        }
        if matches!(
            items.get(key),
            Some(CacheItem::Value { version: existing, .. }) if is_stale(existing.as_ref(), current_version)
        ) {
            return false;
        }
        items.insert(
            key.clone(),
            CacheItem::Value {
                value,
                version: current_version.cloned(),
            },
        );
        true
    }

    fn lock_item(&self, key: &CacheKey, _version: Option<&Value>) -> SoftLock {
        let lock = SoftLock(self.next_lock.fetch_add(1, AtomicOrdering::Relaxed));
        self.items.write().insert(
            key.clone(),
            CacheItem::Locked {
                lock,
                pending: None,
            },
        );
        lock
    }

    fn unlock_item(&self, key: &CacheKey, lock: SoftLock) {
        let mut items = self.items.write();
        let Some(CacheItem::Locked {
            lock: held,
            pending,
        }) = items.get_mut(key)
        else {
            return;
        };
        if *held != lock {
            return;
        }
        match pending.take() {
            Some((value, version)) => {
                items.insert(key.clone(), CacheItem::Value { value, version });
            }
            None => {
                items.remove(key);
            }
        }
    }

    fn evict(&self, key: &CacheKey) {
        self.items.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormstate_core::{
        AttributeDescriptor, EmbeddableDescriptor, EntityHandle, EntityInstance, IdGenerator,
        IdentifierDescriptor,
    };

    fn key(id: i64) -> CacheKey {
        CacheKey::new(Identifier::from(id), "Order", None)
    }

    fn entry(n: i64) -> CacheValue {
        CacheValue::Entry(CacheEntry {
            subclass: "Order".into(),
            version: Some(Value::BigInt(n)),
            state: vec![CachedValue::Basic(Value::BigInt(n))],
        })
    }

    #[test]
    fn test_cache_modes() {
        assert!(CacheMode::Normal.is_get_enabled() && CacheMode::Normal.is_put_enabled());
        assert!(!CacheMode::Put.is_get_enabled());
        assert!(CacheMode::Refresh.is_put_enabled());
        assert!(!CacheMode::Get.is_put_enabled());
        assert!(!CacheMode::Ignore.is_get_enabled() && !CacheMode::Ignore.is_put_enabled());
    }

    #[test]
    fn test_put_and_get() {
        let region = InMemoryEntityRegion::new("orders");
        assert!(region.get(&key(1)).is_none());
        assert!(region.put_from_load(&key(1), entry(1), Some(&Value::BigInt(1)), false));
        assert_eq!(region.get(&key(1)), Some(entry(1)));
    }

    #[test]
    fn test_minimal_put_refused_when_present() {
        let region = InMemoryEntityRegion::new("orders");
        assert!(region.put_from_load(&key(1), entry(1), None, true));
        assert!(!region.put_from_load(&key(1), entry(2), None, true));
        assert_eq!(region.get(&key(1)), Some(entry(1)));
    }

    #[test]
    fn test_stale_version_refused() {
        let region = InMemoryEntityRegion::new("orders");
        assert!(region.put_from_load(&key(1), entry(5), Some(&Value::BigInt(5)), false));
        assert!(!region.put_from_load(&key(1), entry(4), Some(&Value::BigInt(4)), false));
        assert!(region.put_from_load(&key(1), entry(6), Some(&Value::BigInt(6)), false));
    }

    #[test]
    fn test_locked_item_refuses_put_and_update_keeps_lock() {
        let region = InMemoryEntityRegion::new("orders");
        let lock = region.lock_item(&key(1), None);
        assert!(!region.put_from_load(&key(1), entry(1), None, false));
        assert!(region.get(&key(1)).is_none());

        assert!(region.update(&key(1), entry(2), Some(&Value::BigInt(2)), None));
        assert!(region.is_locked(&key(1)));

        region.unlock_item(&key(1), lock);
        assert_eq!(region.get(&key(1)), Some(entry(2)));
    }

    #[test]
    fn test_unlock_with_wrong_token_is_ignored() {
        let region = InMemoryEntityRegion::new("orders");
        let _lock = region.lock_item(&key(1), None);
        region.unlock_item(&key(1), SoftLock(999));
        assert!(region.is_locked(&key(1)));
    }

    #[test]
    fn test_structured_entry() {
        let address = EmbeddableDescriptor::new("Address", vec![AttributeDescriptor::basic("street")]);
        let d = EntityDescriptor::new("Customer", IdentifierDescriptor::new("id", IdGenerator::Sequence))
            .attribute(AttributeDescriptor::basic("name"))
            .attribute(AttributeDescriptor::embedded("address", address))
            .attribute(AttributeDescriptor::many_to_one("referrer", "Customer"));
        let referrer = EntityHandle::new(EntityInstance::with_values(
            "Customer",
            Some(Identifier::from(3)),
            vec![],
        ));
        let state = vec![
            AttributeValue::basic("Alice"),
            AttributeValue::embedded(vec![AttributeValue::basic("Main St")]),
            AttributeValue::entity(&referrer),
        ];
        let json = CacheEntry::disassemble(&d, &state, None).structure(&d).unwrap();
        assert_eq!(json["_subclass"], "Customer");
        assert_eq!(json["address"]["street"]["Text"], "Main St");
        assert_eq!(json["referrer"]["entity"], "Customer");
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unidentified_reference_is_cached_as_null_with_warning() {
        let d = EntityDescriptor::new("Customer", IdentifierDescriptor::new("id", IdGenerator::Sequence))
            .attribute(AttributeDescriptor::many_to_one("referrer", "Customer"));
        let unsaved = EntityHandle::new(EntityInstance::new("Customer", 1));
        let state = vec![AttributeValue::entity(&unsaved)];

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let entry = tracing::subscriber::with_default(subscriber, || {
            CacheEntry::disassemble(&d, &state, None)
        });

        assert_eq!(entry.state(), &[CachedValue::Null]);
        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("Reference without identifier cached as null"));
    }
}
