//! Persistence context: the identity registry of one unit of work.
//!
//! The context ensures that each database row corresponds to exactly one
//! in-memory instance within a session. Instances are tracked by handle
//! identity ([`InstanceId`]); rows by [`EntityKey`]. For every tracked
//! instance there is one [`EntityEntry`] carrying its lifecycle status,
//! loaded state and dirty-checking snapshot.
//!
//! # Example
//!
//! ```ignore
//! let mut context = PersistenceContext::new();
//! context.add_entity(&handle, Some(key.clone()), EntityStatus::Loading, ..)?;
//!
//! // Same key, same instance
//! assert!(context.get_entity(&key).unwrap().same_instance(&handle));
//! ```

use crate::change_tracker::ObjectSnapshot;
use ormstate_core::{
    AttributeValue, EntityDescriptor, EntityHandle, EntityKey, Error, InstanceId, Result, Value,
};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

/// Lifecycle status of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Being materialized from a row.
    Loading,
    /// Scheduled for INSERT, not yet written.
    Saving,
    /// Persistent and dirty-checked.
    Managed,
    /// Persistent, never dirty-checked.
    ReadOnly,
    /// Scheduled for DELETE.
    Deleted,
    /// Deleted and flushed.
    Gone,
}

impl EntityStatus {
    /// Whether the instance is going away.
    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Gone)
    }
}

/// Lock level held on a loaded row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// No lock.
    #[default]
    None,
    /// Shared read (the row was read in this transaction).
    Read,
    /// Optimistic version check at commit.
    Optimistic,
    /// `SELECT ... FOR SHARE`
    PessimisticRead,
    /// `SELECT ... FOR UPDATE`
    PessimisticWrite,
}

impl LockMode {
    /// Lock modes the load pipeline can honour.
    pub const fn is_supported_for_load(self) -> bool {
        matches!(self, LockMode::None | LockMode::Read)
    }
}

/// Tracking record for one instance within a unit of work.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    key: Option<EntityKey>,
    entity_name: String,
    status: EntityStatus,
    loaded_state: Option<Vec<AttributeValue>>,
    version: Option<Value>,
    lock_mode: LockMode,
    exists_in_database: bool,
    mutable: bool,
    snapshot: Option<ObjectSnapshot>,
}

impl EntityEntry {
    /// Identity key; `None` until a generated identifier is known.
    pub fn key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    /// Concrete entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Current status.
    pub fn status(&self) -> EntityStatus {
        self.status
    }

    /// State as last loaded or inserted.
    pub fn loaded_state(&self) -> Option<&[AttributeValue]> {
        self.loaded_state.as_deref()
    }

    /// Replace the loaded state.
    pub fn set_loaded_state(&mut self, state: Vec<AttributeValue>) {
        self.loaded_state = Some(state);
    }

    /// Version value as loaded.
    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    /// Lock held on the row.
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Whether the row exists in the database.
    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Whether the entity type is mutable.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Whether the entry is read-only.
    pub fn is_read_only(&self) -> bool {
        self.status == EntityStatus::ReadOnly
    }

    /// Dirty-checking snapshot (absent for read-only entries).
    pub fn snapshot(&self) -> Option<&ObjectSnapshot> {
        self.snapshot.as_ref()
    }

    /// Install or drop the dirty-checking snapshot.
    pub fn set_snapshot(&mut self, snapshot: Option<ObjectSnapshot>) {
        self.snapshot = snapshot;
    }

    /// Record a successful INSERT.
    pub(crate) fn post_insert(&mut self, state: Vec<AttributeValue>, version: Option<Value>) {
        self.exists_in_database = true;
        self.loaded_state = Some(state);
        self.version = version;
        self.status = EntityStatus::Managed;
    }

    /// Whether a foreign key pointing at this instance must be nulled out
    /// for an insert to succeed.
    pub fn is_nullifiable(&self, early_insert: bool, context: &PersistenceContext) -> bool {
        if self.status == EntityStatus::Saving {
            return true;
        }
        if early_insert {
            return !self.exists_in_database;
        }
        self.key
            .as_ref()
            .is_some_and(|key| context.is_nullifiable_entity_key(key))
    }
}

/// Lazy-proxy bookkeeping for a key whose instance is not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyState {
    read_only: bool,
}

impl ProxyState {
    /// Whether the instance behind the proxy will be read-only.
    pub fn is_read_only(self) -> bool {
        self.read_only
    }
}

/// Anything that can fetch the current database state of a row.
pub trait SnapshotSource {
    /// Select the row for `id`, or `None` when no such row exists.
    fn select_snapshot(
        &self,
        descriptor: &EntityDescriptor,
        id: &ormstate_core::Identifier,
    ) -> Result<Option<Vec<Value>>>;
}

impl<F> SnapshotSource for F
where
    F: Fn(&EntityDescriptor, &ormstate_core::Identifier) -> Result<Option<Vec<Value>>>,
{
    fn select_snapshot(
        &self,
        descriptor: &EntityDescriptor,
        id: &ormstate_core::Identifier,
    ) -> Result<Option<Vec<Value>>> {
        self(descriptor, id)
    }
}

/// Identity registry for one unit of work.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    /// Instance identity -> entry
    entries: HashMap<InstanceId, EntityEntry>,
    /// Identity key -> instance
    entities: HashMap<EntityKey, EntityHandle>,
    /// Uninitialized proxies by key
    proxies: HashMap<EntityKey, ProxyState>,
    /// Memoised database snapshots; `None` records "no row"
    snapshots: HashMap<EntityKey, Option<Vec<Value>>>,
    /// Keys of entities being deleted in this flush
    nullifiable_entity_keys: HashSet<EntityKey>,
    /// Keys inserted during the current transaction
    inserted_during_transaction: HashSet<EntityKey>,
}

impl PersistenceContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance.
    ///
    /// Fails with [`Error::NonUniqueObject`] when a different instance is
    /// already registered for `key`. Re-registering the same instance
    /// replaces its entry.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entity(
        &mut self,
        handle: &EntityHandle,
        key: Option<EntityKey>,
        status: EntityStatus,
        loaded_state: Option<Vec<AttributeValue>>,
        version: Option<Value>,
        lock_mode: LockMode,
        exists_in_database: bool,
        descriptor: &EntityDescriptor,
    ) -> Result<&mut EntityEntry> {
        if let Some(key) = &key {
            self.claim_key(handle, key)?;
        }
        tracing::trace!(
            entity = descriptor.name(),
            key = ?key.as_ref().map(ToString::to_string),
            status = ?status,
            "Adding entity entry"
        );
        let entry = EntityEntry {
            key,
            entity_name: descriptor.name().to_string(),
            status,
            loaded_state,
            version,
            lock_mode,
            exists_in_database,
            mutable: descriptor.is_mutable(),
            snapshot: None,
        };
        match self.entries.entry(handle.instance_id()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
                Ok(occupied.into_mut())
            }
            Entry::Vacant(vacant) => Ok(vacant.insert(entry)),
        }
    }

    fn claim_key(&mut self, handle: &EntityHandle, key: &EntityKey) -> Result<()> {
        match self.entities.get(key) {
            Some(existing) if !existing.same_instance(handle) => Err(Error::NonUniqueObject {
                key: key.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                self.entities.insert(key.clone(), handle.clone());
                Ok(())
            }
        }
    }

    /// Assign the identity key of an entry created without one.
    ///
    /// Fails if the instance has no entry or already has a different key.
    pub fn assign_key(&mut self, handle: &EntityHandle, key: EntityKey) -> Result<()> {
        let current = self
            .entries
            .get(&handle.instance_id())
            .ok_or_else(|| Error::TransientObject {
                entity: handle.entity_name(),
            })?
            .key
            .clone();
        match current {
            Some(existing) if existing != key => Err(Error::Custom(format!(
                "identity key of {existing} cannot change to {key}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.claim_key(handle, &key)?;
                if let Some(entry) = self.entries.get_mut(&handle.instance_id()) {
                    entry.key = Some(key);
                }
                Ok(())
            }
        }
    }

    /// The entry for an instance.
    pub fn get_entry(&self, handle: &EntityHandle) -> Option<&EntityEntry> {
        self.entries.get(&handle.instance_id())
    }

    /// Mutable entry for an instance.
    pub fn get_entry_mut(&mut self, handle: &EntityHandle) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&handle.instance_id())
    }

    /// The entry of the instance registered under `key`.
    pub fn entry_for_key(&self, key: &EntityKey) -> Option<&EntityEntry> {
        let handle = self.entities.get(key)?;
        self.entries.get(&handle.instance_id())
    }

    /// The instance registered under `key`.
    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityHandle> {
        self.entities.get(key).cloned()
    }

    /// Whether the instance is tracked.
    pub fn is_entry_for(&self, handle: &EntityHandle) -> bool {
        self.entries.contains_key(&handle.instance_id())
    }

    /// Whether an instance is registered under `key`.
    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    /// Change the status of a tracked instance. Returns `false` if untracked.
    pub fn set_entry_status(&mut self, handle: &EntityHandle, status: EntityStatus) -> bool {
        match self.entries.get_mut(&handle.instance_id()) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Forget the instance registered under `key`.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityHandle> {
        let handle = self.entities.remove(key)?;
        self.entries.remove(&handle.instance_id());
        self.snapshots.remove(key);
        self.nullifiable_entity_keys.remove(key);
        Some(handle)
    }

    /// Forget an instance that never received a key.
    pub fn remove_entry(&mut self, handle: &EntityHandle) -> Option<EntityEntry> {
        let entry = self.entries.remove(&handle.instance_id())?;
        if let Some(key) = &entry.key {
            self.entities.remove(key);
        }
        Some(entry)
    }

    /// All keyed instances.
    pub fn entries(&self) -> impl Iterator<Item = (&EntityKey, &EntityHandle)> {
        self.entities.iter()
    }

    /// Number of tracked instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------

    /// Register an uninitialized proxy for `key` unless one exists.
    pub fn add_proxy(&mut self, key: EntityKey, read_only: bool) -> ProxyState {
        *self.proxies.entry(key).or_insert(ProxyState { read_only })
    }

    /// The proxy registered for `key`.
    pub fn get_proxy(&self, key: &EntityKey) -> Option<ProxyState> {
        self.proxies.get(key).copied()
    }

    /// Change the read-only flag of a registered proxy.
    pub fn set_proxy_read_only(&mut self, key: &EntityKey, read_only: bool) -> bool {
        match self.proxies.get_mut(key) {
            Some(proxy) => {
                proxy.read_only = read_only;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Database snapshots
    // ------------------------------------------------------------------

    /// Current database state of a row, memoised per key (including the
    /// "no row" answer).
    pub fn get_database_snapshot(
        &mut self,
        key: &EntityKey,
        descriptor: &EntityDescriptor,
        source: &dyn SnapshotSource,
    ) -> Result<Option<Vec<Value>>> {
        if let Some(cached) = self.snapshots.get(key) {
            return Ok(cached.clone());
        }
        let snapshot = source.select_snapshot(descriptor, key.id())?;
        tracing::trace!(key = %key, found = snapshot.is_some(), "Database snapshot fetched");
        self.snapshots.insert(key.clone(), snapshot.clone());
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Deletes and inserts in flight
    // ------------------------------------------------------------------

    /// Mark `key` as being deleted in this flush.
    pub fn register_nullifiable_entity_key(&mut self, key: EntityKey) {
        self.nullifiable_entity_keys.insert(key);
    }

    /// Whether `key` is being deleted in this flush.
    pub fn is_nullifiable_entity_key(&self, key: &EntityKey) -> bool {
        self.nullifiable_entity_keys.contains(key)
    }

    /// Record that `key` was inserted in the current transaction.
    pub fn register_insert_during_transaction(&mut self, key: EntityKey) {
        self.inserted_during_transaction.insert(key);
    }

    /// Whether `key` was inserted in the current transaction.
    pub fn was_inserted_during_transaction(&self, key: &EntityKey) -> bool {
        self.inserted_during_transaction.contains(key)
    }

    /// Transaction completed: forget transaction-scoped bookkeeping.
    pub fn end_transaction(&mut self) {
        self.inserted_during_transaction.clear();
    }

    /// End the unit of work.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entities.clear();
        self.proxies.clear();
        self.snapshots.clear();
        self.nullifiable_entity_keys.clear();
        self.inserted_during_transaction.clear();
    }
}
