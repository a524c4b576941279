//! Session and entity state resolution for ormstate.
//!
//! `ormstate-session` is the **unit-of-work layer**. It decides, for every
//! entity instance a session touches, which database row it stands for and
//! what the ORM must do about it:
//!
//! - **Identity registry**: one in-memory instance per identity key
//!   ([`PersistenceContext`]).
//! - **State classification**: transient vs persistent/detached
//!   ([`classifier`]).
//! - **Insert safety**: nulling foreign keys to unsaved entities and
//!   collecting non-nullable dependencies that force reordering
//!   ([`foreign_keys`], [`flush`]).
//! - **Two-phase loading**: hydrate every row, then resolve associations,
//!   fire listeners, write through to the second-level cache and take the
//!   dirty-checking snapshot ([`load`]).
//!
//! Sessions are synchronous and single-threaded. The [`SessionFactory`] and
//! its cache regions and statistics are shared.
//!
//! # Example
//!
//! ```ignore
//! let factory = Arc::new(SessionFactory::new(metamodel, FactoryConfig::default()));
//! let mut session = factory.open_session();
//!
//! let orders = session.load("Order", rows.into_iter(), &LoadOptions::default())?;
//! assert!(session.dirty_attributes(&orders[0])?.is_empty());
//! ```

pub mod cache;
pub mod change_tracker;
pub mod classifier;
pub mod events;
pub mod flush;
pub mod foreign_keys;
pub mod identity_map;
pub mod load;
pub mod natural_id;
pub mod statistics;

pub use cache::{
    CacheEntry, CacheKey, CacheMode, CacheValue, CachedValue, EntityDataAccess,
    InMemoryEntityRegion, SoftLock,
};
pub use change_tracker::ObjectSnapshot;
pub use classifier::EntityState;
pub use events::{Interceptor, LoadEventCallbacks, PostLoadEvent, PreLoadEvent};
pub use flush::{
    ActionQueue, DeleteAction, EntityWriter, FlushResult, InsertAction, ParkedInsert,
    UnresolvedInserts,
};
pub use foreign_keys::{NonNullableTransientDependencies, Nullifier, TransientDependency};
pub use identity_map::{
    EntityEntry, EntityStatus, LockMode, PersistenceContext, ProxyState, SnapshotSource,
};
pub use load::{LoadOptions, Loader, LoadingEntities, hydrate_row};
pub use natural_id::{NaturalId, NaturalIdResolutions, extract_natural_id_values};
pub use statistics::{Statistics, StatisticsSnapshot};

use ormstate_core::{
    AttributeValue, EntityDescriptor, EntityHandle, EntityKey, Error, Identifier, Metamodel,
    Result, Row, Value,
};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Configuration
// ============================================================================

/// Factory-wide settings.
#[derive(Debug, Clone, Default)]
pub struct FactoryConfig {
    /// Whether [`Statistics`] are collected.
    pub statistics_enabled: bool,
    /// The database cannot defer self-referencing foreign keys on delete.
    pub self_referential_fk_bug: bool,
    /// Store cache entries in structured (attribute-keyed) form.
    pub use_structured_cache_entries: bool,
    /// Skip cache puts for items already cached.
    pub minimal_puts: bool,
}

impl FactoryConfig {
    /// Create default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `statistics_enabled` (builder pattern).
    #[must_use]
    pub fn statistics_enabled(mut self, value: bool) -> Self {
        self.statistics_enabled = value;
        self
    }

    /// Set `self_referential_fk_bug` (builder pattern).
    #[must_use]
    pub fn self_referential_fk_bug(mut self, value: bool) -> Self {
        self.self_referential_fk_bug = value;
        self
    }

    /// Set `use_structured_cache_entries` (builder pattern).
    #[must_use]
    pub fn use_structured_cache_entries(mut self, value: bool) -> Self {
        self.use_structured_cache_entries = value;
        self
    }

    /// Set `minimal_puts` (builder pattern).
    #[must_use]
    pub fn minimal_puts(mut self, value: bool) -> Self {
        self.minimal_puts = value;
        self
    }
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Load entities read-only unless told otherwise.
    pub default_read_only: bool,
    /// Second-level cache interaction.
    pub cache_mode: CacheMode,
    /// Tenant identifier, part of every cache key.
    pub tenant_id: Option<String>,
    /// Whether load listeners fire.
    pub event_source: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_read_only: false,
            cache_mode: CacheMode::Normal,
            tenant_id: None,
            event_source: true,
        }
    }
}

impl SessionConfig {
    /// Create default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `default_read_only` (builder pattern).
    #[must_use]
    pub fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    /// Set `cache_mode` (builder pattern).
    #[must_use]
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Set `tenant_id` (builder pattern).
    #[must_use]
    pub fn tenant_id(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    /// Set `event_source` (builder pattern).
    #[must_use]
    pub fn event_source(mut self, value: bool) -> Self {
        self.event_source = value;
        self
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Supplies the rows of a load query.
pub trait RowSource {
    /// The next row, or `None` when exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;
}

impl<I> RowSource for I
where
    I: Iterator<Item = Row>,
{
    fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.next())
    }
}

// ============================================================================
// Session factory
// ============================================================================

/// Shared, immutable-after-boot state: metamodel, cache regions, statistics.
pub struct SessionFactory {
    metamodel: Metamodel,
    config: FactoryConfig,
    regions: HashMap<String, Arc<dyn EntityDataAccess>>,
    statistics: Statistics,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.metamodel.len())
            .field("config", &self.config)
            .field("regions", &self.regions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    /// Build a factory; every cache region named by a descriptor gets an
    /// [`InMemoryEntityRegion`].
    pub fn new(metamodel: Metamodel, config: FactoryConfig) -> Self {
        let mut regions: HashMap<String, Arc<dyn EntityDataAccess>> = HashMap::new();
        for descriptor in metamodel.iter() {
            if let Some(region) = descriptor.cache_region() {
                regions
                    .entry(region.to_string())
                    .or_insert_with(|| {
                        Arc::new(InMemoryEntityRegion::new(region)) as Arc<dyn EntityDataAccess>
                    });
            }
        }
        tracing::debug!(
            entities = metamodel.len(),
            regions = regions.len(),
            statistics = config.statistics_enabled,
            "Session factory built"
        );
        Self {
            statistics: Statistics::new(config.statistics_enabled),
            metamodel,
            config,
            regions,
        }
    }

    /// Install (or replace) a cache region implementation.
    #[must_use]
    pub fn with_region(mut self, region: Arc<dyn EntityDataAccess>) -> Self {
        self.regions.insert(region.region_name().to_string(), region);
        self
    }

    /// The metamodel.
    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    /// Factory settings.
    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Factory statistics.
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// A cache region by name.
    pub fn region(&self, name: &str) -> Option<&Arc<dyn EntityDataAccess>> {
        self.regions.get(name)
    }

    /// The cache region of an entity, if it is cached.
    pub fn region_for(&self, descriptor: &EntityDescriptor) -> Option<&Arc<dyn EntityDataAccess>> {
        self.region(descriptor.cache_region()?)
    }

    /// Metadata for an entity.
    pub fn descriptor(&self, entity_name: &str) -> Result<Arc<EntityDescriptor>> {
        self.metamodel.descriptor(entity_name).cloned()
    }

    /// Open a session with default settings.
    pub fn open_session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self), SessionConfig::default())
    }

    /// Open a session with explicit settings.
    pub fn open_session_with(self: &Arc<Self>, config: SessionConfig) -> Session {
        Session::new(Arc::clone(self), config)
    }
}

// ============================================================================
// Session
// ============================================================================

/// One unit of work.
pub struct Session {
    factory: Arc<SessionFactory>,
    config: SessionConfig,
    context: PersistenceContext,
    natural_ids: NaturalIdResolutions,
    interceptor: Option<Box<dyn Interceptor>>,
    callbacks: LoadEventCallbacks,
    pub(crate) actions: ActionQueue,
    snapshot_source: Option<Box<dyn SnapshotSource>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("tracked", &self.context.len())
            .field("callbacks", &self.callbacks)
            .field("actions", &self.actions)
            .field("interceptor", &self.interceptor.is_some())
            .field("snapshot_source", &self.snapshot_source.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session.
    pub fn new(factory: Arc<SessionFactory>, config: SessionConfig) -> Self {
        tracing::debug!(
            cache_mode = ?config.cache_mode,
            read_only = config.default_read_only,
            "Opening session"
        );
        Self {
            factory,
            config,
            context: PersistenceContext::new(),
            natural_ids: NaturalIdResolutions::new(),
            interceptor: None,
            callbacks: LoadEventCallbacks::default(),
            actions: ActionQueue::default(),
            snapshot_source: None,
        }
    }

    /// The owning factory.
    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The identity registry.
    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    /// Mutable identity registry.
    pub fn context_mut(&mut self) -> &mut PersistenceContext {
        &mut self.context
    }

    /// Natural id resolutions.
    pub fn natural_ids(&self) -> &NaturalIdResolutions {
        &self.natural_ids
    }

    pub(crate) fn natural_ids_mut(&mut self) -> &mut NaturalIdResolutions {
        &mut self.natural_ids
    }

    /// Metadata for an entity.
    pub fn descriptor(&self, entity_name: &str) -> Result<Arc<EntityDescriptor>> {
        self.factory.descriptor(entity_name)
    }

    /// Install the interceptor.
    pub fn set_interceptor(&mut self, interceptor: impl Interceptor + 'static) {
        self.interceptor = Some(Box::new(interceptor));
    }

    /// The interceptor, if any.
    pub fn interceptor(&self) -> Option<&dyn Interceptor> {
        self.interceptor.as_deref()
    }

    /// Install the database probe used for transient detection.
    pub fn set_snapshot_source(&mut self, source: impl SnapshotSource + 'static) {
        self.snapshot_source = Some(Box::new(source));
    }

    /// Load listeners.
    pub fn callbacks_mut(&mut self) -> &mut LoadEventCallbacks {
        &mut self.callbacks
    }

    /// Register a pre-load listener.
    pub fn on_pre_load(&mut self, f: impl FnMut(&mut PreLoadEvent) -> Result<()> + 'static) {
        self.callbacks.on_pre_load(f);
    }

    /// Register a post-load listener.
    pub fn on_post_load(&mut self, f: impl FnMut(&PostLoadEvent) -> Result<()> + 'static) {
        self.callbacks.on_post_load(f);
    }

    pub(crate) fn fire_pre_load(&mut self, event: &mut PreLoadEvent) -> Result<()> {
        self.callbacks.fire_pre_load(event)
    }

    pub(crate) fn fire_post_load(&mut self, event: &PostLoadEvent) -> Result<()> {
        self.callbacks.fire_post_load(event)
    }

    /// Current cache mode.
    pub fn cache_mode(&self) -> CacheMode {
        self.config.cache_mode
    }

    /// Change the cache mode.
    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        self.config.cache_mode = mode;
    }

    /// Tenant identifier.
    pub fn tenant_id(&self) -> Option<&str> {
        self.config.tenant_id.as_deref()
    }

    /// Whether loads default to read-only.
    pub fn is_default_read_only(&self) -> bool {
        self.config.default_read_only
    }

    /// Change the read-only default.
    pub fn set_default_read_only(&mut self, value: bool) {
        self.config.default_read_only = value;
    }

    /// Whether load listeners fire.
    pub fn is_event_source(&self) -> bool {
        self.config.event_source
    }

    /// Current database state of a row (memoised per unit of work).
    pub fn database_snapshot(
        &mut self,
        key: &EntityKey,
        descriptor: &EntityDescriptor,
    ) -> Result<Option<Vec<Value>>> {
        let Some(source) = self.snapshot_source.as_deref() else {
            return Err(Error::Unsupported(format!(
                "no snapshot source configured to probe {key}"
            )));
        };
        self.context.get_database_snapshot(key, descriptor, source)
    }

    /// The managed instance for an identifier.
    pub fn get(&self, entity_name: &str, id: impl Into<Identifier>) -> Result<Option<EntityHandle>> {
        let descriptor = self.descriptor(entity_name)?;
        Ok(self.context.get_entity(&descriptor.key_for(id.into())))
    }

    /// Classify a reference as transient or not.
    pub fn classify(
        &mut self,
        entity_name: Option<&str>,
        value: &AttributeValue,
        assumed: Option<bool>,
    ) -> Result<EntityState> {
        classifier::classify(self, entity_name, value, assumed)
    }

    /// Load every row of `rows` as `entity_name`.
    pub fn load(
        &mut self,
        entity_name: &str,
        rows: impl RowSource,
        options: &LoadOptions,
    ) -> Result<Vec<EntityHandle>> {
        Loader::load(self, entity_name, rows, options)
    }

    /// Names of attributes changed since the entity was loaded or inserted.
    pub fn dirty_attributes(&self, handle: &EntityHandle) -> Result<Vec<String>> {
        let entry = self.context.get_entry(handle).ok_or_else(|| Error::TransientObject {
            entity: handle.entity_name(),
        })?;
        let Some(snapshot) = entry.snapshot() else {
            return Ok(Vec::new());
        };
        let descriptor = self.descriptor(entry.entity_name())?;
        let current = handle.read();
        Ok(snapshot
            .dirty_attributes(&descriptor, current.values())
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Switch a managed entity between read-only and modifiable.
    ///
    /// Instances of immutable types stay read-only.
    pub fn set_read_only(&mut self, handle: &EntityHandle, read_only: bool) -> Result<()> {
        let entity_name = handle.entity_name();
        let descriptor = self.descriptor(&entity_name)?;
        let state = handle.read().values().to_vec();
        let entry = self
            .context
            .get_entry_mut(handle)
            .ok_or(Error::TransientObject {
                entity: entity_name,
            })?;
        if !entry.is_mutable() || entry.is_read_only() == read_only {
            return Ok(());
        }
        if read_only {
            entry.set_snapshot(None);
            self.context.set_entry_status(handle, EntityStatus::ReadOnly);
        } else {
            entry.set_snapshot(Some(ObjectSnapshot::take(&descriptor, &state)));
            entry.set_loaded_state(state);
            self.context.set_entry_status(handle, EntityStatus::Managed);
        }
        Ok(())
    }

    /// The current transaction completed.
    pub fn end_transaction(&mut self) {
        self.context.end_transaction();
    }

    /// End the unit of work: forget every tracked instance and pending action.
    pub fn clear(&mut self) {
        self.context.clear();
        self.natural_ids.clear();
        self.actions.clear();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for unit tests.

    use super::*;
    use ormstate_core::{
        AttributeDescriptor, EmbeddableDescriptor, EntityInstance, IdGenerator,
        IdentifierDescriptor,
    };

    /// Customer <- Order (non-nullable), Address embeds city -> City.
    pub fn metamodel() -> Metamodel {
        let address = EmbeddableDescriptor::new(
            "Address",
            vec![
                AttributeDescriptor::basic("street"),
                AttributeDescriptor::many_to_one("city", "City").nullable(false),
            ],
        );
        Metamodel::new()
            .with(
                EntityDescriptor::new("Customer", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                    .attribute(AttributeDescriptor::basic("name"))
                    .attribute(AttributeDescriptor::many_to_one("referrer", "Customer"))
                    .cacheable("customers"),
            )
            .with(
                EntityDescriptor::new("Order", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                    .attribute(AttributeDescriptor::basic("number"))
                    .attribute(AttributeDescriptor::many_to_one("customer", "Customer").nullable(false))
                    .attribute(AttributeDescriptor::one_to_one("invoice", "Invoice").nullable(false))
                    .attribute(AttributeDescriptor::any("subject").nullable(false)),
            )
            .with(EntityDescriptor::new(
                "Invoice",
                IdentifierDescriptor::new("id", IdGenerator::Sequence),
            ))
            .with(
                EntityDescriptor::new("City", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                    .attribute(AttributeDescriptor::basic("name")),
            )
            .with(
                EntityDescriptor::new("Person", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                    .attribute(AttributeDescriptor::embedded("address", address)),
            )
            .with(
                EntityDescriptor::new("Country", IdentifierDescriptor::new("code", IdGenerator::Assigned))
                    .attribute(AttributeDescriptor::basic("name")),
            )
    }

    pub fn session() -> Session {
        session_with(SessionConfig::default())
    }

    pub fn session_with(config: SessionConfig) -> Session {
        Arc::new(SessionFactory::new(metamodel(), FactoryConfig::default().statistics_enabled(true)))
            .open_session_with(config)
    }

    /// A fresh, unsaved instance.
    pub fn transient(session: &Session, entity: &str) -> EntityHandle {
        let descriptor = session.descriptor(entity).unwrap();
        EntityHandle::new(descriptor.instantiate(None))
    }

    /// An instance registered as managed and existing.
    pub fn managed(session: &mut Session, entity: &str, id: i64) -> EntityHandle {
        let descriptor = session.descriptor(entity).unwrap();
        let handle = EntityHandle::new(descriptor.instantiate(Some(Identifier::from(id))));
        session
            .context_mut()
            .add_entity(
                &handle,
                Some(descriptor.key_for(Identifier::from(id))),
                EntityStatus::Managed,
                Some(handle.read().values().to_vec()),
                None,
                LockMode::None,
                true,
                &descriptor,
            )
            .unwrap();
        handle
    }

    /// An instance with an identifier that the session does not track.
    pub fn detached(entity: &str, id: i64, attributes: usize) -> EntityHandle {
        EntityHandle::new(EntityInstance::with_values(
            entity,
            Some(Identifier::from(id)),
            vec![AttributeValue::Null; attributes],
        ))
    }
}
