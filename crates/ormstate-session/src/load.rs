//! Two-phase entity materialization.
//!
//! Loading a result set happens in two passes so that associations between
//! rows of the same result can be wired to each other:
//!
//! 1. **Hydrate**: every row is turned into raw attribute values
//!    ([`hydrate_row`]). Foreign keys stay unresolved ([`AttributeValue::ForeignKey`])
//!    and the instance is registered in a [`LoadingEntities`] set and in the
//!    persistence context with status `Loading`.
//! 2. **Finish up**: for every registered entity, in registration order,
//!    foreign keys are resolved to instances or proxies, pre-load listeners
//!    run, state is written onto the instance, the second-level cache and
//!    natural-id cross references are updated, and the entity becomes
//!    `Managed` (with a dirty-checking snapshot) or `ReadOnly`. Post-load
//!    listeners run last, once every entity of the batch is initialized.
//!
//! # Example
//!
//! ```ignore
//! let rows = vec![Row::from_values(vec![Value::BigInt(1), Value::Text("Alice".into())])];
//! let customers = Loader::load(&mut session, "Customer", rows.into_iter(), &LoadOptions::default())?;
//! ```

use crate::cache::{CacheEntry, CacheMode, CacheValue};
use crate::change_tracker::ObjectSnapshot;
use crate::events::{PostLoadEvent, PreLoadEvent};
use crate::identity_map::{EntityStatus, LockMode};
use crate::{RowSource, Session};
use ormstate_core::{
    AttributeDescriptor, AttributeKind, AttributeValue, EntityDescriptor, EntityHandle, EntityKey,
    EntityReference, Error, Identifier, InstanceId, Result, Row, Value,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-load settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Force read-only (`Some(true)`) or modifiable (`Some(false)`) results;
    /// `None` defers to the session default.
    pub read_only: Option<bool>,
    /// Lock to record on loaded entries.
    pub lock_mode: LockMode,
}

impl LoadOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `read_only` (builder pattern).
    #[must_use]
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = Some(value);
        self
    }

    /// Set `lock_mode` (builder pattern).
    #[must_use]
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }
}

#[derive(Debug)]
struct LoadingEntity {
    key: EntityKey,
    descriptor: Arc<EntityDescriptor>,
    handle: EntityHandle,
    hydrated: Vec<AttributeValue>,
}

/// Entities hydrated by one load, waiting for [`LoadingEntities::finish_up`].
#[derive(Debug, Default)]
pub struct LoadingEntities {
    entities: Vec<LoadingEntity>,
    index: HashMap<EntityKey, usize>,
    keys_by_instance: HashMap<InstanceId, EntityKey>,
}

impl LoadingEntities {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hydrated instance.
    ///
    /// The first registration for a key wins. A later registration of a
    /// different instance is dropped and `false` is returned.
    pub fn register_loading_entity(
        &mut self,
        key: EntityKey,
        descriptor: Arc<EntityDescriptor>,
        handle: EntityHandle,
        hydrated: Vec<AttributeValue>,
    ) -> bool {
        if let Some(&existing) = self.index.get(&key) {
            if self.entities[existing].handle.same_instance(&handle) {
                tracing::debug!(key = %key, "Entity already registered for loading");
            } else {
                tracing::warn!(
                    key = %key,
                    dropped = %handle.describe(),
                    "Duplicate hydration for key; keeping the first instance"
                );
            }
            return false;
        }
        self.index.insert(key.clone(), self.entities.len());
        self.keys_by_instance.insert(handle.instance_id(), key.clone());
        self.entities.push(LoadingEntity {
            key,
            descriptor,
            handle,
            hydrated,
        });
        true
    }

    /// The instance registered for `key`.
    pub fn get(&self, key: &EntityKey) -> Option<&EntityHandle> {
        self.index.get(key).map(|&i| &self.entities[i].handle)
    }

    /// Whether `key` has been registered.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.index.contains_key(key)
    }

    /// The key an instance was registered under.
    pub fn key_for(&self, handle: &EntityHandle) -> Option<&EntityKey> {
        self.keys_by_instance.get(&handle.instance_id())
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Second phase: initialize every registered entity, then fire
    /// post-load listeners.
    ///
    /// # Panics
    ///
    /// Panics if a registered instance lost its key mapping.
    #[tracing::instrument(level = "debug", skip_all, fields(entities = self.entities.len()))]
    pub fn finish_up(self, session: &mut Session, options: &LoadOptions) -> Result<()> {
        for entity in &self.entities {
            self.initialize_entity(session, entity, options)?;
        }
        if session.is_event_source() {
            for entity in &self.entities {
                let event = PostLoadEvent {
                    entity: entity.handle.clone(),
                    id: entity.key.id().clone(),
                    entity_name: entity.descriptor.name().to_string(),
                };
                session.fire_post_load(&event)?;
            }
        }
        Ok(())
    }

    fn initialize_entity(
        &self,
        session: &mut Session,
        entity: &LoadingEntity,
        options: &LoadOptions,
    ) -> Result<()> {
        let LoadingEntity {
            descriptor, handle, ..
        } = entity;
        let key = self
            .key_for(handle)
            .unwrap_or_else(|| panic!("no key registered for loading entity {}", handle.describe()))
            .clone();
        tracing::debug!(key = %key, "Initializing entity");

        if !session.context().is_entry_for(handle) {
            session.context_mut().add_entity(
                handle,
                Some(key.clone()),
                EntityStatus::Loading,
                Some(entity.hydrated.clone()),
                descriptor.version_of(&entity.hydrated),
                options.lock_mode,
                true,
                descriptor,
            )?;
        }

        let mut state = Vec::with_capacity(entity.hydrated.len());
        for (attribute, value) in descriptor.attributes().iter().zip(&entity.hydrated) {
            state.push(self.resolve_value(session, descriptor, attribute, value)?);
        }

        if session.is_event_source() {
            let mut event = PreLoadEvent {
                entity: handle.clone(),
                state,
                id: key.id().clone(),
                descriptor: Arc::clone(descriptor),
            };
            session.fire_pre_load(&mut event)?;
            state = event.state;
        }

        handle.write().set_values(state.clone());

        let version = descriptor.version_of(&state);
        put_in_second_level_cache(session, descriptor, &key, &state, version.as_ref())?;

        session
            .natural_ids_mut()
            .cache_natural_id_from_load(descriptor, key.id(), &state);

        let read_only = if !descriptor.is_mutable() {
            true
        } else if let Some(proxy) = session.context().get_proxy(&key) {
            proxy.is_read_only()
        } else {
            options
                .read_only
                .unwrap_or_else(|| session.is_default_read_only())
        };

        let snapshot = (!read_only).then(|| ObjectSnapshot::take(descriptor, &state));
        if let Some(entry) = session.context_mut().get_entry_mut(handle) {
            entry.set_loaded_state(state);
            entry.set_snapshot(snapshot);
        }
        let status = if read_only {
            EntityStatus::ReadOnly
        } else {
            EntityStatus::Managed
        };
        session.context_mut().set_entry_status(handle, status);

        if let Some(hook) = descriptor.after_initialize_hook() {
            hook.call(handle);
        }
        session.factory().statistics().load_entity(descriptor.name());
        tracing::debug!(key = %key, status = ?status, "Entity initialized");
        Ok(())
    }

    fn resolve_value(
        &self,
        session: &mut Session,
        owner: &EntityDescriptor,
        attribute: &AttributeDescriptor,
        value: &AttributeValue,
    ) -> Result<AttributeValue> {
        match (value, &attribute.kind) {
            (AttributeValue::ForeignKey(id), kind) => {
                let Some(target) = kind.target_entity() else {
                    return Err(Error::Hydration {
                        entity: owner.name().to_string(),
                        attribute: attribute.name.clone(),
                        message: format!("foreign key on {} attribute", kind.classification()),
                    });
                };
                self.resolve_reference(session, target, id)
            }
            (AttributeValue::AnyKey { entity_name, id }, _) => {
                self.resolve_reference(session, entity_name, id)
            }
            (AttributeValue::Embedded(embedded), AttributeKind::Embedded(embeddable)) => {
                let mut children = Vec::with_capacity(embedded.values().len());
                for (child_attribute, child) in embeddable.attributes.iter().zip(embedded.values()) {
                    children.push(self.resolve_value(session, owner, child_attribute, child)?);
                }
                let mut resolved = embedded.clone();
                resolved.replace_values(children);
                Ok(AttributeValue::Embedded(resolved))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Session instance, then batch instance, then an uninitialized proxy.
    fn resolve_reference(
        &self,
        session: &mut Session,
        entity_name: &str,
        id: &Identifier,
    ) -> Result<AttributeValue> {
        let descriptor = session.descriptor(entity_name)?;
        let key = descriptor.key_for(id.clone());
        if let Some(handle) = session.context().get_entity(&key) {
            let removed = session
                .context()
                .get_entry(&handle)
                .is_some_and(|entry| entry.status().is_deleted_or_gone());
            tracing::trace!(key = %key, removed, "Resolved to session instance");
            return Ok(if removed {
                AttributeValue::Entity(EntityReference::Removed(key))
            } else {
                AttributeValue::entity(&handle)
            });
        }
        if let Some(handle) = self.get(&key) {
            tracing::trace!(key = %key, "Resolved to batch instance");
            return Ok(AttributeValue::entity(handle));
        }
        let read_only = session.is_default_read_only();
        session.context_mut().add_proxy(key.clone(), read_only);
        tracing::trace!(key = %key, "Resolved to proxy");
        Ok(AttributeValue::Entity(EntityReference::NotLoaded(key)))
    }
}

/// Write-through of freshly loaded state to the entity's cache region.
fn put_in_second_level_cache(
    session: &Session,
    descriptor: &EntityDescriptor,
    key: &EntityKey,
    state: &[AttributeValue],
    version: Option<&Value>,
) -> Result<()> {
    let cache_mode = session.cache_mode();
    if !cache_mode.is_put_enabled() {
        return Ok(());
    }
    let factory = session.factory();
    let Some(region) = factory.region_for(descriptor) else {
        return Ok(());
    };
    let entry = CacheEntry::disassemble(descriptor, state, version.cloned());
    let value = if factory.config().use_structured_cache_entries {
        CacheValue::Structured(entry.structure(descriptor)?)
    } else {
        CacheValue::Entry(entry)
    };
    let cache_key = region.generate_cache_key(key.id(), descriptor.root_name(), session.tenant_id());
    let accepted = if session.context().was_inserted_during_transaction(key) {
        region.update(&cache_key, value, version, version)
    } else {
        let minimal_put = factory.config().minimal_puts && cache_mode != CacheMode::Refresh;
        region.put_from_load(&cache_key, value, version, minimal_put)
    };
    if accepted {
        factory.statistics().second_level_cache_put(region.region_name());
    } else {
        tracing::debug!(region = region.region_name(), key = %key, "Cache put refused");
    }
    Ok(())
}

/// Read the identifier and attribute values of `descriptor` from `row`.
///
/// Columns are consumed positionally: identifier columns first, then each
/// attribute's columns in declaration order. Lazy attributes read nothing
/// and hydrate as [`AttributeValue::Unfetched`].
pub fn hydrate_row(
    descriptor: &EntityDescriptor,
    row: &Row,
) -> Result<(EntityKey, Vec<AttributeValue>)> {
    let identifier = descriptor.identifier();
    let id_values = row
        .slice(0, identifier.column_span)
        .ok_or_else(|| short_row(descriptor, &identifier.name, row))?;
    let id = Identifier::new(id_values.to_vec());
    if id.is_null() {
        return Err(Error::Hydration {
            entity: descriptor.name().to_string(),
            attribute: identifier.name.clone(),
            message: "null identifier".to_string(),
        });
    }

    let mut position = identifier.column_span;
    let mut state = Vec::with_capacity(descriptor.attributes().len());
    for attribute in descriptor.attributes() {
        let span = attribute.effective_column_span();
        let columns = row
            .slice(position, span)
            .ok_or_else(|| short_row(descriptor, &attribute.name, row))?;
        state.push(hydrate_attribute(descriptor, attribute, columns, &id)?);
        position += span;
    }
    Ok((descriptor.key_for(id), state))
}

fn short_row(descriptor: &EntityDescriptor, attribute: &str, row: &Row) -> Error {
    Error::Hydration {
        entity: descriptor.name().to_string(),
        attribute: attribute.to_string(),
        message: format!(
            "row has {} columns, {} expected",
            row.len(),
            descriptor.column_span()
        ),
    }
}

fn hydrate_attribute(
    descriptor: &EntityDescriptor,
    attribute: &AttributeDescriptor,
    columns: &[Value],
    owner_id: &Identifier,
) -> Result<AttributeValue> {
    if attribute.lazy {
        return Ok(AttributeValue::Unfetched);
    }
    match &attribute.kind {
        AttributeKind::Basic => Ok(match columns {
            [] => AttributeValue::Null,
            [single] => AttributeValue::basic(single.clone()),
            many => AttributeValue::Basic(Value::Array(many.to_vec())),
        }),
        AttributeKind::ManyToOne { .. } => Ok(foreign_key(columns)),
        // shared primary key
        AttributeKind::OneToOne { .. } if columns.is_empty() => {
            Ok(AttributeValue::ForeignKey(owner_id.clone()))
        }
        AttributeKind::OneToOne { .. } => Ok(foreign_key(columns)),
        AttributeKind::Any => {
            let Some((discriminator, id)) = columns.split_first() else {
                return Err(Error::Hydration {
                    entity: descriptor.name().to_string(),
                    attribute: attribute.name.clone(),
                    message: "missing discriminator column".to_string(),
                });
            };
            if id.iter().all(Value::is_null) {
                return Ok(AttributeValue::Null);
            }
            match discriminator {
                Value::Text(entity_name) => Ok(AttributeValue::AnyKey {
                    entity_name: entity_name.clone(),
                    id: Identifier::new(id.to_vec()),
                }),
                other => Err(Error::Hydration {
                    entity: descriptor.name().to_string(),
                    attribute: attribute.name.clone(),
                    message: format!("discriminator must be text, got {}", other.type_name()),
                }),
            }
        }
        AttributeKind::Embedded(embeddable) => {
            let mut position = 0;
            let mut children = Vec::with_capacity(embeddable.attributes.len());
            for child in &embeddable.attributes {
                let span = child.effective_column_span();
                let child_columns = columns.get(position..position + span).ok_or_else(|| {
                    Error::Hydration {
                        entity: descriptor.name().to_string(),
                        attribute: format!("{}.{}", attribute.name, child.name),
                        message: "embedded column span exceeds attribute span".to_string(),
                    }
                })?;
                children.push(hydrate_attribute(descriptor, child, child_columns, owner_id)?);
                position += span;
            }
            if children.iter().all(AttributeValue::is_null) {
                Ok(AttributeValue::Null)
            } else {
                Ok(AttributeValue::embedded(children))
            }
        }
    }
}

fn foreign_key(columns: &[Value]) -> AttributeValue {
    if columns.iter().all(Value::is_null) {
        AttributeValue::Null
    } else {
        AttributeValue::ForeignKey(Identifier::new(columns.to_vec()))
    }
}

/// Drives a load: hydrate every row, then finish up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Loader;

impl Loader {
    /// Load every row of `rows` as `entity_name`, returning one instance per
    /// row.
    ///
    /// Rows for an instance the session already manages return that instance
    /// unchanged. A key repeated within the result maps to the instance of
    /// its first row.
    #[tracing::instrument(level = "debug", skip(session, rows, options), fields(lock = ?options.lock_mode))]
    pub fn load(
        session: &mut Session,
        entity_name: &str,
        mut rows: impl RowSource,
        options: &LoadOptions,
    ) -> Result<Vec<EntityHandle>> {
        if !options.lock_mode.is_supported_for_load() {
            return Err(Error::Unsupported(format!(
                "lock mode {:?} on load",
                options.lock_mode
            )));
        }
        let descriptor = session.descriptor(entity_name)?;
        let mut loading = LoadingEntities::new();
        let mut registered = Vec::new();

        let outcome = Self::hydrate_rows(
            session,
            &descriptor,
            &mut rows,
            options,
            &mut loading,
            &mut registered,
        )
        .and_then(|results| loading.finish_up(session, options).map(|()| results));
        if outcome.is_err() {
            // the instances never reach the caller
            for handle in &registered {
                session.context_mut().remove_entry(handle);
            }
            tracing::debug!(entities = registered.len(), "Load failed, entries discarded");
        }
        outcome
    }

    /// Phase 1: hydrate every row and register the new instances.
    fn hydrate_rows(
        session: &mut Session,
        descriptor: &Arc<EntityDescriptor>,
        rows: &mut impl RowSource,
        options: &LoadOptions,
        loading: &mut LoadingEntities,
        registered: &mut Vec<EntityHandle>,
    ) -> Result<Vec<EntityHandle>> {
        let mut results = Vec::new();
        while let Some(row) = rows.next_row()? {
            let (key, hydrated) = hydrate_row(descriptor, &row)?;

            if !loading.contains(&key) {
                if let Some(existing) = session.context().get_entity(&key) {
                    tracing::trace!(key = %key, "Reusing managed instance");
                    results.push(existing);
                    continue;
                }
            }

            let handle = EntityHandle::new(descriptor.instantiate(Some(key.id().clone())));
            if !loading.register_loading_entity(
                key.clone(),
                Arc::clone(descriptor),
                handle.clone(),
                hydrated.clone(),
            ) {
                session.factory().statistics().duplicate_hydration();
                if let Some(first) = loading.get(&key) {
                    results.push(first.clone());
                }
                continue;
            }
            session.context_mut().add_entity(
                &handle,
                Some(key),
                EntityStatus::Loading,
                Some(hydrated.clone()),
                descriptor.version_of(&hydrated),
                options.lock_mode,
                true,
                descriptor,
            )?;
            registered.push(handle.clone());
            results.push(handle);
        }
        tracing::debug!(rows = results.len(), entities = loading.len(), "Rows hydrated");
        Ok(results)
    }
}
