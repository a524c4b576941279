//! Insert and delete actions, and the flush that executes them.
//!
//! Saving an entity never writes immediately. The insert is checked for
//! non-nullable references to entities that have no row yet:
//!
//! - if there are none, references that *can* be nulled are nulled and an
//!   [`InsertAction`] is queued;
//! - otherwise the insert is parked in [`UnresolvedInserts`] until every
//!   entity it depends on has been inserted, at which point it is queued.
//!
//! A flush runs queued inserts (releasing parked inserts as their
//! dependencies are written), fails if anything is still parked, then runs
//! deletes.
//!
//! # Example
//!
//! ```ignore
//! session.save(&order, false)?;     // parked: customer is unsaved
//! session.save(&customer, false)?;  // queued
//! let result = session.flush(&mut writer)?;
//! assert_eq!(result.inserted, 2);   // customer first, then order
//! ```

use crate::Session;
use crate::change_tracker::ObjectSnapshot;
use crate::foreign_keys::{NonNullableTransientDependencies, Nullifier, find_non_nullable_transient_entities};
use crate::identity_map::{EntityStatus, LockMode};
use ormstate_core::{
    AttributeValue, EntityDescriptor, EntityHandle, EntityKey, Error, IdGenerator, Identifier,
    Result,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// Executes the statements of a flush.
pub trait EntityWriter {
    /// INSERT a row. Returns the generated identifier when `id` is `None`.
    fn insert(
        &mut self,
        descriptor: &EntityDescriptor,
        id: Option<&Identifier>,
        state: &[AttributeValue],
    ) -> Result<Option<Identifier>>;

    /// DELETE a row.
    fn delete(&mut self, descriptor: &EntityDescriptor, id: &Identifier) -> Result<()>;
}

/// A queued INSERT with its (nullified) state.
#[derive(Debug, Clone)]
pub struct InsertAction {
    handle: EntityHandle,
    descriptor: Arc<EntityDescriptor>,
    state: Vec<AttributeValue>,
}

impl InsertAction {
    /// The entity being inserted.
    pub fn entity(&self) -> &EntityHandle {
        &self.handle
    }

    /// The state that will be written.
    pub fn state(&self) -> &[AttributeValue] {
        &self.state
    }
}

/// A queued DELETE.
#[derive(Debug, Clone)]
pub struct DeleteAction {
    handle: EntityHandle,
    key: EntityKey,
    descriptor: Arc<EntityDescriptor>,
}

/// An insert waiting for the entities it references.
#[derive(Debug, Clone)]
pub struct ParkedInsert {
    handle: EntityHandle,
    descriptor: Arc<EntityDescriptor>,
    early_insert: bool,
    dependencies: NonNullableTransientDependencies,
}

impl ParkedInsert {
    /// The entity whose insert is parked.
    pub fn entity(&self) -> &EntityHandle {
        &self.handle
    }

    /// What it is waiting for.
    pub fn dependencies(&self) -> &NonNullableTransientDependencies {
        &self.dependencies
    }
}

/// Inserts blocked by non-nullable references to unsaved entities.
#[derive(Debug, Clone, Default)]
pub struct UnresolvedInserts {
    parked: Vec<ParkedInsert>,
}

impl UnresolvedInserts {
    fn park(&mut self, insert: ParkedInsert) {
        tracing::debug!(
            entity = %insert.handle.describe(),
            dependencies = insert.dependencies.len(),
            "Parking insert until dependencies are inserted"
        );
        self.parked.push(insert);
    }

    /// `entity` was inserted: drop it from every parked insert's
    /// dependencies and return the inserts that are now free to run.
    pub fn resolve_dependent_actions(&mut self, entity: &EntityHandle) -> Vec<ParkedInsert> {
        let mut released = Vec::new();
        let mut still_parked = Vec::with_capacity(self.parked.len());
        for mut insert in self.parked.drain(..) {
            if insert.dependencies.resolve(entity) && insert.dependencies.is_empty() {
                tracing::debug!(entity = %insert.handle.describe(), "Releasing parked insert");
                released.push(insert);
            } else {
                still_parked.push(insert);
            }
        }
        self.parked = still_parked;
        released
    }

    /// Take the parked inserts whose dependencies are all resolved.
    fn take_ready(&mut self) -> Vec<ParkedInsert> {
        let (ready, still_parked): (Vec<_>, Vec<_>) = self
            .parked
            .drain(..)
            .partition(|insert| insert.dependencies.is_empty());
        self.parked = still_parked;
        ready
    }

    fn cancel(&mut self, entity: &EntityHandle) -> bool {
        let before = self.parked.len();
        self.parked.retain(|p| !p.handle.same_instance(entity));
        before != self.parked.len()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Number of parked inserts.
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    /// Parked inserts in parking order.
    pub fn iter(&self) -> impl Iterator<Item = &ParkedInsert> {
        self.parked.iter()
    }

    /// The error for the first insert that can never run.
    pub fn first_error(&self) -> Option<Error> {
        let first = self.parked.first()?;
        Some(first.dependencies.to_error(first.descriptor.name()))
    }
}

/// Pending actions of a session.
#[derive(Debug, Default)]
pub struct ActionQueue {
    inserts: VecDeque<InsertAction>,
    deletes: Vec<DeleteAction>,
    unresolved: UnresolvedInserts,
}

impl ActionQueue {
    /// Queued inserts, in execution order.
    pub fn inserts(&self) -> impl Iterator<Item = &InsertAction> {
        self.inserts.iter()
    }

    /// Parked inserts.
    pub fn unresolved(&self) -> &UnresolvedInserts {
        &self.unresolved
    }

    /// Number of queued deletes.
    pub fn delete_count(&self) -> usize {
        self.deletes.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty() && self.unresolved.is_empty()
    }

    /// Drop a queued or parked insert. Returns whether one was found.
    pub fn cancel_insert(&mut self, entity: &EntityHandle) -> bool {
        let before = self.inserts.len();
        self.inserts.retain(|a| !a.handle.same_instance(entity));
        let cancelled = before != self.inserts.len();
        self.unresolved.cancel(entity) || cancelled
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.inserts.clear();
        self.deletes.clear();
        self.unresolved.parked.clear();
    }
}

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    /// Total number of statements executed.
    pub fn total(&self) -> usize {
        self.inserted + self.deleted
    }
}

impl Session {
    /// Pending actions.
    pub fn actions(&self) -> &ActionQueue {
        &self.actions
    }

    /// Schedule an unsaved entity for insertion.
    ///
    /// Identity-generated entities are always inserted early. Entities
    /// already tracked by the session are left alone.
    #[tracing::instrument(level = "debug", skip(self, handle), fields(entity = %handle.describe()))]
    pub fn save(&mut self, handle: &EntityHandle, early_insert: bool) -> Result<()> {
        if self.context.is_entry_for(handle) {
            tracing::trace!("Already tracked");
            return Ok(());
        }
        let descriptor = self.descriptor(&handle.entity_name())?;
        let generator = descriptor.identifier().generator;
        let early_insert = early_insert || generator == IdGenerator::Identity;
        let key = match handle.id() {
            Some(id) if !id.is_null() => Some(descriptor.key_for(id)),
            _ if generator == IdGenerator::Assigned => {
                return Err(Error::Custom(format!(
                    "identifier of {} must be assigned before save",
                    descriptor.name()
                )));
            }
            _ => None,
        };
        self.context.add_entity(
            handle,
            key,
            EntityStatus::Saving,
            None,
            None,
            LockMode::None,
            false,
            &descriptor,
        )?;

        if let Err(err) = self.schedule_insert(handle, descriptor, early_insert) {
            self.context.remove_entry(handle);
            return Err(err);
        }
        Ok(())
    }

    fn schedule_insert(
        &mut self,
        handle: &EntityHandle,
        descriptor: Arc<EntityDescriptor>,
        early_insert: bool,
    ) -> Result<()> {
        let state = handle.read().values().to_vec();
        match find_non_nullable_transient_entities(
            self,
            descriptor.name(),
            handle,
            &state,
            early_insert,
        )? {
            Some(dependencies) => self.actions.unresolved.park(ParkedInsert {
                handle: handle.clone(),
                descriptor,
                early_insert,
                dependencies,
            }),
            None => self.queue_insert(handle.clone(), descriptor, early_insert)?,
        }
        Ok(())
    }

    /// Queue released inserts in order. On failure the failed insert and
    /// everything after it go back to the parked set.
    fn queue_released(&mut self, released: Vec<ParkedInsert>) -> Result<()> {
        let mut pending: VecDeque<ParkedInsert> = released.into();
        while let Some(insert) = pending.pop_front() {
            let queued = self.queue_insert(
                insert.handle.clone(),
                Arc::clone(&insert.descriptor),
                insert.early_insert,
            );
            if let Err(err) = queued {
                self.actions.unresolved.park(insert);
                for rest in pending {
                    self.actions.unresolved.park(rest);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn queue_insert(
        &mut self,
        handle: EntityHandle,
        descriptor: Arc<EntityDescriptor>,
        early_insert: bool,
    ) -> Result<()> {
        let values = handle.read().values().to_vec();
        let state = Nullifier::new(Some(&handle), false, early_insert).nullify_transient_references(
            self,
            &values,
            descriptor.attributes(),
        )?;
        tracing::trace!(entity = %handle.describe(), "Insert queued");
        self.actions.inserts.push_back(InsertAction {
            handle,
            descriptor,
            state,
        });
        Ok(())
    }

    /// Schedule a managed entity for deletion. Deleting an entity whose
    /// insert has not been flushed just cancels the insert.
    #[tracing::instrument(level = "debug", skip(self, handle), fields(entity = %handle.describe()))]
    pub fn delete(&mut self, handle: &EntityHandle) -> Result<()> {
        if self.actions.cancel_insert(handle) {
            self.context.remove_entry(handle);
            tracing::debug!("Cancelled unflushed insert");
            return Ok(());
        }
        let entry = self
            .context
            .get_entry(handle)
            .ok_or_else(|| Error::TransientObject {
                entity: handle.entity_name(),
            })?;
        if entry.status().is_deleted_or_gone() {
            return Ok(());
        }
        let key = entry.key().cloned().ok_or_else(|| Error::TransientObject {
            entity: handle.entity_name(),
        })?;
        let descriptor = self.descriptor(entry.entity_name())?;
        self.context.set_entry_status(handle, EntityStatus::Deleted);
        self.context.register_nullifiable_entity_key(key.clone());
        self.actions.deletes.push(DeleteAction {
            handle: handle.clone(),
            key,
            descriptor,
        });
        Ok(())
    }

    /// Execute every pending action through `writer`.
    ///
    /// Fails with [`Error::TransientPropertyValue`] when an insert is still
    /// waiting for an entity that was never saved; the insert stays parked.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn flush(&mut self, writer: &mut dyn EntityWriter) -> Result<FlushResult> {
        let mut result = FlushResult::default();
        let ready = self.actions.unresolved.take_ready();
        self.queue_released(ready)?;
        while let Some(action) = self.actions.inserts.pop_front() {
            self.execute_insert(writer, action)?;
            result.inserted += 1;
        }
        if let Some(error) = self.actions.unresolved.first_error() {
            tracing::debug!(parked = self.actions.unresolved.len(), "Flush blocked by unsaved references");
            return Err(error);
        }
        for action in std::mem::take(&mut self.actions.deletes) {
            self.execute_delete(writer, action)?;
            result.deleted += 1;
        }
        tracing::debug!(inserted = result.inserted, deleted = result.deleted, "Flush complete");
        Ok(result)
    }

    fn execute_insert(&mut self, writer: &mut dyn EntityWriter, action: InsertAction) -> Result<()> {
        let InsertAction {
            handle,
            descriptor,
            state,
        } = action;
        let current = handle.id().filter(|id| !id.is_null());
        let generated = writer.insert(&descriptor, current.as_ref(), &state)?;
        let id = match (generated, current) {
            (Some(generated), _) => {
                handle.write().set_id(Some(generated.clone()));
                generated
            }
            (None, Some(id)) => id,
            (None, None) => {
                return Err(Error::Database(format!(
                    "no identifier generated for {}",
                    handle.describe()
                )));
            }
        };
        let key = descriptor.key_for(id);
        self.context.assign_key(&handle, key.clone())?;

        let version = descriptor.version_of(&state);
        let snapshot = ObjectSnapshot::take(&descriptor, &state);
        self.natural_ids
            .cache_natural_id_from_load(&descriptor, key.id(), &state);
        if let Some(entry) = self.context.get_entry_mut(&handle) {
            entry.post_insert(state, version);
            entry.set_snapshot(Some(snapshot));
        }
        self.context.register_insert_during_transaction(key.clone());
        tracing::trace!(key = %key, "Inserted");

        let released = self.actions.unresolved.resolve_dependent_actions(&handle);
        self.queue_released(released)
    }

    fn execute_delete(&mut self, writer: &mut dyn EntityWriter, action: DeleteAction) -> Result<()> {
        let DeleteAction {
            handle,
            key,
            descriptor,
        } = action;
        writer.delete(&descriptor, key.id())?;
        self.context.set_entry_status(&handle, EntityStatus::Gone);
        self.natural_ids.remove(&key);
        if let Some(region) = self.factory.region_for(&descriptor) {
            let cache_key =
                region.generate_cache_key(key.id(), descriptor.root_name(), self.tenant_id());
            region.evict(&cache_key);
        }
        self.context.remove_entity(&key);
        tracing::trace!(key = %key, "Deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{CacheEntry, CacheValue, FactoryConfig, SessionFactory};
    use ormstate_core::{
        AttributeDescriptor, EntityInstance, IdentifierDescriptor, Metamodel, Value,
    };
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingWriter {
        next_id: i64,
        inserted: Vec<(String, Vec<AttributeValue>)>,
        deleted: Vec<(String, Identifier)>,
    }

    impl EntityWriter for RecordingWriter {
        fn insert(
            &mut self,
            descriptor: &EntityDescriptor,
            id: Option<&Identifier>,
            state: &[AttributeValue],
        ) -> Result<Option<Identifier>> {
            self.inserted
                .push((descriptor.name().to_string(), state.to_vec()));
            if id.is_some() {
                return Ok(None);
            }
            self.next_id += 1;
            Ok(Some(Identifier::from(100 + self.next_id)))
        }

        fn delete(&mut self, descriptor: &EntityDescriptor, id: &Identifier) -> Result<()> {
            self.deleted.push((descriptor.name().to_string(), id.clone()));
            Ok(())
        }
    }

    fn new_order(session: &Session, customer: &EntityHandle) -> EntityHandle {
        let order = transient(session, "Order");
        order.write().set_value(0, AttributeValue::basic("A-1"));
        order.write().set_value(1, AttributeValue::entity(customer));
        order
    }

    #[test]
    fn test_dependent_insert_waits_for_its_dependency() {
        let mut session = session();
        let customer = transient(&session, "Customer");
        let order = new_order(&session, &customer);

        session.save(&order, false).unwrap();
        assert_eq!(session.actions().unresolved().len(), 1);
        session.save(&customer, false).unwrap();

        let mut writer = RecordingWriter::default();
        let result = session.flush(&mut writer).unwrap();
        assert_eq!(result.inserted, 2);
        let names: Vec<&str> = writer.inserted.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Customer", "Order"]);
        // the order row references the customer, nothing nulled
        assert_eq!(writer.inserted[1].1[1], AttributeValue::entity(&customer));
        assert!(session.actions().is_empty());
        assert_eq!(
            session.context().get_entry(&order).unwrap().status(),
            EntityStatus::Managed
        );
    }

    #[test]
    fn test_flush_fails_for_never_saved_dependency() {
        let mut session = session();
        let customer = transient(&session, "Customer");
        let order = new_order(&session, &customer);
        session.save(&order, false).unwrap();

        let err = session.flush(&mut RecordingWriter::default()).unwrap_err();
        assert!(matches!(
            &err,
            Error::TransientPropertyValue { entity, property, .. } if entity == "Order" && property == "customer"
        ));
        // still parked; saving the dependency lets the next flush succeed
        session.save(&customer, false).unwrap();
        assert_eq!(session.flush(&mut RecordingWriter::default()).unwrap().inserted, 2);
    }

    #[test]
    fn test_nullable_reference_nulled_then_dirty() {
        let mut session = session();
        let referrer = transient(&session, "Customer");
        let customer = transient(&session, "Customer");
        customer.write().set_value(1, AttributeValue::entity(&referrer));
        session.save(&customer, false).unwrap();
        assert!(session.actions().unresolved().is_empty());

        let mut writer = RecordingWriter::default();
        session.flush(&mut writer).unwrap();
        assert!(writer.inserted[0].1[1].is_null());
        assert_eq!(session.dirty_attributes(&customer).unwrap(), vec!["referrer".to_string()]);
        assert!(customer.id().is_some());
        assert!(session
            .context()
            .was_inserted_during_transaction(&EntityKey::new("Customer", customer.id().unwrap())));
    }

    #[test]
    fn test_identity_forces_early_insert_for_self_reference() {
        let metamodel = Metamodel::new().with(
            EntityDescriptor::new("Node", IdentifierDescriptor::new("id", IdGenerator::Identity))
                .attribute(AttributeDescriptor::many_to_one("parent", "Node")),
        );
        let factory = Arc::new(SessionFactory::new(metamodel, FactoryConfig::default()));
        let mut session = factory.open_session();
        let node = EntityHandle::new(session.descriptor("Node").unwrap().instantiate(None));
        node.write().set_value(0, AttributeValue::entity(&node));
        session.save(&node, false).unwrap();
        assert!(session.actions().inserts().next().unwrap().state()[0].is_null());

        let mut writer = RecordingWriter::default();
        session.flush(&mut writer).unwrap();
        assert_eq!(node.id(), Some(Identifier::from(101)));
        assert!(session.get("Node", 101).unwrap().unwrap().same_instance(&node));
    }

    #[test]
    fn test_self_reference_kept_without_early_insert() {
        let mut session = session();
        let customer = transient(&session, "Customer");
        customer.write().set_id(Some(Identifier::from(1)));
        customer.write().set_value(1, AttributeValue::entity(&customer));
        session.save(&customer, false).unwrap();
        let action = session.actions().inserts().next().unwrap();
        assert_eq!(action.state()[1], AttributeValue::entity(&customer));
    }

    #[test]
    fn test_assigned_identifier_required() {
        let mut session = session();
        let country = transient(&session, "Country");
        assert!(session.save(&country, false).is_err());
    }

    #[test]
    fn test_delete_flushes_and_evicts() {
        let mut session = session();
        let customer = managed(&mut session, "Customer", 1);
        let region = Arc::clone(session.factory().region("customers").unwrap());
        let cache_key = region.generate_cache_key(&Identifier::from(1), "Customer", None);
        let descriptor = session.descriptor("Customer").unwrap();
        region.put_from_load(
            &cache_key,
            CacheValue::Entry(CacheEntry::disassemble(&descriptor, &[], None)),
            None,
            false,
        );

        session.delete(&customer).unwrap();
        let key = EntityKey::new("Customer", Identifier::from(1));
        assert!(session.context().is_nullifiable_entity_key(&key));
        assert_eq!(
            session.context().get_entry(&customer).unwrap().status(),
            EntityStatus::Deleted
        );

        let mut writer = RecordingWriter::default();
        let result = session.flush(&mut writer).unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(writer.deleted, vec![("Customer".to_string(), Identifier::from(1))]);
        assert!(!session.context().is_entry_for(&customer));
        assert!(region.get(&cache_key).is_none());
    }

    #[test]
    fn test_reference_to_deleted_entity_is_nulled() {
        let mut session = session();
        let old = managed(&mut session, "Customer", 1);
        session.delete(&old).unwrap();
        let customer = transient(&session, "Customer");
        customer.write().set_value(1, AttributeValue::entity(&old));
        session.save(&customer, false).unwrap();
        assert!(session.actions().inserts().next().unwrap().state()[1].is_null());
    }

    #[test]
    fn test_delete_cancels_unflushed_insert() {
        let mut session = session();
        let customer = transient(&session, "Customer");
        session.save(&customer, false).unwrap();
        session.delete(&customer).unwrap();
        assert!(session.actions().is_empty());
        assert!(!session.context().is_entry_for(&customer));
        assert_eq!(session.flush(&mut RecordingWriter::default()).unwrap().total(), 0);
    }

    #[test]
    fn test_delete_untracked_is_error() {
        let mut session = session();
        let customer = transient(&session, "Customer");
        assert!(matches!(
            session.delete(&customer),
            Err(Error::TransientObject { .. })
        ));
    }

    fn shipping_session() -> Session {
        let metamodel = Metamodel::new()
            .with(
                EntityDescriptor::new("Customer", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                    .attribute(AttributeDescriptor::basic("name")),
            )
            .with(
                EntityDescriptor::new("Country", IdentifierDescriptor::new("code", IdGenerator::Assigned))
                    .attribute(AttributeDescriptor::basic("name")),
            )
            .with(
                EntityDescriptor::new("Shipment", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                    .attribute(AttributeDescriptor::many_to_one("country", "Country").nullable(false)),
            )
            .with(
                EntityDescriptor::new("Parcel", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                    .attribute(AttributeDescriptor::many_to_one("sender", "Customer").nullable(false))
                    .attribute(AttributeDescriptor::many_to_one("origin", "Country")),
            );
        let mut session =
            Arc::new(SessionFactory::new(metamodel, FactoryConfig::default())).open_session();
        // the first probe fails, later ones find the row
        let failed = Rc::new(Cell::new(false));
        session.set_snapshot_source(
            move |_: &EntityDescriptor, _: &Identifier| -> Result<Option<Vec<Value>>> {
                if !failed.replace(true) {
                    return Err(Error::Database("connection reset".into()));
                }
                Ok(Some(vec![Value::Text("Netherlands".into())]))
            },
        );
        session
    }

    fn country(code: &str) -> EntityHandle {
        EntityHandle::new(EntityInstance::with_values(
            "Country",
            Some(Identifier::from(code)),
            vec![AttributeValue::Null],
        ))
    }

    #[test]
    fn test_failed_save_leaves_no_entry_and_can_be_retried() {
        let mut session = shipping_session();
        let nl = country("NL");
        let shipment = transient(&session, "Shipment");
        shipment.write().set_value(0, AttributeValue::entity(&nl));

        let err = session.save(&shipment, false).unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(!session.context().is_entry_for(&shipment));
        assert!(session.actions().is_empty());

        session.save(&shipment, false).unwrap();
        let mut writer = RecordingWriter::default();
        assert_eq!(session.flush(&mut writer).unwrap().inserted, 1);
        assert_eq!(writer.inserted.len(), 1);
        assert_eq!(writer.inserted[0].1[0], AttributeValue::entity(&nl));
    }

    #[test]
    fn test_released_insert_that_fails_to_queue_stays_parked() {
        let mut session = shipping_session();
        let nl = country("NL");
        let customer = transient(&session, "Customer");
        let parcel = transient(&session, "Parcel");
        parcel.write().set_value(0, AttributeValue::entity(&customer));
        parcel.write().set_value(1, AttributeValue::entity(&nl));
        session.save(&parcel, false).unwrap();
        session.save(&customer, false).unwrap();

        let mut writer = RecordingWriter::default();
        let err = session.flush(&mut writer).unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert_eq!(writer.inserted.len(), 1);
        assert_eq!(session.actions().unresolved().len(), 1);

        assert_eq!(session.flush(&mut writer).unwrap().inserted, 1);
        let names: Vec<_> = writer.inserted.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["Customer", "Parcel"]);
        assert_eq!(writer.inserted[1].1[1], AttributeValue::entity(&nl));
        assert!(session.actions().is_empty());
    }
}
