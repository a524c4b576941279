//! Entity state classification: is a reference transient?
//!
//! Resolution order, first answer wins:
//!
//! 1. lazy references: an uninitialized proxy or an unfetched property is
//!    never transient;
//! 2. the session [`Interceptor`](crate::Interceptor);
//! 3. identifier and version heuristics of the entity type, then a
//!    second-level cache hit;
//! 4. the caller's assumption;
//! 5. a database snapshot probe (no row means transient).

use crate::Session;
use ormstate_core::{
    AttributeValue, EntityDescriptor, EntityHandle, EntityReference, Error, Identifier, Result,
};

/// Outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never saved; has no row.
    Transient,
    /// Persistent or detached; a row exists.
    NotTransient,
}

impl EntityState {
    /// Whether the state is [`EntityState::Transient`].
    pub const fn is_transient(self) -> bool {
        matches!(self, EntityState::Transient)
    }

    fn from_transient(transient: bool) -> Self {
        if transient {
            EntityState::Transient
        } else {
            EntityState::NotTransient
        }
    }
}

/// Classify `value` as transient or not.
///
/// `entity_name` is informational; the concrete type of a loaded instance
/// always decides which metadata applies.
#[tracing::instrument(level = "trace", skip(session, value), fields(value = %value.describe()))]
pub fn classify(
    session: &mut Session,
    entity_name: Option<&str>,
    value: &AttributeValue,
    assumed: Option<bool>,
) -> Result<EntityState> {
    let handle = match value {
        AttributeValue::Null
        | AttributeValue::Unfetched
        | AttributeValue::ForeignKey(_)
        | AttributeValue::AnyKey { .. } => return Ok(EntityState::NotTransient),
        AttributeValue::Entity(EntityReference::NotLoaded(_) | EntityReference::Removed(_)) => {
            return Ok(EntityState::NotTransient);
        }
        AttributeValue::Entity(EntityReference::Loaded(handle)) => handle,
        AttributeValue::Basic(_) | AttributeValue::Embedded(_) => {
            return Err(Error::Custom(format!(
                "cannot classify non-entity value {}",
                value.describe()
            )));
        }
    };
    classify_instance(session, handle, assumed)
}

/// Classify an in-memory instance.
pub fn classify_instance(
    session: &mut Session,
    handle: &EntityHandle,
    assumed: Option<bool>,
) -> Result<EntityState> {
    if let Some(transient) = session.interceptor().and_then(|i| i.is_transient(handle)) {
        tracing::trace!(transient, "Interceptor decided");
        return Ok(EntityState::from_transient(transient));
    }

    let descriptor = session.descriptor(&handle.entity_name())?;
    if let Some(transient) = persister_is_transient(session, &descriptor, handle) {
        tracing::trace!(transient, "Entity type decided");
        return Ok(EntityState::from_transient(transient));
    }

    if let Some(transient) = assumed {
        tracing::trace!(transient, "Using caller assumption");
        return Ok(EntityState::from_transient(transient));
    }

    let Some(id) = handle.id() else {
        return Ok(EntityState::Transient);
    };
    let key = descriptor.key_for(id);
    let snapshot = session.database_snapshot(&key, &descriptor)?;
    tracing::trace!(key = %key, found = snapshot.is_some(), "Database probe decided");
    Ok(EntityState::from_transient(snapshot.is_none()))
}

/// Identifier/version heuristics, then the second-level cache.
fn persister_is_transient(
    session: &Session,
    descriptor: &EntityDescriptor,
    handle: &EntityHandle,
) -> Option<bool> {
    if let Some(answer) = descriptor.is_transient(&handle.read()) {
        return Some(answer);
    }
    if !session.cache_mode().is_get_enabled() {
        return None;
    }
    let region = session.factory().region_for(descriptor)?;
    let id = handle.id()?;
    let key = region.generate_cache_key(&id, descriptor.root_name(), session.tenant_id());
    let statistics = session.factory().statistics();
    if region.get(&key).is_some() {
        statistics.second_level_cache_hit(region.region_name());
        Some(false)
    } else {
        statistics.second_level_cache_miss(region.region_name());
        None
    }
}

/// Whether `value` is certainly not transient.
///
/// Proxies and instances already tracked by the session short-circuit to
/// `true` before any classification happens.
pub fn is_not_transient(
    session: &mut Session,
    entity_name: Option<&str>,
    value: &AttributeValue,
    assumed: Option<bool>,
) -> Result<bool> {
    match value {
        AttributeValue::Entity(EntityReference::NotLoaded(_) | EntityReference::Removed(_)) => {
            return Ok(true);
        }
        AttributeValue::Entity(EntityReference::Loaded(handle))
            if session.context().is_entry_for(handle) =>
        {
            return Ok(true);
        }
        _ => {}
    }
    Ok(!classify(session, entity_name, value, assumed)?.is_transient())
}

/// The identifier of a referenced entity, refusing unsaved instances.
///
/// Returns `Ok(None)` for a null reference and [`Error::TransientObject`]
/// when the referenced instance was never saved.
pub fn entity_identifier_if_not_unsaved(
    session: &mut Session,
    entity_name: Option<&str>,
    value: &AttributeValue,
) -> Result<Option<Identifier>> {
    match value {
        AttributeValue::Null | AttributeValue::Unfetched => Ok(None),
        AttributeValue::ForeignKey(id) | AttributeValue::AnyKey { id, .. } => Ok(Some(id.clone())),
        AttributeValue::Entity(EntityReference::NotLoaded(key) | EntityReference::Removed(key)) => {
            Ok(Some(key.id().clone()))
        }
        AttributeValue::Entity(EntityReference::Loaded(handle)) => {
            if let Some(key) = session.context().get_entry(handle).and_then(|e| e.key()) {
                return Ok(Some(key.id().clone()));
            }
            if classify_instance(session, handle, Some(false))?.is_transient() {
                return Err(Error::TransientObject {
                    entity: entity_name.map_or_else(|| handle.entity_name(), str::to_string),
                });
            }
            Ok(handle.id())
        }
        AttributeValue::Basic(_) | AttributeValue::Embedded(_) => Err(Error::Custom(format!(
            "{} is not an entity reference",
            value.describe()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{CacheEntry, CacheValue, Interceptor};
    use ormstate_core::{EntityKey, Value};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_unsaved_instance_is_transient() {
        let mut session = session();
        let customer = transient(&session, "Customer");
        let state = session
            .classify(Some("Customer"), &AttributeValue::entity(&customer), None)
            .unwrap();
        assert_eq!(state, EntityState::Transient);
    }

    #[test]
    fn test_generated_id_present_is_not_transient() {
        let mut session = session();
        let customer = detached("Customer", 5, 2);
        let state = session.classify(None, &AttributeValue::entity(&customer), None).unwrap();
        assert_eq!(state, EntityState::NotTransient);
    }

    #[test]
    fn test_proxies_and_unfetched_never_transient() {
        let mut session = session();
        let proxy = AttributeValue::Entity(EntityReference::NotLoaded(EntityKey::new(
            "Customer",
            Identifier::from(1),
        )));
        assert_eq!(session.classify(None, &proxy, Some(true)).unwrap(), EntityState::NotTransient);
        assert_eq!(
            session.classify(None, &AttributeValue::Unfetched, Some(true)).unwrap(),
            EntityState::NotTransient
        );
    }

    #[test]
    fn test_interceptor_wins_over_identifier() {
        struct AlwaysTransient;
        impl Interceptor for AlwaysTransient {
            fn is_transient(&self, _entity: &EntityHandle) -> Option<bool> {
                Some(true)
            }
        }
        let mut session = session();
        session.set_interceptor(AlwaysTransient);
        let customer = detached("Customer", 5, 2);
        let state = session.classify(None, &AttributeValue::entity(&customer), None).unwrap();
        assert_eq!(state, EntityState::Transient);
    }

    #[test]
    fn test_assumption_used_before_database() {
        let mut session = session();
        let country = detached("Country", 0, 1);
        country.write().set_id(Some(Identifier::from("NL")));
        let value = AttributeValue::entity(&country);
        assert_eq!(session.classify(None, &value, Some(false)).unwrap(), EntityState::NotTransient);
        assert_eq!(session.classify(None, &value, Some(true)).unwrap(), EntityState::Transient);
    }

    #[test]
    fn test_database_probe_is_last_resort_and_memoised() {
        let mut session = session();
        let probes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&probes);
        session.set_snapshot_source(
            move |_: &EntityDescriptor, id: &Identifier| -> Result<Option<Vec<Value>>> {
                counter.set(counter.get() + 1);
                Ok((id == &Identifier::from("NL")).then(|| vec![Value::Text("Netherlands".into())]))
            },
        );
        let nl = detached("Country", 0, 1);
        nl.write().set_id(Some(Identifier::from("NL")));
        let xx = detached("Country", 0, 1);
        xx.write().set_id(Some(Identifier::from("XX")));

        let nl = AttributeValue::entity(&nl);
        assert_eq!(session.classify(None, &nl, None).unwrap(), EntityState::NotTransient);
        // idempotent, and the probe is not repeated
        assert_eq!(session.classify(None, &nl, None).unwrap(), EntityState::NotTransient);
        assert_eq!(
            session.classify(None, &AttributeValue::entity(&xx), None).unwrap(),
            EntityState::Transient
        );
        assert_eq!(probes.get(), 2);
    }

    #[test]
    fn test_cache_hit_answers_for_assigned_ids() {
        let metamodel = metamodel().with(
            EntityDescriptor::new(
                "Country",
                ormstate_core::IdentifierDescriptor::new("code", ormstate_core::IdGenerator::Assigned),
            )
            .attribute(ormstate_core::AttributeDescriptor::basic("name"))
            .cacheable("countries"),
        );
        let factory = std::sync::Arc::new(crate::SessionFactory::new(
            metamodel,
            crate::FactoryConfig::default().statistics_enabled(true),
        ));
        let descriptor = factory.descriptor("Country").unwrap();
        let region = factory.region("countries").unwrap();
        let key = region.generate_cache_key(&Identifier::from("NL"), "Country", None);
        region.put_from_load(
            &key,
            CacheValue::Entry(CacheEntry::disassemble(&descriptor, &[], None)),
            None,
            false,
        );

        let mut session = factory.open_session();
        let nl = detached("Country", 0, 1);
        nl.write().set_id(Some(Identifier::from("NL")));
        assert_eq!(
            session.classify(None, &AttributeValue::entity(&nl), None).unwrap(),
            EntityState::NotTransient
        );
        assert_eq!(factory.statistics().cache_hit_count("countries"), 1);

        // Cache reads disabled: falls through to the assumption
        session.set_cache_mode(crate::CacheMode::Put);
        assert_eq!(
            session.classify(None, &AttributeValue::entity(&nl), Some(true)).unwrap(),
            EntityState::Transient
        );
    }

    #[test]
    fn test_is_not_transient_short_circuits_tracked() {
        let mut session = session();
        let customer = managed(&mut session, "Customer", 1);
        customer.write().set_id(None);
        assert!(is_not_transient(&mut session, None, &AttributeValue::entity(&customer), None).unwrap());
    }

    #[test]
    fn test_identifier_if_not_unsaved() {
        let mut session = session();
        let unsaved = transient(&session, "Customer");
        let err = entity_identifier_if_not_unsaved(
            &mut session,
            Some("Customer"),
            &AttributeValue::entity(&unsaved),
        )
        .unwrap_err();
        assert!(matches!(err, Error::TransientObject { .. }));

        let saved = managed(&mut session, "Customer", 4);
        let id = entity_identifier_if_not_unsaved(&mut session, None, &AttributeValue::entity(&saved))
            .unwrap();
        assert_eq!(id, Some(Identifier::from(4)));
        assert_eq!(
            entity_identifier_if_not_unsaved(&mut session, None, &AttributeValue::Null).unwrap(),
            None
        );
    }
}
