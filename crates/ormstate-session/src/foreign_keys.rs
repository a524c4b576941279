//! Foreign-key safety for inserts.
//!
//! Before an INSERT the session must not write a foreign key that points at
//! a row which does not exist yet. Two tools handle this:
//!
//! - [`Nullifier`] replaces such references with null in the state that is
//!   about to be written (the association is fixed up by a later UPDATE);
//! - [`find_non_nullable_transient_entities`] reports references that
//!   *cannot* be nulled because the column is `NOT NULL`; the insert has to
//!   wait until those entities are inserted.

use crate::Session;
use crate::classifier;
use ormstate_core::{
    AttributeDescriptor, AttributeKind, AttributeValue, EntityHandle, EntityReference, Error,
    Result,
};

/// Nulls out references to entities that have no row yet.
#[derive(Debug, Clone)]
pub struct Nullifier {
    self_instance: Option<EntityHandle>,
    is_delete: bool,
    is_early_insert: bool,
}

impl Nullifier {
    /// Create a nullifier for the state of `self_instance`.
    pub fn new(self_instance: Option<&EntityHandle>, is_delete: bool, is_early_insert: bool) -> Self {
        Self {
            self_instance: self_instance.cloned(),
            is_delete,
            is_early_insert,
        }
    }

    /// Return a copy of `values` with every nullifiable reference replaced by
    /// null. The output is positionally aligned with `values`.
    #[tracing::instrument(level = "debug", skip_all, fields(
        entity = ?self.self_instance.as_ref().map(EntityHandle::describe),
        delete = self.is_delete,
        early_insert = self.is_early_insert,
    ))]
    pub fn nullify_transient_references(
        &self,
        session: &mut Session,
        values: &[AttributeValue],
        attributes: &[AttributeDescriptor],
    ) -> Result<Vec<AttributeValue>> {
        let mut output = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            let replaced = match attributes.get(i) {
                Some(attribute) => self.nullify_value(session, value, attribute)?,
                None => None,
            };
            output.push(replaced.unwrap_or_else(|| value.clone()));
        }
        Ok(output)
    }

    /// The replacement for one value, or `None` to keep it.
    fn nullify_value(
        &self,
        session: &mut Session,
        value: &AttributeValue,
        attribute: &AttributeDescriptor,
    ) -> Result<Option<AttributeValue>> {
        if value.is_null() {
            return Ok(None);
        }
        match &attribute.kind {
            AttributeKind::OneToOne { .. } | AttributeKind::Basic => Ok(None),
            AttributeKind::ManyToOne { target } => {
                if self.is_nullifiable(session, Some(target), value)? {
                    tracing::trace!(attribute = %attribute.name, "Nulling reference to unsaved entity");
                    Ok(Some(AttributeValue::Null))
                } else {
                    Ok(None)
                }
            }
            AttributeKind::Any => {
                if self.is_nullifiable(session, None, value)? {
                    tracing::trace!(attribute = %attribute.name, "Nulling polymorphic reference");
                    Ok(Some(AttributeValue::Null))
                } else {
                    Ok(None)
                }
            }
            AttributeKind::Embedded(embeddable) => {
                let AttributeValue::Embedded(embedded) = value else {
                    return Ok(None);
                };
                let mut substitute = false;
                let mut children = Vec::with_capacity(embedded.values().len());
                for (j, child) in embedded.values().iter().enumerate() {
                    let replaced = match embeddable.attributes.get(j) {
                        Some(child_attribute) => self.nullify_value(session, child, child_attribute)?,
                        None => None,
                    };
                    substitute |= replaced.is_some();
                    children.push(replaced.unwrap_or_else(|| child.clone()));
                }
                if !substitute {
                    return Ok(None);
                }
                let mut replacement = embedded.clone();
                replacement.replace_values(children);
                Ok(Some(AttributeValue::Embedded(replacement)))
            }
        }
    }

    /// Whether a foreign key to `value` must be nulled for the insert to
    /// succeed.
    pub fn is_nullifiable(
        &self,
        session: &mut Session,
        entity_name: Option<&str>,
        value: &AttributeValue,
    ) -> Result<bool> {
        let handle = match value {
            AttributeValue::Entity(EntityReference::Loaded(handle)) => handle,
            AttributeValue::Entity(EntityReference::Removed(key)) => {
                let context = session.context();
                return Ok(context.is_nullifiable_entity_key(key)
                    || context.entry_for_key(key).is_none());
            }
            // proxies, unfetched properties and raw keys point at existing rows
            _ => return Ok(false),
        };

        if self
            .self_instance
            .as_ref()
            .is_some_and(|me| me.same_instance(handle))
        {
            let self_ref_bug = session.factory().config().self_referential_fk_bug;
            return Ok(self.is_early_insert || (self.is_delete && self_ref_bug));
        }

        if let Some(entry) = session.context().get_entry(handle) {
            return Ok(entry.is_nullifiable(self.is_early_insert, session.context()));
        }

        Ok(classifier::classify(session, entity_name, value, None)?.is_transient())
    }
}

/// One reference that blocks an insert.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientDependency {
    /// Attribute path, e.g. `customer` or `address.city`
    pub path: String,
    /// The referenced entity
    pub reference: EntityReference,
}

/// References through non-nullable columns to entities not yet inserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NonNullableTransientDependencies {
    dependencies: Vec<TransientDependency>,
}

impl NonNullableTransientDependencies {
    fn add(&mut self, path: String, reference: EntityReference) {
        self.dependencies.push(TransientDependency { path, reference });
    }

    /// Whether nothing blocks the insert any more.
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Number of blocking references.
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Blocking references in attribute order.
    pub fn iter(&self) -> impl Iterator<Item = &TransientDependency> {
        self.dependencies.iter()
    }

    /// Paths through which `entity` blocks the insert.
    pub fn paths_for(&self, entity: &EntityHandle) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|d| d.reference.handle().is_some_and(|h| h.same_instance(entity)))
            .map(|d| d.path.as_str())
            .collect()
    }

    /// `entity` has been inserted: drop every dependency on it. Returns
    /// whether anything was dropped.
    pub fn resolve(&mut self, entity: &EntityHandle) -> bool {
        let before = self.dependencies.len();
        self.dependencies
            .retain(|d| !d.reference.handle().is_some_and(|h| h.same_instance(entity)));
        before != self.dependencies.len()
    }

    /// The error reported when the insert can never proceed.
    pub fn to_error(&self, entity_name: &str) -> Error {
        match self.dependencies.first() {
            Some(first) => {
                Error::transient_property(entity_name, &first.path, first.reference.describe())
            }
            None => Error::Custom(format!("{entity_name} has no unresolved dependencies")),
        }
    }
}

/// Collect the non-nullable references from `values` whose targets have no
/// row yet. `None` means the insert may proceed.
#[tracing::instrument(level = "debug", skip(session, entity, values), fields(entity = %entity.describe()))]
pub fn find_non_nullable_transient_entities(
    session: &mut Session,
    entity_name: &str,
    entity: &EntityHandle,
    values: &[AttributeValue],
    early_insert: bool,
) -> Result<Option<NonNullableTransientDependencies>> {
    let descriptor = session.descriptor(entity_name)?;
    let nullifier = Nullifier::new(Some(entity), false, early_insert);
    let mut found = NonNullableTransientDependencies::default();
    for (attribute, value) in descriptor.attributes().iter().zip(values) {
        collect_non_nullable_transient_entities(
            session,
            &nullifier,
            value,
            &attribute.name,
            attribute,
            attribute.nullable,
            &mut found,
        )?;
    }
    if found.is_empty() {
        Ok(None)
    } else {
        tracing::debug!(count = found.len(), "Insert blocked by transient references");
        Ok(Some(found))
    }
}

fn collect_non_nullable_transient_entities(
    session: &mut Session,
    nullifier: &Nullifier,
    value: &AttributeValue,
    path: &str,
    attribute: &AttributeDescriptor,
    nullable: bool,
    found: &mut NonNullableTransientDependencies,
) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    match &attribute.kind {
        AttributeKind::ManyToOne { target } => {
            if !nullable && nullifier.is_nullifiable(session, Some(target), value)? {
                record(found, path, value);
            }
        }
        AttributeKind::Any => {
            if !nullable && nullifier.is_nullifiable(session, None, value)? {
                record(found, path, value);
            }
        }
        AttributeKind::Embedded(embeddable) => {
            let AttributeValue::Embedded(embedded) = value else {
                return Ok(());
            };
            for (child_attribute, child) in embeddable.attributes.iter().zip(embedded.values()) {
                let child_path = format!("{path}.{}", child_attribute.name);
                collect_non_nullable_transient_entities(
                    session,
                    nullifier,
                    child,
                    &child_path,
                    child_attribute,
                    child_attribute.nullable,
                    found,
                )?;
            }
        }
        AttributeKind::OneToOne { .. } | AttributeKind::Basic => {}
    }
    Ok(())
}

fn record(found: &mut NonNullableTransientDependencies, path: &str, value: &AttributeValue) {
    if let AttributeValue::Entity(reference) = value {
        tracing::trace!(path, target = %reference.describe(), "Non-nullable transient reference");
        found.add(path.to_string(), reference.clone());
    }
}
