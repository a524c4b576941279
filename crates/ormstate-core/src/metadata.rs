//! Entity and attribute metadata.
//!
//! This is the read-only "type/attribute metadata provider" the session
//! consults: for each entity, its ordered attributes, their classification,
//! nullability and updatability, the identifier strategy, version and
//! natural-id attributes, mutability and caching.

use crate::error::{Error, Result};
use crate::instance::{AttributeValue, EntityHandle, EntityInstance};
use crate::key::{EntityKey, Identifier};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Classification of a persistent attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeKind {
    /// Scalar, column-backed.
    Basic,
    /// Composite value holding child attributes.
    Embedded(EmbeddableDescriptor),
    /// To-one association whose foreign key lives on this entity's table.
    ManyToOne {
        /// Target entity name.
        target: String,
    },
    /// To-one association whose foreign key lives on the other side (or is
    /// the shared primary key).
    OneToOne {
        /// Target entity name.
        target: String,
    },
    /// Polymorphic association with no fixed target type.
    Any,
}

impl AttributeKind {
    /// Whether values of this kind reference other entities.
    pub fn is_association(&self) -> bool {
        matches!(
            self,
            AttributeKind::ManyToOne { .. } | AttributeKind::OneToOne { .. } | AttributeKind::Any
        )
    }

    /// The statically known target entity, if any.
    pub fn target_entity(&self) -> Option<&str> {
        match self {
            AttributeKind::ManyToOne { target } | AttributeKind::OneToOne { target } => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Short name of the classification, for logs.
    pub const fn classification(&self) -> &'static str {
        match self {
            AttributeKind::Basic => "BASIC",
            AttributeKind::Embedded(_) => "EMBEDDED",
            AttributeKind::ManyToOne { .. } => "MANY_TO_ONE",
            AttributeKind::OneToOne { .. } => "ONE_TO_ONE",
            AttributeKind::Any => "ANY",
        }
    }
}

/// Metadata about one persistent attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescriptor {
    /// Attribute name
    pub name: String,
    /// Classification
    pub kind: AttributeKind,
    /// Whether the backing column(s) accept NULL
    pub nullable: bool,
    /// Whether the attribute participates in UPDATE (and dirty checking)
    pub updatable: bool,
    /// Lazy attributes are not selected; they hydrate as `Unfetched`
    pub lazy: bool,
    /// Number of row columns this attribute reads during hydration
    pub column_span: usize,
}

impl AttributeDescriptor {
    fn with_kind(name: impl Into<String>, kind: AttributeKind, column_span: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
            updatable: true,
            lazy: false,
            column_span,
        }
    }

    /// A scalar attribute reading one column.
    pub fn basic(name: impl Into<String>) -> Self {
        Self::with_kind(name, AttributeKind::Basic, 1)
    }

    /// A many-to-one association reading one foreign key column.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            AttributeKind::ManyToOne {
                target: target.into(),
            },
            1,
        )
    }

    /// A one-to-one association sharing the owner's primary key.
    ///
    /// It reads no columns of its own; the owner's identifier is the key.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            AttributeKind::OneToOne {
                target: target.into(),
            },
            0,
        )
    }

    /// A polymorphic association: one discriminator column plus one id column.
    pub fn any(name: impl Into<String>) -> Self {
        Self::with_kind(name, AttributeKind::Any, 2)
    }

    /// A composite attribute.
    pub fn embedded(name: impl Into<String>, embeddable: EmbeddableDescriptor) -> Self {
        let span = embeddable.column_span();
        Self::with_kind(name, AttributeKind::Embedded(embeddable), span)
    }

    /// Set nullability.
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set updatability.
    pub fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    /// Mark the attribute lazy. Lazy attributes read no columns.
    pub fn lazy(mut self, value: bool) -> Self {
        self.lazy = value;
        self
    }

    /// Override the number of columns read (e.g. composite foreign keys).
    pub fn columns(mut self, span: usize) -> Self {
        self.column_span = span;
        self
    }

    /// Columns actually read from a row for this attribute.
    pub fn effective_column_span(&self) -> usize {
        if self.lazy { 0 } else { self.column_span }
    }
}

/// Metadata for a composite (embeddable) type.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddableDescriptor {
    /// Embeddable type name
    pub name: String,
    /// Child attributes in declaration order
    pub attributes: Vec<AttributeDescriptor>,
}

impl EmbeddableDescriptor {
    /// Create an embeddable descriptor.
    pub fn new(name: impl Into<String>, attributes: Vec<AttributeDescriptor>) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }

    /// Per-child nullability.
    pub fn nullability(&self) -> Vec<bool> {
        self.attributes.iter().map(|a| a.nullable).collect()
    }

    /// Total columns read by all children.
    pub fn column_span(&self) -> usize {
        self.attributes
            .iter()
            .map(AttributeDescriptor::effective_column_span)
            .sum()
    }
}

/// Identifier generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdGenerator {
    /// The application assigns identifiers.
    Assigned,
    /// Identity column: the id only exists after the INSERT runs, which
    /// forces an early insert.
    Identity,
    /// Generated before insert (sequence, table, uuid).
    #[default]
    Sequence,
}

/// How to recognise an unsaved identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum UnsavedValue {
    /// A missing or null identifier means unsaved; anything else is saved.
    Null,
    /// The identifier says nothing.
    Undefined,
    /// Always unsaved.
    Any,
    /// Never unsaved.
    Never,
    /// Unsaved iff the identifier equals this value.
    Exact(Identifier),
}

impl UnsavedValue {
    /// Interpret an identifier: `Some(true)` for unsaved, `None` when unknown.
    pub fn is_unsaved(&self, id: Option<&Identifier>) -> Option<bool> {
        match self {
            UnsavedValue::Null => Some(id.is_none_or(Identifier::is_null)),
            UnsavedValue::Undefined => None,
            UnsavedValue::Any => Some(true),
            UnsavedValue::Never => Some(false),
            UnsavedValue::Exact(expected) => Some(id.is_some_and(|id| id == expected)),
        }
    }
}

/// Identifier attribute metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierDescriptor {
    /// Identifier attribute name
    pub name: String,
    /// Number of identifier columns
    pub column_span: usize,
    /// Generation strategy
    pub generator: IdGenerator,
    /// Unsaved-value strategy
    pub unsaved_value: UnsavedValue,
}

impl IdentifierDescriptor {
    /// Single-column identifier with the generator's default unsaved-value.
    pub fn new(name: impl Into<String>, generator: IdGenerator) -> Self {
        let unsaved_value = match generator {
            IdGenerator::Assigned => UnsavedValue::Undefined,
            IdGenerator::Identity | IdGenerator::Sequence => UnsavedValue::Null,
        };
        Self {
            name: name.into(),
            column_span: 1,
            generator,
            unsaved_value,
        }
    }

    /// Set the number of identifier columns.
    pub fn columns(mut self, span: usize) -> Self {
        self.column_span = span;
        self
    }

    /// Override the unsaved-value strategy.
    pub fn unsaved_value(mut self, value: UnsavedValue) -> Self {
        self.unsaved_value = value;
        self
    }
}

/// Type-level hook run after an instance is fully initialized.
#[derive(Clone)]
pub struct AfterInitialize(Arc<dyn Fn(&EntityHandle) + Send + Sync>);

impl AfterInitialize {
    /// Wrap a hook.
    pub fn new(f: impl Fn(&EntityHandle) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Run the hook.
    pub fn call(&self, handle: &EntityHandle) {
        (self.0)(handle);
    }
}

impl fmt::Debug for AfterInitialize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AfterInitialize(..)")
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    name: String,
    root_name: String,
    identifier: IdentifierDescriptor,
    attributes: Vec<AttributeDescriptor>,
    version_attribute: Option<String>,
    natural_id: Option<Vec<String>>,
    mutable: bool,
    cache_region: Option<String>,
    after_initialize: Option<AfterInitialize>,
}

impl EntityDescriptor {
    /// Create a root entity descriptor with no attributes.
    pub fn new(name: impl Into<String>, identifier: IdentifierDescriptor) -> Self {
        let name = name.into();
        Self {
            root_name: name.clone(),
            name,
            identifier,
            attributes: Vec::new(),
            version_attribute: None,
            natural_id: None,
            mutable: true,
            cache_region: None,
            after_initialize: None,
        }
    }

    /// Declare this entity a subclass within `root`'s hierarchy.
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root_name = root.into();
        self
    }

    /// Append an attribute.
    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Use the named basic attribute as the optimistic-lock version.
    pub fn version(mut self, attribute: impl Into<String>) -> Self {
        self.version_attribute = Some(attribute.into());
        self
    }

    /// Declare the natural id attributes.
    pub fn natural_id(mut self, attributes: &[&str]) -> Self {
        self.natural_id = Some(attributes.iter().map(|s| (*s).to_string()).collect());
        self
    }

    /// Mark the type immutable (always loaded read-only).
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Enable second-level caching in the given region.
    pub fn cacheable(mut self, region: impl Into<String>) -> Self {
        self.cache_region = Some(region.into());
        self
    }

    /// Install the post-initialization hook.
    pub fn after_initialize(mut self, hook: impl Fn(&EntityHandle) + Send + Sync + 'static) -> Self {
        self.after_initialize = Some(AfterInitialize::new(hook));
        self
    }

    /// Entity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hierarchy root name (the key space).
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Identifier metadata.
    pub fn identifier(&self) -> &IdentifierDescriptor {
        &self.identifier
    }

    /// Attributes in order.
    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    /// Attribute names in order.
    pub fn property_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name.as_str()).collect()
    }

    /// Per-attribute nullability.
    pub fn nullability(&self) -> Vec<bool> {
        self.attributes.iter().map(|a| a.nullable).collect()
    }

    /// Per-attribute updatability.
    pub fn updatability(&self) -> Vec<bool> {
        self.attributes.iter().map(|a| a.updatable).collect()
    }

    /// Position of the named attribute.
    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Position of the version attribute.
    pub fn version_index(&self) -> Option<usize> {
        self.version_attribute
            .as_deref()
            .and_then(|name| self.attribute_index(name))
    }

    /// Whether the entity carries an optimistic-lock version.
    pub fn is_versioned(&self) -> bool {
        self.version_index().is_some()
    }

    /// Positions of the natural id attributes.
    pub fn natural_id_indices(&self) -> Option<Vec<usize>> {
        self.natural_id.as_ref().map(|names| {
            names
                .iter()
                .filter_map(|name| self.attribute_index(name))
                .collect()
        })
    }

    /// Whether the type is mutable.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Second-level cache region, if cached.
    pub fn cache_region(&self) -> Option<&str> {
        self.cache_region.as_deref()
    }

    /// The post-initialization hook.
    pub fn after_initialize_hook(&self) -> Option<&AfterInitialize> {
        self.after_initialize.as_ref()
    }

    /// Identity key for an identifier of this entity.
    pub fn key_for(&self, id: Identifier) -> EntityKey {
        EntityKey::new(self.root_name.clone(), id)
    }

    /// Total row columns consumed by identifier plus attributes.
    pub fn column_span(&self) -> usize {
        self.identifier.column_span
            + self
                .attributes
                .iter()
                .map(AttributeDescriptor::effective_column_span)
                .sum::<usize>()
    }

    /// The version value inside a state array.
    pub fn version_of(&self, state: &[AttributeValue]) -> Option<Value> {
        let index = self.version_index()?;
        match state.get(index)? {
            AttributeValue::Basic(v) => Some(v.clone()),
            _ => Some(Value::Null),
        }
    }

    /// Instantiate an empty instance of this entity.
    pub fn instantiate(&self, id: Option<Identifier>) -> EntityInstance {
        let mut instance = EntityInstance::new(self.name.clone(), self.attributes.len());
        instance.set_id(id);
        instance
    }

    /// Identifier-based transient heuristics.
    ///
    /// `Some(true)` when the instance is certainly unsaved, `Some(false)`
    /// when certainly saved, `None` when the identifier and version say
    /// nothing (e.g. assigned identifiers).
    pub fn is_transient(&self, instance: &EntityInstance) -> Option<bool> {
        let Some(id) = instance.id() else {
            return Some(true);
        };
        if id.is_null() {
            return Some(true);
        }
        if self.is_versioned() {
            let version = self.version_of(instance.values());
            if matches!(version, None | Some(Value::Null)) {
                return Some(true);
            }
        }
        self.identifier.unsaved_value.is_unsaved(Some(id))
    }
}

/// Registry of entity descriptors by name.
#[derive(Debug, Clone, Default)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityDescriptor>>,
}

impl Metamodel {
    /// Create an empty metamodel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor (builder style).
    #[must_use]
    pub fn with(mut self, descriptor: EntityDescriptor) -> Self {
        self.add(descriptor);
        self
    }

    /// Register a descriptor, replacing any previous one with the same name.
    pub fn add(&mut self, descriptor: EntityDescriptor) {
        self.entities
            .insert(descriptor.name().to_string(), Arc::new(descriptor));
    }

    /// Look up a descriptor.
    pub fn descriptor(&self, name: &str) -> Result<&Arc<EntityDescriptor>> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Iterate over registered descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.values()
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entity is registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
