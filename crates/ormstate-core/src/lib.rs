//! Core types for ormstate.
//!
//! This crate provides the foundations shared by the session layer:
//!
//! - `Value` for dynamically typed column values
//! - `Identifier` / `EntityKey` for unit-of-work identity
//! - `EntityDescriptor` and friends, the read-only metamodel
//! - `EntityInstance` / `EntityHandle` / `AttributeValue` for entity state
//! - `Row` for hydration input

pub mod error;
pub mod instance;
pub mod key;
pub mod metadata;
pub mod row;
pub mod value;

pub use error::{Error, Result};
pub use instance::{
    AttributeValue, EmbeddedValue, EntityHandle, EntityInstance, EntityReference, InstanceId,
};
pub use key::{EntityKey, Identifier};
pub use metadata::{
    AfterInitialize, AttributeDescriptor, AttributeKind, EmbeddableDescriptor, EntityDescriptor,
    IdGenerator, IdentifierDescriptor, Metamodel, UnsavedValue,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
