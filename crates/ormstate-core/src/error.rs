//! Error types for entity state operations.

use crate::key::EntityKey;
use thiserror::Error;

/// The primary error type for all ormstate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An association references an unsaved instance and the column cannot
    /// be nulled out.
    #[error(
        "object references an unsaved transient instance: {entity}.{property} -> {transient_entity} \
         (save the transient instance before flushing)"
    )]
    TransientPropertyValue {
        /// Owning entity name
        entity: String,
        /// Attribute path, e.g. `customer` or `address.city`
        property: String,
        /// Description of the referenced transient instance
        transient_entity: String,
    },

    /// An identifier was requested for an instance that was never saved.
    #[error("object references an unsaved transient instance of {entity}")]
    TransientObject {
        /// Entity name of the unsaved instance
        entity: String,
    },

    /// A different instance is already registered for this key.
    #[error("a different object with the same identifier is already associated with the session: {key}")]
    NonUniqueObject {
        /// The contested identity key
        key: EntityKey,
    },

    /// Metamodel lookup failed.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// A row could not be hydrated.
    #[error("could not hydrate {entity}.{attribute}: {message}")]
    Hydration {
        /// Entity being hydrated
        entity: String,
        /// Attribute (or identifier) being read
        attribute: String,
        /// What went wrong
        message: String,
    },

    /// A load listener aborted the operation.
    #[error("listener error: {0}")]
    Listener(String),

    /// A database collaborator failed.
    #[error("database error: {0}")]
    Database(String),

    /// The requested capability is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serde(String),

    /// Custom error with message
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Build a `TransientPropertyValue` error.
    pub fn transient_property(
        entity: impl Into<String>,
        property: impl Into<String>,
        transient_entity: impl Into<String>,
    ) -> Self {
        Error::TransientPropertyValue {
            entity: entity.into(),
            property: property.into(),
            transient_entity: transient_entity.into(),
        }
    }

    /// Is this an unsaved-reference error (either flavour)?
    pub fn is_transient_reference(&self) -> bool {
        matches!(
            self,
            Error::TransientPropertyValue { .. } | Error::TransientObject { .. }
        )
    }

    /// Is this an explicitly unimplemented path?
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }

    /// The attribute path named by a `TransientPropertyValue` error.
    pub fn property_path(&self) -> Option<&str> {
        match self {
            Error::TransientPropertyValue { property, .. } => Some(property),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for ormstate operations.
pub type Result<T> = std::result::Result<T, Error>;
