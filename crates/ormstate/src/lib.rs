//! ormstate - entity state resolution and load pipeline for relational entity graphs.
//!
//! ormstate is the session core of an object-relational mapper. For one
//! unit of work it provides:
//!
//! - An identity registry: one in-memory instance per database row
//! - Transient vs persistent classification of references
//! - Foreign-key nullification and insert reordering for unsaved references
//! - Two-phase materialization of query results, with second-level cache
//!   write-through and dirty-checking snapshots
//!
//! SQL generation, query compilation and connections are outside this crate;
//! they plug in through [`RowSource`], [`SnapshotSource`], [`EntityWriter`]
//! and [`EntityDataAccess`].
//!
//! # Quick Start
//!
//! ```ignore
//! use ormstate::prelude::*;
//!
//! let metamodel = Metamodel::new()
//!     .with(
//!         EntityDescriptor::new("Customer", IdentifierDescriptor::new("id", IdGenerator::Sequence))
//!             .attribute(AttributeDescriptor::basic("name")),
//!     )
//!     .with(
//!         EntityDescriptor::new("Order", IdentifierDescriptor::new("id", IdGenerator::Sequence))
//!             .attribute(AttributeDescriptor::many_to_one("customer", "Customer").nullable(false)),
//!     );
//! let factory = Arc::new(SessionFactory::new(metamodel, FactoryConfig::default()));
//! let mut session = factory.open_session();
//!
//! // Load
//! let rows = vec![Row::from_values(vec![Value::BigInt(1), Value::Text("Alice".into())])];
//! let customers = session.load("Customer", rows.into_iter(), &LoadOptions::default())?;
//!
//! // Save: the insert waits until the customer it references has a row
//! session.save(&order, false)?;
//! session.save(&customer, false)?;
//! session.flush(&mut writer)?;
//! ```

pub use ormstate_core::{
    AfterInitialize, AttributeDescriptor, AttributeKind, AttributeValue, ColumnInfo,
    EmbeddableDescriptor, EmbeddedValue, EntityDescriptor, EntityHandle, EntityInstance,
    EntityKey, EntityReference, Error, IdGenerator, Identifier, IdentifierDescriptor, InstanceId,
    Metamodel, Result, Row, UnsavedValue, Value,
};
pub use ormstate_session::{
    ActionQueue, CacheEntry, CacheKey, CacheMode, CacheValue, CachedValue, DeleteAction,
    EntityDataAccess, EntityEntry, EntityState, EntityStatus, EntityWriter, FactoryConfig,
    FlushResult, InMemoryEntityRegion, InsertAction, Interceptor, LoadEventCallbacks, LoadOptions,
    Loader, LoadingEntities, LockMode, NaturalId, NaturalIdResolutions,
    NonNullableTransientDependencies, Nullifier, ObjectSnapshot, ParkedInsert, PersistenceContext,
    PostLoadEvent, PreLoadEvent, ProxyState, RowSource, Session, SessionConfig, SessionFactory,
    SnapshotSource, SoftLock, Statistics, StatisticsSnapshot, TransientDependency,
    UnresolvedInserts, extract_natural_id_values, hydrate_row,
};
pub use ormstate_session::{classifier, foreign_keys};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        // Metamodel
        AttributeDescriptor,
        AttributeValue,
        // Cache
        CacheMode,
        EmbeddableDescriptor,
        EntityDescriptor,
        EntityHandle,
        EntityKey,
        EntityReference,
        EntityState,
        EntityStatus,
        EntityWriter,
        Error,
        // Session
        FactoryConfig,
        IdGenerator,
        Identifier,
        IdentifierDescriptor,
        Interceptor,
        LoadOptions,
        LockMode,
        Metamodel,
        Result,
        Row,
        Session,
        SessionConfig,
        SessionFactory,
        Value,
    };
}
