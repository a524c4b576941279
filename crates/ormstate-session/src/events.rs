//! Load listeners and the session interceptor.

use ormstate_core::{AttributeValue, EntityDescriptor, EntityHandle, Identifier, Result};
use std::sync::Arc;

/// Session-scoped hooks consulted by the state classifier.
pub trait Interceptor {
    /// Override transient detection for `entity`.
    ///
    /// Return `Some(true)` for transient, `Some(false)` for persistent or
    /// detached, `None` to let the session decide.
    fn is_transient(&self, entity: &EntityHandle) -> Option<bool> {
        let _ = entity;
        None
    }
}

/// Fired before materialized state is written onto an instance.
///
/// Listeners may adjust `state`; the adjusted values are what the instance
/// receives.
#[derive(Debug)]
pub struct PreLoadEvent {
    /// The instance being loaded
    pub entity: EntityHandle,
    /// Resolved attribute values
    pub state: Vec<AttributeValue>,
    /// Identifier of the row
    pub id: Identifier,
    /// Entity metadata
    pub descriptor: Arc<EntityDescriptor>,
}

/// Fired once every entity of a load is fully initialized.
#[derive(Debug, Clone)]
pub struct PostLoadEvent {
    /// The loaded instance
    pub entity: EntityHandle,
    /// Identifier of the row
    pub id: Identifier,
    /// Concrete entity name
    pub entity_name: String,
}

type PreLoadFn = Box<dyn FnMut(&mut PreLoadEvent) -> Result<()>>;
type PostLoadFn = Box<dyn FnMut(&PostLoadEvent) -> Result<()>>;

/// Registered load callbacks.
///
/// Returning `Err` from a callback aborts the load.
#[derive(Default)]
pub struct LoadEventCallbacks {
    pre_load: Vec<PreLoadFn>,
    post_load: Vec<PostLoadFn>,
}

impl std::fmt::Debug for LoadEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadEventCallbacks")
            .field("pre_load", &self.pre_load.len())
            .field("post_load", &self.post_load.len())
            .finish()
    }
}

impl LoadEventCallbacks {
    /// Register a pre-load callback.
    pub fn on_pre_load(&mut self, f: impl FnMut(&mut PreLoadEvent) -> Result<()> + 'static) {
        self.pre_load.push(Box::new(f));
    }

    /// Register a post-load callback.
    pub fn on_post_load(&mut self, f: impl FnMut(&PostLoadEvent) -> Result<()> + 'static) {
        self.post_load.push(Box::new(f));
    }

    pub(crate) fn fire_pre_load(&mut self, event: &mut PreLoadEvent) -> Result<()> {
        for cb in &mut self.pre_load {
            cb(event)?;
        }
        Ok(())
    }

    pub(crate) fn fire_post_load(&mut self, event: &PostLoadEvent) -> Result<()> {
        for cb in &mut self.post_load {
            cb(event)?;
        }
        Ok(())
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.pre_load.is_empty() && self.post_load.is_empty()
    }
}
