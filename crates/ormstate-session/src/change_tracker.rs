//! Snapshot-based dirty detection.
//!
//! A snapshot is a deep copy of an entity's updatable attribute values taken
//! when the entity becomes managed. Dirty checking compares only those
//! positions; non-updatable attributes never make an entity dirty.

use ormstate_core::{AttributeValue, EntityDescriptor};
use std::time::Instant;

/// Snapshot of an entity's state at a point in time.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    /// Deep-copied values; `None` at non-updatable positions.
    state: Vec<Option<AttributeValue>>,
    /// When the snapshot was taken.
    taken_at: Instant,
}

impl ObjectSnapshot {
    /// Deep copy every updatable position of `state`.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = descriptor.name()))]
    pub fn take(descriptor: &EntityDescriptor, state: &[AttributeValue]) -> Self {
        let updatability = descriptor.updatability();
        let state: Vec<Option<AttributeValue>> = state
            .iter()
            .enumerate()
            .map(|(i, value)| {
                updatability
                    .get(i)
                    .copied()
                    .unwrap_or(false)
                    .then(|| value.clone())
            })
            .collect();
        tracing::trace!(
            copied = state.iter().filter(|v| v.is_some()).count(),
            "Taking entity snapshot"
        );
        Self {
            state,
            taken_at: Instant::now(),
        }
    }

    /// The snapshot value at `index`, if that position is tracked.
    pub fn value(&self, index: usize) -> Option<&AttributeValue> {
        self.state.get(index).and_then(Option::as_ref)
    }

    /// Number of positions (tracked or not).
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Whether the snapshot covers no attributes.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// When the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// Names of updatable attributes whose current value differs.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = descriptor.name()))]
    pub fn dirty_attributes<'d>(
        &self,
        descriptor: &'d EntityDescriptor,
        current: &[AttributeValue],
    ) -> Vec<&'d str> {
        let mut changed = Vec::new();
        for (i, attribute) in descriptor.attributes().iter().enumerate() {
            let Some(Some(original)) = self.state.get(i) else {
                continue;
            };
            if current.get(i) != Some(original) {
                changed.push(attribute.name.as_str());
            }
        }
        tracing::debug!(changed_count = changed.len(), fields = ?changed, "Detected changed attributes");
        changed
    }

    /// Whether any updatable attribute changed.
    pub fn is_dirty(&self, descriptor: &EntityDescriptor, current: &[AttributeValue]) -> bool {
        !self.dirty_attributes(descriptor, current).is_empty()
    }
}
