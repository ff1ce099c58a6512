#![forbid(unsafe_code)]

//! Instanced rendering: one consumer for the whole scene.
//!
//! [`InstancedBatch`] subscribes once to the positions mapping (identity
//! compared, so it is woken once per transition) and writes each item's
//! rotation into a contiguous transform buffer on the per-frame read step.
//! Slots are assigned in id order and reassigned only when the item set
//! changes.

use std::sync::Arc;

use ahash::AHashMap;
use gyre_core::state::{ItemId, Orientation, Positions};
use tracing::debug;

use super::consumer::RenderDecoupled;
use super::select;
use crate::store::Store;

/// Row-major 3×3 rotation matrix of one instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceTransform {
    pub rows: [[f32; 3]; 3],
}

impl InstanceTransform {
    pub const IDENTITY: Self = Self {
        rows: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    /// Rotation for Euler angles applied in XYZ order.
    #[must_use]
    pub fn from_orientation(o: Orientation) -> Self {
        let (b, a) = o.x.sin_cos();
        let (d, c) = o.y.sin_cos();
        let (f, e) = o.z.sin_cos();
        let m = [
            [c * e, -c * f, d],
            [a * f + b * e * d, a * e - b * f * d, -b * c],
            [b * f - a * e * d, b * e + a * f * d, a * c],
        ];
        Self {
            rows: m.map(|row| row.map(|v| v as f32)),
        }
    }

    /// Whether every element is within `eps` of `other`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, eps: f32) -> bool {
        self.rows
            .iter()
            .flatten()
            .zip(other.rows.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= eps)
    }
}

impl Default for InstanceTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Whole-scene consumer writing transforms into an instance buffer.
#[derive(Debug)]
pub struct InstancedBatch {
    source: RenderDecoupled<Arc<Positions>>,
    slots: AHashMap<ItemId, usize>,
    instances: Vec<InstanceTransform>,
    frames: u64,
}

impl InstancedBatch {
    /// Mount on `store` and fill the buffer from the current state.
    pub fn mount(store: &Store) -> Self {
        let source = RenderDecoupled::mount_with(store, select::positions(), select::by_ptr);
        let mut batch = Self {
            source,
            slots: AHashMap::new(),
            instances: Vec::new(),
            frames: 0,
        };
        batch.apply_frame();
        batch
    }

    /// The per-frame read step. Returns the number of instances written.
    pub fn apply_frame(&mut self) -> usize {
        self.frames += 1;
        let positions = self.source.apply(Arc::clone);

        let reslot = self.slots.len() != positions.len()
            || positions.iter().any(|(id, _)| !self.slots.contains_key(&id));
        if reslot {
            let mut ids: Vec<ItemId> = positions.iter().map(|(id, _)| id).collect();
            ids.sort_unstable();
            self.slots = ids.iter().enumerate().map(|(slot, id)| (*id, slot)).collect();
            self.instances.clear();
            self.instances.resize(ids.len(), InstanceTransform::IDENTITY);
            debug!(instances = ids.len(), "instance slots reassigned");
        }

        for (id, orientation) in positions.iter() {
            if let Some(&slot) = self.slots.get(&id) {
                self.instances[slot] = InstanceTransform::from_orientation(orientation);
            }
        }
        self.instances.len()
    }

    /// Whether the store published positions the buffer has not picked up.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.source.has_unapplied()
    }

    #[must_use]
    pub fn instances(&self) -> &[InstanceTransform] {
        &self.instances
    }

    #[must_use]
    pub fn slot(&self, id: ItemId) -> Option<usize> {
        self.slots.get(&id).copied()
    }

    #[must_use]
    pub fn instance(&self, id: ItemId) -> Option<&InstanceTransform> {
        self.slot(id).and_then(|slot| self.instances.get(slot))
    }

    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }
}
