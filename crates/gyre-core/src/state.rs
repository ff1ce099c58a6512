#![forbid(unsafe_code)]

//! Scene state: the value published by the store on every transition.
//!
//! A [`SceneState`] is immutable once built. Transitions never edit a state in
//! place; they build a new one from the previous one. Both heavy fields are
//! behind `Arc`, so cloning a state is O(1) and two clones of the same
//! snapshot can be recognised with [`SceneState::same_snapshot`].
//!
//! # Invariants
//!
//! 1. `ids().len() == count() == positions().len()`.
//! 2. Every id in `ids()` is unique and has an entry in `positions()`.
//! 3. `positions()` has no entries for ids absent from `ids()`.
//! 4. `generation()` strictly increases across transitions of one store, so
//!    successive states are never equal even when `count() == 0`.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use ahash::RandomState;
use rand::Rng;

use crate::error::StoreError;

/// Stable identifier of one simulated item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u32);

impl ItemId {
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for ItemId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Orientation angles of an item, in radians, one per axis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Orientation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Orientation {
    #[inline]
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Uniformly random angles in `[0, π)` on each axis.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            x: rng.random_range(0.0..PI),
            y: rng.random_range(0.0..PI),
            z: rng.random_range(0.0..PI),
        }
    }

    /// The same orientation with `step` added to every axis.
    #[inline]
    #[must_use]
    pub fn offset(self, step: f64) -> Self {
        Self {
            x: self.x + step,
            y: self.y + step,
            z: self.z + step,
        }
    }

    #[inline]
    #[must_use]
    pub const fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Whether every axis differs from `other` by at most `eps`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, eps: f64) -> bool {
        (self.x - other.x).abs() <= eps
            && (self.y - other.y).abs() <= eps
            && (self.z - other.z).abs() <= eps
    }
}

impl From<(f64, f64, f64)> for Orientation {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Self { x, y, z }
    }
}

/// Hash map from item id to orientation.
pub type OrientationMap = HashMap<ItemId, Orientation, RandomState>;

/// The `positions` mapping of a scene.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Positions {
    map: OrientationMap,
}

impl Positions {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            map: OrientationMap::with_capacity_and_hasher(capacity, RandomState::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: ItemId) -> Option<Orientation> {
        self.map.get(&id).copied()
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, id: ItemId) -> bool {
        self.map.contains_key(&id)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (ItemId, Orientation)> + '_ {
        self.map.iter().map(|(id, o)| (*id, *o))
    }

    #[must_use]
    pub fn as_map(&self) -> &OrientationMap {
        &self.map
    }
}

/// Validate a requested item count.
///
/// Negative counts, and counts too large to give each item a distinct `u32`
/// id, are rejected with [`StoreError::InvalidCount`].
pub fn checked_count(requested: i64) -> Result<usize, StoreError> {
    let max = u64::from(u32::MAX) + 1;
    match u64::try_from(requested) {
        Ok(n) if n <= max => {
            usize::try_from(n).map_err(|_| StoreError::invalid_count(requested))
        }
        _ => Err(StoreError::invalid_count(requested)),
    }
}

/// Immutable snapshot of the simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneState {
    generation: u64,
    ids: Arc<[ItemId]>,
    positions: Arc<Positions>,
}

impl Default for SceneState {
    fn default() -> Self {
        Self::empty()
    }
}

impl SceneState {
    /// The initial state of every store: no items, generation 0.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            generation: 0,
            ids: Arc::from(Vec::new()),
            positions: Arc::new(Positions::default()),
        }
    }

    /// Build `count` items with ids `0..count` and random orientations.
    ///
    /// Nothing from any previous state is carried over.
    pub fn populated<R: Rng + ?Sized>(generation: u64, count: usize, rng: &mut R) -> Self {
        let mut ids = Vec::with_capacity(count);
        let mut positions = Positions::with_capacity(count);
        for raw in 0..count {
            // `checked_count` bounds `count` to the u32 id space.
            let id = ItemId(raw as u32);
            ids.push(id);
            positions.map.insert(id, Orientation::random(rng));
        }
        Self {
            generation,
            ids: Arc::from(ids),
            positions: Arc::new(positions),
        }
    }

    /// Translate every item by `step` on each axis, visiting `ids` in order.
    ///
    /// An id without a prior orientation is dropped from the result; the
    /// constructors never produce such a state.
    #[must_use]
    pub fn advanced(&self, generation: u64, step: f64) -> Self {
        let mut positions = Positions::with_capacity(self.ids.len());
        for id in self.ids.iter() {
            if let Some(prev) = self.positions.get(*id) {
                positions.map.insert(*id, prev.offset(step));
            }
        }
        let ids = if positions.len() == self.ids.len() {
            Arc::clone(&self.ids)
        } else {
            self.ids.iter().copied().filter(|id| positions.contains(*id)).collect()
        };
        Self {
            generation,
            ids,
            positions: Arc::new(positions),
        }
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    #[must_use]
    pub fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    #[inline]
    #[must_use]
    pub fn positions(&self) -> &Positions {
        &self.positions
    }

    /// Shared handle to the positions mapping, for whole-scene projections.
    #[inline]
    #[must_use]
    pub fn positions_shared(&self) -> Arc<Positions> {
        Arc::clone(&self.positions)
    }

    #[inline]
    #[must_use]
    pub fn orientation(&self, id: ItemId) -> Option<Orientation> {
        self.positions.get(id)
    }

    /// Whether `other` is a clone of this exact snapshot (pointer identity).
    #[must_use]
    pub fn same_snapshot(&self, other: &Self) -> bool {
        self.generation == other.generation
            && Arc::ptr_eq(&self.ids, &other.ids)
            && Arc::ptr_eq(&self.positions, &other.positions)
    }
}
