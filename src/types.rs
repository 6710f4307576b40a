use crate::sync::UnsafeCell;
use derive_more::{Deref, DerefMut, Display};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::{HashMap as _HashMap, HashSet as _HashSet};

/// Opaque value flowing through a plan.
///
/// The engine never looks inside a value except to coerce it to a declared
/// port type or to resolve a projection path.
pub use serde_json::Value;

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Sync`.
///
/// Used internally by the executor to enable interior mutability across threads
/// while correctness is ensured by scheduling (no concurrent writers/readers on
/// the same slot in conflicting phases).
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }

    pub(crate) fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

/// Stable arena index of a node inside a [`PlanGraph`](crate::plan::PlanGraph).
///
/// Two handles are "the same node" for join purposes iff their ids are equal.
/// Structural equality is a separate notion owned by the optimizer.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("#{_0}")]
#[repr(transparent)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Position of the node in its graph's arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// For every identity-bearing ancestor, the index of the element it
/// contributed to a produced value.
pub(crate) type Origins = IndexMap<NodeId, usize>;

/// One produced element together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Item {
    pub(crate) value: Value,
    pub(crate) origins: Origins,
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
