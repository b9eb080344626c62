//! Per-scope instance storage
//!
//! Uses DashMap for lock-free concurrent access. Each scope node owns one
//! [`NodeCache`]: the cached instances themselves plus the single-flight
//! gates for constructions currently running on behalf of that node.

use crate::factory::{DisposerFn, ErasedInstance};
use crate::provider::Binding;
use crate::Result;
use ahash::RandomState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of one resolution: the instance and the depth it is cached at.
///
/// `depth` is `None` for unscoped instances, which live nowhere.
#[derive(Clone)]
pub(crate) struct Resolved {
    pub instance: ErasedInstance,
    pub depth: Option<u32>,
}

/// Shared slot that concurrent callers block on while one of them constructs
pub(crate) type Gate = Arc<OnceCell<Result<Resolved>>>;

/// A cached instance
pub(crate) struct CacheEntry {
    pub instance: ErasedInstance,
    /// Always the depth of the node holding the entry
    pub owner_depth: u32,
    /// Insertion sequence, used to dispose in reverse order
    seq: u64,
    pub disposer: Option<DisposerFn>,
}

/// Thread-safe cache for one scope node
pub(crate) struct NodeCache {
    entries: DashMap<Binding, CacheEntry, RandomState>,
    pending: DashMap<Binding, Gate, RandomState>,
    next_seq: AtomicU64,
}

impl NodeCache {
    /// Create an empty cache with 8 shards.
    ///
    /// Default DashMap uses num_cpus * 4 shards which is overkill for
    /// typical scopes holding a handful of instances.
    #[inline]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create with pre-allocated capacity, scaling shards with it.
    pub fn with_capacity(capacity: usize) -> Self {
        let shard_amount = if capacity <= 16 {
            8
        } else if capacity <= 64 {
            16
        } else {
            32
        };
        Self {
            entries: DashMap::with_capacity_and_hasher_and_shard_amount(
                capacity,
                RandomState::new(),
                shard_amount,
            ),
            pending: DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                RandomState::new(),
                shard_amount,
            ),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Cached instance for a binding, if any
    #[inline]
    pub fn get(&self, binding: &Binding) -> Option<Resolved> {
        self.entries.get(binding).map(|e| Resolved {
            instance: Arc::clone(&e.instance),
            depth: Some(e.owner_depth),
        })
    }

    /// Insert or overwrite an entry, returning the one it replaced
    pub fn insert(
        &self,
        binding: Binding,
        instance: ErasedInstance,
        owner_depth: u32,
        disposer: Option<DisposerFn>,
    ) -> Option<CacheEntry> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            binding,
            CacheEntry {
                instance,
                owner_depth,
                seq,
                disposer,
            },
        )
    }

    /// Insert unless an entry already exists.
    ///
    /// Returns the instance that ends up stored and whether it is the one
    /// passed in.
    pub fn insert_if_absent(
        &self,
        binding: Binding,
        instance: ErasedInstance,
        owner_depth: u32,
        disposer: Option<DisposerFn>,
    ) -> (ErasedInstance, bool) {
        match self.entries.entry(binding) {
            Entry::Occupied(existing) => (Arc::clone(&existing.get().instance), false),
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert(CacheEntry {
                    instance: Arc::clone(&instance),
                    owner_depth,
                    seq,
                    disposer,
                });
                (instance, true)
            }
        }
    }

    /// Gate for a binding, creating it if no construction is in flight
    pub fn gate(&self, binding: &Binding) -> Gate {
        Arc::clone(
            self.pending
                .entry(binding.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        )
    }

    /// Drop the gate once its construction finished, unless it was replaced
    pub fn release_gate(&self, binding: &Binding, gate: &Gate) {
        self.pending.remove_if(binding, |_, current| Arc::ptr_eq(current, gate));
    }

    /// Number of cached entries
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, newest first
    pub fn drain_newest_first(&self) -> Vec<(Binding, CacheEntry)> {
        let keys: Vec<Binding> = self.entries.iter().map(|r| r.key().clone()).collect();
        let mut drained: Vec<(Binding, CacheEntry)> =
            keys.iter().filter_map(|k| self.entries.remove(k)).collect();
        drained.sort_by(|a, b| b.1.seq.cmp(&a.1.seq));
        drained
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("count", &self.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
