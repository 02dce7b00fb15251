//! ConcurrentMap: sharded dictionary with per-entry locks and scoped
//! accessors.
//!
//! Each shard is a mutex over the structural layer (a `HashTable` index of
//! slot keys into a `SlotMap` of reference-counted entries). Shard mutexes
//! are held only while probing or relinking, never while waiting on an
//! entry lock, except for a freshly created entry that no other thread can
//! see yet.
//!
//! Binding an accessor clones the entry's `Arc` under the shard mutex, drops
//! the mutex, then takes the entry lock. Erasure takes the entry lock
//! exclusively, unlinks the entry from its shard and marks it erased; an
//! accessor that wins the entry lock after that sees the mark and retries
//! the lookup.

use crate::accessor::{Accessor, ConstAccessor, Entry, MapAccessor, Mode};
use crate::config::MapConfig;
use crate::observer::{NoopObserver, RaceObserver};
use crate::reentrancy::DebugReentrancy;
use crate::thread_registry::ThreadRegistry;
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::Ordering;
use hashbrown::HashTable;
use lock_api::RawRwLock as _;
use parking_lot::Mutex;
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;
use std::sync::Arc;
use tracing::debug;

struct Shard<K, V> {
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Arc<Entry<K, V>>>,
}

// Result of `Shard::insert_if_absent`. `Existing` hands the key and value
// back so the caller can retry after a concurrent erase.
enum Probe<K, V> {
    Existing(Arc<Entry<K, V>>, K, V),
    Created(Arc<Entry<K, V>>),
}

impl<K: Eq, V> Shard<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashTable::with_capacity(capacity),
            slots: SlotMap::with_capacity_and_key(capacity),
        }
    }

    fn find<Q>(&self, hash: u64, q: &Q) -> Option<&Arc<Entry<K, V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let slot = self.index.find(hash, |&k| {
            self.slots
                .get(k)
                .map(|e| e.key.borrow() == q)
                .unwrap_or(false)
        })?;
        self.slots.get(*slot)
    }

    // `lock` is taken on a created entry before it becomes reachable.
    fn insert_if_absent(
        &mut self,
        hash: u64,
        key: K,
        value: V,
        lock: Option<Mode>,
    ) -> Probe<K, V> {
        match self.index.entry(
            hash,
            |&kk| self.slots.get(kk).map(|e| e.key == key).unwrap_or(false),
            |&kk| self.slots.get(kk).map(|e| e.hash).unwrap_or(0),
        ) {
            hashbrown::hash_table::Entry::Occupied(o) => {
                match self.slots.get(*o.get()) {
                    Some(entry) => Probe::Existing(entry.clone(), key, value),
                    // Index and slots are updated together under the shard
                    // mutex; a dangling index entry cannot exist.
                    None => unreachable!("index refers to a vacant slot"),
                }
            }
            hashbrown::hash_table::Entry::Vacant(v) => {
                let slot = self
                    .slots
                    .insert_with_key(|slot| Arc::new(Entry::new(key, hash, slot, value)));
                let _ = v.insert(slot);
                let entry = self.slots[slot].clone();
                if let Some(mode) = lock {
                    mode.acquire(&entry.lock);
                }
                Probe::Created(entry)
            }
        }
    }

    /// Remove `entry` if this shard still links it. Identity, not key
    /// equality, decides.
    fn unlink(&mut self, entry: &Entry<K, V>) -> bool {
        match self.slots.get(entry.slot) {
            Some(live) if core::ptr::eq(Arc::as_ptr(live), entry) => {}
            _ => return false,
        }
        self.slots.remove(entry.slot);
        if let Ok(found) = self.index.find_entry(entry.hash, |&k| k == entry.slot) {
            let _ = found.remove();
        }
        true
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
    }
}

struct ShardCell<K, V> {
    shard: Mutex<Shard<K, V>>,
    reentrancy: DebugReentrancy,
}

impl<K, V> ShardCell<K, V> {
    // Runs `f` under the shard mutex. In debug builds, calling back into
    // the same shard from `K: Eq` panics instead of deadlocking.
    fn with<R>(&self, registry: &ThreadRegistry, f: impl FnOnce(&mut Shard<K, V>) -> R) -> R {
        #[cfg(debug_assertions)]
        let me = registry.current_id();
        #[cfg(not(debug_assertions))]
        let me = {
            let _ = registry;
            0
        };
        self.reentrancy.check(me);
        let mut shard = self.shard.lock();
        let _g = self.reentrancy.enter(me);
        f(&mut shard)
    }
}

/// Concurrent hash map whose entries are reached through scoped
/// [`Accessor`]s and [`ConstAccessor`]s.
///
/// Outcomes are reported as `bool`; nothing here fails. `len`/`is_empty`
/// are instantaneous snapshots, not isolated from concurrent mutation. No
/// operation spans more than one key atomically.
pub struct ConcurrentMap<K, V, S = RandomState> {
    hasher: S,
    shards: Box<[ShardCell<K, V>]>,
    shard_mask: usize,
    observer: Arc<dyn RaceObserver>,
    registry: Arc<ThreadRegistry>,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    /// Map with the default [`MapConfig`], a no-op observer and the global
    /// thread registry.
    pub fn new() -> Self {
        Self::from_parts(
            MapConfig::default(),
            RandomState::new(),
            Arc::new(NoopObserver),
            ThreadRegistry::global().clone(),
        )
    }
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    // `config` is validated by the caller.
    pub(crate) fn from_parts(
        config: MapConfig,
        hasher: S,
        observer: Arc<dyn RaceObserver>,
        registry: Arc<ThreadRegistry>,
    ) -> Self {
        debug_assert!(config.validate().is_ok());
        let shards = (0..config.shards)
            .map(|_| ShardCell {
                shard: Mutex::new(Shard::with_capacity(config.capacity_per_shard)),
                reentrancy: DebugReentrancy::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        debug!(
            shards = config.shards,
            capacity = config.capacity_per_shard,
            "constructed concurrent map"
        );
        Self {
            hasher,
            shards,
            shard_mask: config.shards - 1,
            observer,
            registry,
        }
    }

    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    #[inline]
    fn shard(&self, hash: u64) -> &ShardCell<K, V> {
        // hashbrown consumes the low bits and the top seven; pick from the
        // middle.
        &self.shards[(hash >> 32) as usize & self.shard_mask]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    // Returns the entry locked in `mode`, or `None` if `q` is absent.
    fn lock_existing<Q>(&self, q: &Q, mode: Mode) -> Option<Arc<Entry<K, V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        let cell = self.shard(hash);
        loop {
            let entry = cell.with(&self.registry, |s| s.find(hash, q).cloned())?;
            mode.acquire(&entry.lock);
            if !entry.erased.load(Ordering::Acquire) {
                return Some(entry);
            }
            // SAFETY: acquired just above in `mode`.
            unsafe { mode.release(&entry.lock) };
        }
    }

    // Returns the bound entry locked in `mode` and whether it was created.
    // `make` runs without the shard mutex; if another thread links the key
    // in the meantime, its entry wins and the built value is dropped.
    fn lock_or_insert_with<F>(&self, key: K, make: F, mode: Mode) -> (Arc<Entry<K, V>>, bool)
    where
        F: FnOnce() -> V,
    {
        let hash = self.make_hash(&key);
        let cell = self.shard(hash);
        let mut value = loop {
            match cell.with(&self.registry, |s| s.find(hash, &key).cloned()) {
                Some(entry) => {
                    mode.acquire(&entry.lock);
                    if !entry.erased.load(Ordering::Acquire) {
                        return (entry, false);
                    }
                    // SAFETY: acquired just above in `mode`.
                    unsafe { mode.release(&entry.lock) };
                }
                None => break make(),
            }
        };
        let mut key = key;
        loop {
            let probe = cell.with(&self.registry, |s| {
                s.insert_if_absent(hash, key, value, Some(mode))
            });
            match probe {
                Probe::Created(entry) => return (entry, true),
                Probe::Existing(entry, k, v) => {
                    mode.acquire(&entry.lock);
                    if !entry.erased.load(Ordering::Acquire) {
                        return (entry, false);
                    }
                    // SAFETY: acquired just above in `mode`.
                    unsafe { mode.release(&entry.lock) };
                    key = k;
                    value = v;
                }
            }
        }
    }

    // Caller holds `entry` exclusively.
    fn unlink(&self, entry: &Entry<K, V>) -> bool {
        let removed = self
            .shard(entry.hash)
            .with(&self.registry, |s| s.unlink(entry));
        if removed {
            entry.erased.store(true, Ordering::Release);
        }
        removed
    }

    /// Bind `acc` to the entry for `key` if present. `Accessor` binds
    /// exclusively, `ConstAccessor` shared. Any previous binding is released
    /// first.
    pub fn find<'m, A, Q>(&'m self, acc: &mut A, key: &Q) -> bool
    where
        A: MapAccessor<'m, K, V>,
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        acc.release();
        match self.lock_existing(key, A::MODE) {
            Some(entry) => {
                acc.bind(entry, &*self.observer);
                true
            }
            None => false,
        }
    }

    /// Insert `key -> value` unless `key` is present, then bind `acc` to
    /// the stored entry. Returns whether the entry was created. An existing
    /// value is left untouched and `value` is dropped.
    pub fn insert<'m, A>(&'m self, acc: &mut A, key: K, value: V) -> bool
    where
        A: MapAccessor<'m, K, V>,
    {
        self.insert_with(acc, key, move || value)
    }

    /// Like [`insert`](Self::insert), constructing the value only if the key
    /// is absent. `make` runs with no map lock held and may use the map; if
    /// the key is linked by someone else before the built value is, the
    /// existing entry is bound and the built value is dropped.
    pub fn insert_with<'m, A, F>(&'m self, acc: &mut A, key: K, make: F) -> bool
    where
        A: MapAccessor<'m, K, V>,
        F: FnOnce() -> V,
    {
        acc.release();
        let (entry, created) = self.lock_or_insert_with(key, make, A::MODE);
        acc.bind(entry, &*self.observer);
        created
    }

    /// Key-only insert through an accessor; absent keys get `V::default()`.
    pub fn insert_default<'m, A>(&'m self, acc: &mut A, key: K) -> bool
    where
        A: MapAccessor<'m, K, V>,
        V: Default,
    {
        self.insert_with(acc, key, V::default)
    }

    /// Fire-and-forget insert of `key -> V::default()`. Returns whether the
    /// key was absent.
    pub fn insert_key(&self, key: K) -> bool
    where
        V: Default,
    {
        self.insert_entry(key, V::default())
    }

    /// Fire-and-forget insert. Returns whether the key was absent; an
    /// existing value is left untouched.
    pub fn insert_entry(&self, key: K, value: V) -> bool {
        let hash = self.make_hash(&key);
        let probe = self
            .shard(hash)
            .with(&self.registry, |s| s.insert_if_absent(hash, key, value, None));
        matches!(probe, Probe::Created(_))
    }

    /// Remove the entry bound to `acc` and unbind it. The release
    /// checkpoint is published before removal. A `ConstAccessor` gives up
    /// its shared hold and re-takes the entry exclusively, so another thread
    /// may erase it in between; the result is then `false`.
    pub fn erase<'m, A>(&'m self, acc: &mut A) -> bool
    where
        A: MapAccessor<'m, K, V>,
    {
        let Some(entry) = acc.unbind() else {
            return false;
        };
        if A::MODE == Mode::Shared {
            // SAFETY: the const accessor held the entry shared.
            unsafe { entry.lock.unlock_shared() };
            entry.lock.lock_exclusive();
            if entry.erased.load(Ordering::Acquire) {
                // SAFETY: acquired just above.
                unsafe { entry.lock.unlock_exclusive() };
                return false;
            }
        }
        let removed = self.unlink(&entry);
        // SAFETY: held exclusively, either by the accessor or just above.
        unsafe { entry.lock.unlock_exclusive() };
        removed
    }

    /// Remove `key` without an accessor, waiting for current holders of the
    /// entry to release it.
    pub fn erase_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        match self.lock_existing(key, Mode::Exclusive) {
            Some(entry) => {
                let removed = self.unlink(&entry);
                // SAFETY: locked exclusively by `lock_existing`.
                unsafe { entry.lock.unlock_exclusive() };
                removed
            }
            None => false,
        }
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(key);
        self.shard(hash)
            .with(&self.registry, |s| s.find(hash, key).is_some())
    }

    /// Clone of the value for `key`, read under a shared hold.
    pub fn get_cloned<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let mut acc = ConstAccessor::new();
        if self.find(&mut acc, key) {
            acc.value().cloned()
        } else {
            None
        }
    }

    /// Number of entries at some instant during the call.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|cell| cell.with(&self.registry, |s| s.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards
            .iter()
            .all(|cell| cell.with(&self.registry, |s| s.len() == 0))
    }

    /// Visit every entry, one at a time, under its shared lock. Entries
    /// inserted or erased during the walk may or may not be visited.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        for cell in self.shards.iter() {
            let entries: Vec<Arc<Entry<K, V>>> =
                cell.with(&self.registry, |s| s.slots.values().cloned().collect());
            for entry in entries {
                entry.lock.lock_shared();
                if entry.erased.load(Ordering::Acquire) {
                    // SAFETY: acquired just above.
                    unsafe { entry.lock.unlock_shared() };
                    continue;
                }
                let mut acc = ConstAccessor::new();
                acc.bind(entry, &*self.observer);
                if let (Some(k), Some(v)) = (acc.key(), acc.value()) {
                    f(k, v);
                }
            }
        }
    }

    /// Drop every entry. Exclusive access guarantees no accessor is bound.
    pub fn clear(&mut self) {
        for cell in self.shards.iter_mut() {
            cell.shard.get_mut().clear();
        }
    }

    /// Exclusive accessor for use with this map; equivalent to
    /// [`Accessor::new`].
    pub fn accessor(&self) -> Accessor<'_, K, V> {
        Accessor::new()
    }

    /// Shared accessor for use with this map; equivalent to
    /// [`ConstAccessor::new`].
    pub fn const_accessor(&self) -> ConstAccessor<'_, K, V> {
        ConstAccessor::new()
    }
}

impl<K, V, S> fmt::Debug for ConcurrentMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("shards", &self.shard_count())
            .field("len", &self.len())
            .finish()
    }
}
