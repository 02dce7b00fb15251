//! Scoped handles onto [`ConcurrentMap`](crate::ConcurrentMap) entries.
//!
//! An accessor is created unbound, bound by a map operation, and holds the
//! bound entry's lock until it is released, rebound, or dropped.
//! [`Accessor`] holds the lock exclusively; [`ConstAccessor`] holds it
//! shared.
//!
//! Checkpoints published to the map's [`RaceObserver`] use two addresses per
//! entry: a writer channel (the value's address) and a reader channel (one
//! past it).
//! - exclusive bind: happens-after on both channels;
//! - exclusive release: happens-before on the writer channel;
//! - shared bind: happens-after on the writer channel;
//! - shared release: happens-before on the reader channel.
//!
//! Writers therefore order after every earlier holder, readers order after
//! earlier writers only.

use crate::observer::RaceObserver;
use crate::rwlock::RawRwLock;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::AtomicBool;
use lock_api::RawRwLock as _;
use slotmap::DefaultKey;
use std::sync::Arc;

/// Lock mode an accessor binds with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Shared,
    Exclusive,
}

impl Mode {
    #[inline]
    pub(crate) fn acquire(self, lock: &RawRwLock) {
        match self {
            Mode::Shared => lock.lock_shared(),
            Mode::Exclusive => lock.lock_exclusive(),
        }
    }

    /// # Safety
    /// The caller must hold `lock` in this mode.
    #[inline]
    pub(crate) unsafe fn release(self, lock: &RawRwLock) {
        match self {
            Mode::Shared => lock.unlock_shared(),
            Mode::Exclusive => lock.unlock_exclusive(),
        }
    }
}

/// A map entry. Shared between its shard and any bound accessors.
pub struct Entry<K, V> {
    pub(crate) key: K,
    pub(crate) hash: u64,
    // Position in the owning shard's slot storage.
    pub(crate) slot: DefaultKey,
    // Set under the exclusive lock once the entry is unlinked; an accessor
    // that acquires the lock afterwards must not bind.
    pub(crate) erased: AtomicBool,
    pub(crate) lock: RawRwLock,
    value: UnsafeCell<V>,
}

// The value is only reached through the entry lock.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Entry<K, V> {}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(key: K, hash: u64, slot: DefaultKey, value: V) -> Self {
        Self {
            key,
            hash,
            slot,
            erased: AtomicBool::new(false),
            lock: RawRwLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    fn writer_channel(&self) -> usize {
        self.value.get() as usize
    }

    #[inline]
    fn reader_channel(&self) -> usize {
        self.writer_channel() + 1
    }
}

struct Binding<'m, K, V> {
    entry: Arc<Entry<K, V>>,
    observer: &'m dyn RaceObserver,
}

mod sealed {
    pub trait Sealed {}
}

/// Implemented by [`Accessor`] and [`ConstAccessor`]; lets map operations
/// accept either.
pub trait MapAccessor<'m, K, V>: sealed::Sealed {
    #[doc(hidden)]
    const MODE: Mode;

    /// Take ownership of `entry`, already locked in `MODE`.
    #[doc(hidden)]
    fn bind(&mut self, entry: Arc<Entry<K, V>>, observer: &'m dyn RaceObserver);

    /// Publish the release checkpoint and hand back the still-locked entry.
    #[doc(hidden)]
    fn unbind(&mut self) -> Option<Arc<Entry<K, V>>>;

    /// Release the bound entry, if any.
    fn release(&mut self);

    fn is_bound(&self) -> bool;
}

/// Exclusive handle on one entry.
pub struct Accessor<'m, K, V> {
    binding: Option<Binding<'m, K, V>>,
    // Locks are released on the thread that took them.
    _nosend: PhantomData<*mut ()>,
}

impl<'m, K, V> Accessor<'m, K, V> {
    pub const fn new() -> Self {
        Self {
            binding: None,
            _nosend: PhantomData,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn key(&self) -> Option<&K> {
        self.binding.as_ref().map(|b| &b.entry.key)
    }

    pub fn value(&self) -> Option<&V> {
        // SAFETY: the entry lock is held exclusively while bound.
        self.binding
            .as_ref()
            .map(|b| unsafe { &*b.entry.value.get() })
    }

    pub fn value_mut(&mut self) -> Option<&mut V> {
        // SAFETY: the entry lock is held exclusively while bound, and `&mut
        // self` rules out other borrows through this accessor.
        self.binding
            .as_mut()
            .map(|b| unsafe { &mut *b.entry.value.get() })
    }

    /// Replace the bound value, returning the old one. `None` when unbound.
    pub fn replace(&mut self, value: V) -> Option<V> {
        self.value_mut().map(|v| core::mem::replace(v, value))
    }

    pub fn release(&mut self) {
        if let Some(entry) = self.unbind_entry() {
            // SAFETY: bound accessors hold the entry lock exclusively.
            unsafe { entry.lock.unlock_exclusive() };
        }
    }

    fn unbind_entry(&mut self) -> Option<Arc<Entry<K, V>>> {
        let Binding { entry, observer } = self.binding.take()?;
        observer.happens_before(entry.writer_channel());
        Some(entry)
    }
}

impl<'m, K, V> sealed::Sealed for Accessor<'m, K, V> {}

impl<'m, K, V> MapAccessor<'m, K, V> for Accessor<'m, K, V> {
    const MODE: Mode = Mode::Exclusive;

    fn bind(&mut self, entry: Arc<Entry<K, V>>, observer: &'m dyn RaceObserver) {
        debug_assert!(self.binding.is_none(), "bind over a live binding");
        observer.happens_after(entry.reader_channel());
        observer.happens_after(entry.writer_channel());
        self.binding = Some(Binding { entry, observer });
    }

    fn unbind(&mut self) -> Option<Arc<Entry<K, V>>> {
        self.unbind_entry()
    }

    fn release(&mut self) {
        Accessor::release(self)
    }

    fn is_bound(&self) -> bool {
        Accessor::is_bound(self)
    }
}

impl<'m, K, V> Default for Accessor<'m, K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'m, K, V> Drop for Accessor<'m, K, V> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<'m, K: fmt::Debug, V: fmt::Debug> fmt::Debug for Accessor<'m, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("key", &self.key())
            .field("value", &self.value())
            .finish()
    }
}

/// Shared handle on one entry.
pub struct ConstAccessor<'m, K, V> {
    binding: Option<Binding<'m, K, V>>,
    _nosend: PhantomData<*mut ()>,
}

impl<'m, K, V> ConstAccessor<'m, K, V> {
    pub const fn new() -> Self {
        Self {
            binding: None,
            _nosend: PhantomData,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn key(&self) -> Option<&K> {
        self.binding.as_ref().map(|b| &b.entry.key)
    }

    pub fn value(&self) -> Option<&V> {
        // SAFETY: the entry lock is held shared while bound; no writer can
        // exist concurrently.
        self.binding
            .as_ref()
            .map(|b| unsafe { &*b.entry.value.get() })
    }

    pub fn release(&mut self) {
        if let Some(entry) = self.unbind_entry() {
            // SAFETY: bound const accessors hold the entry lock shared.
            unsafe { entry.lock.unlock_shared() };
        }
    }

    fn unbind_entry(&mut self) -> Option<Arc<Entry<K, V>>> {
        let Binding { entry, observer } = self.binding.take()?;
        observer.happens_before(entry.reader_channel());
        Some(entry)
    }
}

impl<'m, K, V> sealed::Sealed for ConstAccessor<'m, K, V> {}

impl<'m, K, V> MapAccessor<'m, K, V> for ConstAccessor<'m, K, V> {
    const MODE: Mode = Mode::Shared;

    fn bind(&mut self, entry: Arc<Entry<K, V>>, observer: &'m dyn RaceObserver) {
        debug_assert!(self.binding.is_none(), "bind over a live binding");
        observer.happens_after(entry.writer_channel());
        self.binding = Some(Binding { entry, observer });
    }

    fn unbind(&mut self) -> Option<Arc<Entry<K, V>>> {
        self.unbind_entry()
    }

    fn release(&mut self) {
        ConstAccessor::release(self)
    }

    fn is_bound(&self) -> bool {
        ConstAccessor::is_bound(self)
    }
}

impl<'m, K, V> Default for ConstAccessor<'m, K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'m, K, V> Drop for ConstAccessor<'m, K, V> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<'m, K: fmt::Debug, V: fmt::Debug> fmt::Debug for ConstAccessor<'m, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstAccessor")
            .field("key", &self.key())
            .field("value", &self.value())
            .finish()
    }
}
