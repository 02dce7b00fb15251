//! Per-object thread-local values.
//!
//! `ThreadLocal<T>` keeps one slot per thread id, indexed densely through a
//! [`ThreadRegistry`]. Reads and writes of an existing slot run under the
//! shared side of the crate's [`RwLock`]: the vector cannot be resized while
//! any shared holder exists, and a slot is only ever touched by the thread
//! owning its id, so two threads writing their own slots never collide. A
//! thread whose id is past the end takes the exclusive side once to grow
//! the vector to the registry's current thread count.
//!
//! A thread whose thread-local storage is already being torn down (code
//! running in another thread-local's destructor) has no stable id. Its `get`
//! returns a clone of the base value and its `set` is discarded, so the
//! store does not grow on that path.

use crate::rwlock::RwLock;
use crate::thread_registry::ThreadRegistry;
use core::cell::UnsafeCell;
use core::fmt;
use std::sync::Arc;
use tracing::trace;

pub struct ThreadLocal<T> {
    slots: RwLock<Vec<UnsafeCell<T>>>,
    base: T,
    registry: Arc<ThreadRegistry>,
}

// Slots are only accessed by their owning thread; `base` is cloned from any
// thread; dropping the vector may run `T::drop` on a foreign thread.
unsafe impl<T: Send + Sync> Sync for ThreadLocal<T> {}

impl<T: Clone> ThreadLocal<T> {
    /// Thread-local value defaulting to `base`, ids from the global registry.
    pub fn new(base: T) -> Self {
        Self::with_registry(base, ThreadRegistry::global().clone())
    }

    pub fn with_registry(base: T, registry: Arc<ThreadRegistry>) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            base,
            registry,
        }
    }

    /// The calling thread's value, or the base value if it never called
    /// [`set`](Self::set).
    pub fn get(&self) -> T {
        let Some(id) = self.registry.try_current_id() else {
            return self.base.clone();
        };
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(id) {
                // SAFETY: only this thread touches slot `id`, and the vector
                // cannot be resized while the read guard is held.
                return unsafe { (*slot.get()).clone() };
            }
        }
        let mut slots = self.slots.write();
        self.cover(&mut slots, id);
        slots[id].get_mut().clone()
    }

    /// Replace the calling thread's value.
    pub fn set(&self, value: T) {
        let Some(id) = self.registry.try_current_id() else {
            trace!("thread-local set during thread teardown discarded");
            return;
        };
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(id) {
                // SAFETY: see `get`.
                unsafe { *slot.get() = value };
                return;
            }
        }
        let mut slots = self.slots.write();
        self.cover(&mut slots, id);
        *slots[id].get_mut() = value;
    }

    // Grow to the registry's thread count so that the threads known so far
    // all hit the fast path afterwards.
    fn cover(&self, slots: &mut Vec<UnsafeCell<T>>, id: usize) {
        if slots.len() > id {
            // Another thread grew past us while we waited for exclusive mode.
            return;
        }
        let target = self.registry.live_thread_count().max(id + 1);
        trace!(from = slots.len(), to = target, "growing thread-local slots");
        slots.resize_with(target, || UnsafeCell::new(self.base.clone()));
    }
}

impl<T> ThreadLocal<T> {
    /// The value threads observe before their first `set`.
    pub fn base(&self) -> &T {
        &self.base
    }

    /// Number of backing slots. Never decreases.
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Every slot, indexed by thread id. Slots of threads that never called
    /// `set` hold a clone of the base value.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.get_mut().iter_mut().map(UnsafeCell::get_mut)
    }

    /// Consume the store, returning every slot indexed by thread id.
    pub fn into_vec(self) -> Vec<T> {
        self.slots
            .into_inner()
            .into_iter()
            .map(UnsafeCell::into_inner)
            .collect()
    }
}

impl<T: Clone + Default> Default for ThreadLocal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for ThreadLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocal")
            .field("base", &self.base)
            .field("slots", &self.slot_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn local<T: Clone>(base: T) -> (ThreadLocal<T>, Arc<ThreadRegistry>) {
        let reg = Arc::new(ThreadRegistry::new());
        (ThreadLocal::with_registry(base, reg.clone()), reg)
    }

    /// Invariant: a thread that never sets observes the base value.
    #[test]
    fn unset_thread_sees_base() {
        let (tl, _reg) = local(7u32);
        assert_eq!(tl.get(), 7);
        std::thread::scope(|s| {
            s.spawn(|| assert_eq!(tl.get(), 7));
        });
        assert_eq!(*tl.base(), 7);
    }

    #[test]
    fn set_then_get_on_same_thread() {
        let (tl, _reg) = local(String::new());
        tl.set("mine".to_string());
        assert_eq!(tl.get(), "mine");
        tl.set("again".to_string());
        assert_eq!(tl.get(), "again");
    }

    /// Invariant: backing storage covers every id seen and never shrinks.
    #[test]
    fn growth_covers_known_threads() {
        let (tl, reg) = local(0usize);
        assert_eq!(tl.slot_count(), 0);
        // Register three extra threads without touching the store.
        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| reg.current_id());
            }
        });
        tl.set(1);
        assert!(tl.slot_count() >= reg.live_thread_count());
        let before = tl.slot_count();
        tl.get();
        assert_eq!(tl.slot_count(), before);
    }

    /// Invariant: concurrent writers only ever see their own values.
    #[test]
    fn threads_are_isolated() {
        let (tl, _reg) = local(usize::MAX);
        std::thread::scope(|s| {
            for i in 0..8usize {
                let tl = &tl;
                s.spawn(move || {
                    for round in 0..200 {
                        tl.set(i * 1000 + round);
                        assert_eq!(tl.get(), i * 1000 + round);
                    }
                });
            }
        });
        let mut tl = tl;
        let mut finals: Vec<usize> = tl.iter_mut().map(|v| *v).collect();
        finals.sort_unstable();
        assert_eq!(finals, (0..8).map(|i| i * 1000 + 199).collect::<Vec<_>>());
    }

    /// Invariant: calls made from a thread-local destructor never allocate
    /// more than one id or slot for the exiting thread.
    #[test]
    fn teardown_calls_do_not_grow_store() {
        struct Exiting(Arc<ThreadLocal<u32>>);
        impl Drop for Exiting {
            fn drop(&mut self) {
                for i in 0..100 {
                    self.0.set(i);
                    let _ = self.0.get();
                }
            }
        }
        thread_local! {
            static EXITING: RefCell<Option<Exiting>> = const { RefCell::new(None) };
        }

        let reg = Arc::new(ThreadRegistry::new());
        let tl = Arc::new(ThreadLocal::with_registry(0u32, reg.clone()));
        let worker = {
            let tl = tl.clone();
            std::thread::spawn(move || {
                tl.set(1);
                EXITING.with(|e| *e.borrow_mut() = Some(Exiting(tl)));
            })
        };
        worker.join().unwrap();
        assert_eq!(reg.live_thread_count(), 1);
        assert_eq!(tl.slot_count(), 1);
    }

    #[test]
    fn into_vec_indexes_by_thread_id() {
        let (tl, reg) = local(0i32);
        let me = reg.current_id();
        tl.set(42);
        let values = tl.into_vec();
        assert_eq!(values[me], 42);
    }
}
