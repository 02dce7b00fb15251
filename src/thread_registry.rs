//! Dense per-thread identifiers.
//!
//! A `ThreadRegistry` hands each participating thread a small integer the
//! first time the thread asks for one. Ids come from a monotonic counter and
//! are never recycled, so `live_thread_count()` is also an upper bound that
//! per-thread caches can be sized against.
//!
//! Registries are ordinary values: the process-wide one is reachable through
//! [`ThreadRegistry::global`], and independent ones can be created and
//! injected (tests do this to get ids starting from zero).

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::trace;

// Distinguishes registries inside each thread's id table.
static NEXT_TAG: AtomicUsize = AtomicUsize::new(0);

// One row of a thread's id table. `alive` dies with its registry, and dead
// rows are swept whenever the thread joins another registry.
struct Joined {
    tag: usize,
    id: usize,
    alive: Weak<()>,
}

thread_local! {
    static JOINED: RefCell<Vec<Joined>> = const { RefCell::new(Vec::new()) };
}

/// Source of dense thread ids.
#[derive(Debug)]
pub struct ThreadRegistry {
    tag: usize,
    next: AtomicUsize,
    alive: Arc<()>,
}

impl ThreadRegistry {
    /// Create an independent registry whose first id is `0`.
    pub fn new() -> Self {
        Self {
            tag: NEXT_TAG.fetch_add(1, Ordering::Relaxed),
            next: AtomicUsize::new(0),
            alive: Arc::new(()),
        }
    }

    /// The process-wide registry shared by every default-constructed
    /// primitive in this crate.
    pub fn global() -> &'static Arc<ThreadRegistry> {
        static GLOBAL: OnceLock<Arc<ThreadRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ThreadRegistry::new()))
    }

    /// The calling thread's id in this registry, allocated on first use.
    ///
    /// During thread teardown, after thread-local storage has been destroyed,
    /// every call allocates a fresh id. Uniqueness still holds; stability
    /// does not. Callers that index storage by id should use
    /// [`try_current_id`](Self::try_current_id) instead.
    pub fn current_id(&self) -> usize {
        self.try_current_id().unwrap_or_else(|| self.allocate())
    }

    /// Like [`current_id`](Self::current_id), but `None` once the calling
    /// thread's thread-local storage has been torn down.
    pub fn try_current_id(&self) -> Option<usize> {
        JOINED
            .try_with(|joined| {
                let mut joined = joined.borrow_mut();
                if let Some(row) = joined.iter().find(|row| row.tag == self.tag) {
                    return row.id;
                }
                joined.retain(|row| row.alive.strong_count() > 0);
                let id = self.allocate();
                joined.push(Joined {
                    tag: self.tag,
                    id,
                    alive: Arc::downgrade(&self.alive),
                });
                id
            })
            .ok()
    }

    /// Upper bound on the ids issued so far (`max id + 1`). Never decreases.
    #[inline]
    pub fn live_thread_count(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    fn allocate(&self) -> usize {
        let id = self.next.fetch_add(1, Ordering::AcqRel);
        if id == usize::MAX {
            // The counter wrapped; ids would start colliding.
            std::process::abort();
        }
        trace!(registry = self.tag, id, "assigned thread id");
        id
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The calling thread's id in the global registry.
#[inline]
pub fn current_thread_id() -> usize {
    ThreadRegistry::global().current_id()
}
