//! Debug-only reentrancy guard for locked sections.
//!
//! Map shards run user code (`K: Eq`) while their mutex is held. A key whose
//! `Eq` calls back into the same shard would deadlock on that mutex; in
//! debug builds this guard turns the deadlock into a panic naming the
//! problem. The owner is tracked by thread id, so other threads entering the
//! section concurrently are not mistaken for reentry. In release builds it
//! compiles to a zero-cost no-op.

#[cfg(debug_assertions)]
use core::sync::atomic::{AtomicUsize, Ordering};
use core::marker::PhantomData;

#[cfg(debug_assertions)]
const NO_OWNER: usize = usize::MAX;

/// Per-section owner tracker. Call [`check`](Self::check) before taking the
/// section's lock and [`enter`](Self::enter) right after.
#[derive(Debug)]
pub(crate) struct DebugReentrancy {
    #[cfg(debug_assertions)]
    owner: AtomicUsize,
}

impl DebugReentrancy {
    /// Create a new reentrancy tracker. Const so it can be a field default.
    pub const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Panics in debug builds if `thread` already owns the section.
    #[inline]
    pub fn check(&self, thread: usize) {
        #[cfg(debug_assertions)]
        assert!(
            self.owner.load(Ordering::Relaxed) != thread,
            "reentrancy detected: nested entry into locked section"
        );
        #[cfg(not(debug_assertions))]
        let _ = thread;
    }

    /// Record `thread` as the owner until the guard drops. Must only be
    /// called while holding the section's lock.
    #[inline]
    pub fn enter(&self, thread: usize) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            self.owner.store(thread, Ordering::Relaxed);
            ReentrancyGuard {
                owner: self,
                _nosend: PhantomData,
            }
        }

        #[cfg(not(debug_assertions))]
        {
            let _ = thread;
            ReentrancyGuard {
                _z: PhantomData,
                _nosend: PhantomData,
            }
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::enter`. Drop it before releasing
/// the section's lock.
pub(crate) struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
    // Ownership is per thread.
    _nosend: PhantomData<*mut ()>,
}

impl<'a> Drop for ReentrancyGuard<'a> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.owner.owner.store(NO_OWNER, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::DebugReentrancy;

    #[test]
    fn enter_and_exit_is_ok() {
        let r = DebugReentrancy::new();
        r.check(0);
        let g = r.enter(0);
        drop(g);
        r.check(0);
    }

    #[test]
    fn other_thread_is_not_reentry() {
        let r = DebugReentrancy::new();
        let _g = r.enter(1);
        r.check(2);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn reentrancy_panics_in_debug() {
        let r = DebugReentrancy::new();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g1 = r.enter(3);
            // Re-entering from the same thread should panic in debug builds
            r.check(3);
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn reentrancy_noop_in_release() {
        let r = DebugReentrancy::new();
        let _g1 = r.enter(3);
        r.check(3);
    }
}
