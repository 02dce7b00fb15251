//! Ordering checkpoints for external race detectors.
//!
//! Map accessors publish a happens-after checkpoint when they bind an entry
//! and a happens-before checkpoint when they release it, keyed by an address
//! derived from the entry. A dynamic analyzer fed these events can treat
//! accessors of the same entry as synchronized. The observer has no
//! functional effect on the map.

use tracing::trace;

/// Sink for ordering annotations.
pub trait RaceObserver: Send + Sync {
    /// Everything before this point on the current thread happens before any
    /// later `happens_after` on the same address.
    fn happens_before(&self, addr: usize);

    /// Pairs with earlier `happens_before` calls on the same address.
    fn happens_after(&self, addr: usize);
}

/// Discards every checkpoint. The default observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RaceObserver for NoopObserver {
    #[inline]
    fn happens_before(&self, _addr: usize) {}

    #[inline]
    fn happens_after(&self, _addr: usize) {}
}

/// Forwards checkpoints to `tracing` at trace level, target
/// `sync_prims::race`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RaceObserver for TracingObserver {
    fn happens_before(&self, addr: usize) {
        trace!(target: "sync_prims::race", addr, "happens-before");
    }

    fn happens_after(&self, addr: usize) {
        trace!(target: "sync_prims::race", addr, "happens-after");
    }
}
