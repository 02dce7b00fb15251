//! Scalable reader-writer lock.
//!
//! Readers take a ticket from an `ingress` counter with a single atomic add
//! and hand it back on `egress`; no mutex is touched unless a writer is
//! present. A writer serializes against other writers on a mutex, closes
//! the current epoch by setting a writer bit on `ingress`, and waits until
//! `egress` catches up with the tickets admitted before that point.
//!
//! Readers that arrive while a writer holds or drains the lock block on one
//! of two wakeup channels, selected by the epoch parity their ticket
//! observed. Each writer tenure flips the parity on release, so readers
//! blocked under one tenure are never confused with readers blocked under
//! the next.
//!
//! Layout of `ingress`: bit 0 is the epoch parity, bit 1 is the writer bit,
//! the remaining bits count tickets. `egress` uses bit 1 to tell departing
//! readers that a writer is draining.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use lock_api::{GuardNoSend, RawMutex as _};
use parking_lot::{Condvar, Mutex};

const PARITY: u32 = 0b01;
const WRITER: u32 = 0b10;
const TICKET: u32 = 0b100;
const COUNT: u32 = !(PARITY | WRITER);

/// Raw epoch/ticket reader-writer lock.
///
/// Use through [`RwLock`] for guard-based access, or through the
/// [`lock_api::RawRwLock`] methods when the protected data lives elsewhere.
pub struct RawRwLock {
    ingress: AtomicU32,
    egress: AtomicU32,
    // Ticket count the draining writer waits for `egress` to reach.
    drain_target: AtomicU32,
    writer: parking_lot::RawMutex,
    // `open[parity]` is false while a writer with that parity is present.
    open: Mutex<[bool; 2]>,
    readers: Condvar,
    drained: Mutex<bool>,
    drain: Condvar,
}

/// Data-owning lock built on [`RawRwLock`].
pub type RwLock<T> = lock_api::RwLock<RawRwLock, T>;
/// Shared guard for [`RwLock`].
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock, T>;
/// Exclusive guard for [`RwLock`].
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock, T>;

impl RawRwLock {
    /// An unlocked lock.
    pub const fn new() -> Self {
        Self {
            ingress: AtomicU32::new(0),
            egress: AtomicU32::new(0),
            drain_target: AtomicU32::new(0),
            writer: parking_lot::RawMutex::INIT,
            open: parking_lot::const_mutex([true, true]),
            readers: Condvar::new(),
            drained: parking_lot::const_mutex(false),
            drain: Condvar::new(),
        }
    }

    #[inline]
    fn parity(word: u32) -> usize {
        (word & PARITY) as usize
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawRwLock for RawRwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    // The writer mutex must be released by the thread that took it.
    type GuardMarker = GuardNoSend;

    fn lock_shared(&self) {
        let seen = self.ingress.fetch_add(TICKET, Ordering::Acquire);
        if seen & WRITER == 0 {
            return;
        }
        // The ticket is already counted in the next epoch; wait for the
        // writer that closed ours to leave.
        let parity = Self::parity(seen);
        let mut open = self.open.lock();
        while !open[parity] {
            self.readers.wait(&mut open);
        }
    }

    fn try_lock_shared(&self) -> bool {
        let mut cur = self.ingress.load(Ordering::Relaxed);
        loop {
            if cur & WRITER != 0 {
                return false;
            }
            match self.ingress.compare_exchange_weak(
                cur,
                cur.wrapping_add(TICKET),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    unsafe fn unlock_shared(&self) {
        let now = self
            .egress
            .fetch_add(TICKET, Ordering::AcqRel)
            .wrapping_add(TICKET);
        if now & WRITER != 0 && now & COUNT == self.drain_target.load(Ordering::Relaxed) {
            // Last reader of the closed epoch.
            let mut drained = self.drained.lock();
            *drained = true;
            self.drain.notify_one();
        }
    }

    fn lock_exclusive(&self) {
        self.writer.lock();
        // Parity only changes under the writer mutex.
        let parity = Self::parity(self.ingress.load(Ordering::Relaxed));
        self.open.lock()[parity] = false;
        *self.drained.lock() = false;

        let admitted = self.ingress.fetch_add(WRITER, Ordering::AcqRel) & COUNT;
        self.drain_target.store(admitted, Ordering::Relaxed);
        let departed = self.egress.fetch_add(WRITER, Ordering::AcqRel) & COUNT;
        if departed != admitted {
            let mut drained = self.drained.lock();
            while !*drained {
                self.drain.wait(&mut drained);
            }
        }
        // Every admitted reader has left and new ones are parked, so nobody
        // touches `egress` until we release.
        self.egress.fetch_sub(WRITER, Ordering::Relaxed);
    }

    fn try_lock_exclusive(&self) -> bool {
        if !self.writer.try_lock() {
            return false;
        }
        let seen = self.ingress.load(Ordering::Acquire);
        let parity = Self::parity(seen);
        if self.egress.load(Ordering::Acquire) & COUNT != seen & COUNT {
            // SAFETY: taken by the `try_lock` above.
            unsafe { self.writer.unlock() };
            return false;
        }
        self.open.lock()[parity] = false;
        // Fails if a reader slipped in after the egress check.
        if self
            .ingress
            .compare_exchange(seen, seen | WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            self.open.lock()[parity] = true;
            // SAFETY: as above.
            unsafe { self.writer.unlock() };
            return false;
        }
        true
    }

    unsafe fn unlock_exclusive(&self) {
        let prev = self.ingress.fetch_xor(WRITER | PARITY, Ordering::Release);
        debug_assert!(prev & WRITER != 0, "unlock_exclusive without lock_exclusive");
        let parity = Self::parity(prev);
        self.open.lock()[parity] = true;
        self.readers.notify_all();
        self.writer.unlock();
    }

    /// True while any reader or writer holds the lock, or a writer drains it.
    fn is_locked(&self) -> bool {
        let ingress = self.ingress.load(Ordering::Relaxed);
        ingress & WRITER != 0 || ingress & COUNT != self.egress.load(Ordering::Relaxed) & COUNT
    }

    /// True while a writer holds the lock or drains it.
    fn is_locked_exclusive(&self) -> bool {
        self.ingress.load(Ordering::Relaxed) & WRITER != 0
    }
}

impl fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ingress = self.ingress.load(Ordering::Relaxed);
        let egress = self.egress.load(Ordering::Relaxed);
        f.debug_struct("RawRwLock")
            .field("readers", &((ingress & COUNT).wrapping_sub(egress & COUNT) / TICKET))
            .field("writer", &(ingress & WRITER != 0))
            .field("parity", &(ingress & PARITY))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lock_api::RawRwLock as _;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    #[test]
    fn shared_holders_coexist() {
        let l = RawRwLock::new();
        l.lock_shared();
        l.lock_shared();
        assert!(l.is_locked());
        assert!(!l.is_locked_exclusive());
        assert!(l.try_lock_shared());
        assert!(!l.try_lock_exclusive());
        unsafe {
            l.unlock_shared();
            l.unlock_shared();
            l.unlock_shared();
        }
        assert!(!l.is_locked());
    }

    /// Invariant: an exclusive holder excludes both try-paths.
    #[test]
    fn exclusive_excludes_everyone() {
        let l = RawRwLock::new();
        l.lock_exclusive();
        assert!(l.is_locked_exclusive());
        assert!(!l.try_lock_shared());
        assert!(!l.try_lock_exclusive());
        unsafe { l.unlock_exclusive() };
        assert!(!l.is_locked());
        assert!(l.try_lock_exclusive());
        unsafe { l.unlock_exclusive() };
        assert!(l.try_lock_shared());
        unsafe { l.unlock_shared() };
    }

    /// Invariant: parity flips once per writer tenure and readers admitted
    /// afterwards take the fast path.
    #[test]
    fn parity_flips_per_tenure() {
        let l = RawRwLock::new();
        for round in 0..4u32 {
            assert_eq!(l.ingress.load(Ordering::Relaxed) & PARITY, round & 1);
            l.lock_exclusive();
            unsafe { l.unlock_exclusive() };
            l.lock_shared();
            unsafe { l.unlock_shared() };
        }
        assert!(!l.is_locked());
    }

    /// Invariant: a writer waits for the readers admitted before it, and
    /// readers arriving mid-drain wait for the writer.
    #[test]
    fn writer_drains_admitted_readers() {
        let l = RawRwLock::new();
        let writer_in = AtomicBool::new(false);
        l.lock_shared();
        std::thread::scope(|s| {
            s.spawn(|| {
                l.lock_exclusive();
                writer_in.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                writer_in.store(false, Ordering::SeqCst);
                unsafe { l.unlock_exclusive() };
            });
            while !l.is_locked_exclusive() {
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(20));
            assert!(!writer_in.load(Ordering::SeqCst), "writer overlapped a reader");

            // A late reader is deferred until the writer leaves.
            s.spawn(|| {
                l.lock_shared();
                assert!(!writer_in.load(Ordering::SeqCst));
                unsafe { l.unlock_shared() };
            });
            unsafe { l.unlock_shared() };
        });
        assert!(!l.is_locked());
    }

    /// Invariant: at most one thread is ever inside the exclusive region.
    #[test]
    fn exclusive_regions_never_overlap() {
        let l = RawRwLock::new();
        let inside = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..500 {
                        l.lock_exclusive();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        unsafe { l.unlock_exclusive() };
                    }
                });
            }
        });
        assert!(!l.is_locked());
    }

    #[test]
    fn guard_api_round_trip() {
        let lock = RwLock::new(vec![1, 2]);
        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!(a.len() + b.len(), 4);
        }
        lock.write().push(3);
        assert_eq!(*lock.read(), vec![1, 2, 3]);
        assert!(lock.try_write().is_some());
        let r = lock.read();
        assert!(lock.try_write().is_none());
        drop(r);
    }
}
