//! sync-prims: concurrency primitives for structures that are built,
//! queried and mutated by many threads at once (symbol tables,
//! instrumentation points, line maps).
//!
//! Internal Design:
//!
//! Summary
//! - Goal: make the read-mostly path cheap enough that the shared/exclusive
//!   lock can be the default for nearly every shared map, without missed
//!   wakeups or writer overlap under adversarial interleavings.
//! - Layers, leaves first:
//!   - ThreadRegistry: dense small ids per thread, never recycled.
//!   - RawRwLock / RwLock<T>: epoch/ticket reader-writer lock. Readers pay
//!     one atomic add on each side; writers serialize on a mutex and drain
//!     the readers admitted before them.
//!   - ThreadLocal<T>: per-object thread-local value on top of the two.
//!   - ConcurrentMap<K, V, S>: sharded dictionary whose entries carry their
//!     own RawRwLock and are reached through scoped `Accessor` (exclusive)
//!     and `ConstAccessor` (shared) handles.
//!
//! Constraints
//! - Outcomes are booleans; nothing at runtime returns an error. Misuse
//!   (unlocking an unheld raw lock) is a precondition violation, which is
//!   why raw unlocks are `unsafe`.
//! - No cancellation or timeouts. A blocked acquire returns only after a
//!   matching release elsewhere.
//! - No multi-key atomicity in the map.
//! - Accessors and lock guards are `!Send`; a lock is released on the
//!   thread that acquired it.
//!
//! Writer fairness
//! - Readers arriving while a writer drains are deferred behind it, so a
//!   writer waits only for readers admitted before it. Progress beyond that
//!   is not bounded numerically.
//!
//! Reentrancy policy
//! - Map shards run `K: Eq` under their mutex and nothing else from user
//!   code; value constructors and drops happen outside it. In debug builds
//!   a per-shard guard turns a callback into the same shard into a panic
//!   rather than a deadlock. Entry locks are not reentrant: binding a
//!   second accessor to an entry the current thread already holds
//!   exclusively deadlocks.
//!
//! Observability
//! - Accessors publish happens-before/after checkpoints to an injected
//!   `RaceObserver` (no-op by default) so a dynamic race detector can treat
//!   same-entry accessors as synchronized.
//! - Slow paths (thread id allocation, thread-local growth, map
//!   construction) emit `tracing` events. Lock fast paths log nothing.

mod accessor;
mod concurrent_map;
mod concurrent_map_proptest;
pub mod config;
pub mod containers;
pub mod error;
pub mod observer;
mod reentrancy;
pub mod rwlock;
mod thread_local;
pub mod thread_registry;

// Public surface
pub use accessor::{Accessor, ConstAccessor, MapAccessor};
pub use concurrent_map::ConcurrentMap;
pub use config::{MapBuilder, MapConfig};
pub use containers::{ConcurrentQueue, ConcurrentVec};
pub use error::{Error, Result};
pub use observer::{NoopObserver, RaceObserver, TracingObserver};
pub use rwlock::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use thread_local::ThreadLocal;
pub use thread_registry::{current_thread_id, ThreadRegistry};
