//! Construction parameters for [`ConcurrentMap`].

use crate::concurrent_map::ConcurrentMap;
use crate::error::{Error, Result};
use crate::observer::{NoopObserver, RaceObserver};
use crate::thread_registry::ThreadRegistry;
use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;
use std::sync::Arc;

/// Upper bound on shards per map.
pub const MAX_SHARDS: usize = 1 << 16;

/// Sizing of a [`ConcurrentMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapConfig {
    /// Number of independently locked shards; a power of two.
    pub shards: usize,
    /// Entries to preallocate in each shard.
    pub capacity_per_shard: usize,
}

impl Default for MapConfig {
    /// Four shards per available core, rounded up to a power of two.
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            shards: cores.saturating_mul(4).next_power_of_two().min(MAX_SHARDS),
            capacity_per_shard: 0,
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shards > MAX_SHARDS {
            return Err(Error::TooManyShards {
                requested: self.shards,
                max: MAX_SHARDS,
            });
        }
        if !self.shards.is_power_of_two() {
            return Err(Error::InvalidShardCount(self.shards));
        }
        Ok(())
    }
}

/// Builder for [`ConcurrentMap`] with a custom configuration, hasher,
/// observer or thread registry.
pub struct MapBuilder<S = RandomState> {
    config: MapConfig,
    hasher: S,
    observer: Arc<dyn RaceObserver>,
    registry: Arc<ThreadRegistry>,
}

impl MapBuilder<RandomState> {
    pub fn new() -> Self {
        Self {
            config: MapConfig::default(),
            hasher: RandomState::new(),
            observer: Arc::new(NoopObserver),
            registry: ThreadRegistry::global().clone(),
        }
    }
}

impl Default for MapBuilder<RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> MapBuilder<S> {
    pub fn shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    pub fn capacity_per_shard(mut self, capacity: usize) -> Self {
        self.config.capacity_per_shard = capacity;
        self
    }

    pub fn config(mut self, config: MapConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive accessor checkpoints; see [`RaceObserver`].
    pub fn observer(mut self, observer: Arc<dyn RaceObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Registry used to identify threads for debug reentrancy checks.
    pub fn registry(mut self, registry: Arc<ThreadRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn hasher<S2>(self, hasher: S2) -> MapBuilder<S2> {
        MapBuilder {
            config: self.config,
            hasher,
            observer: self.observer,
            registry: self.registry,
        }
    }

    pub fn build<K, V>(self) -> Result<ConcurrentMap<K, V, S>>
    where
        K: Eq + Hash,
        S: BuildHasher,
    {
        self.config.validate()?;
        Ok(ConcurrentMap::from_parts(
            self.config,
            self.hasher,
            self.observer,
            self.registry,
        ))
    }
}
