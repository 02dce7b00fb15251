use thiserror::Error;

/// Construction-time failures.
///
/// Runtime operations on the primitives never fail: lookups, inserts and
/// erasures report their outcome as `bool`, and lock misuse is a
/// precondition violation rather than an error. What can go wrong is
/// configuring a structure with parameters it cannot honor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Shard counts must be non-zero powers of two so a hash can be masked
    /// into a shard index.
    #[error("shard count must be a non-zero power of two, got {0}")]
    InvalidShardCount(usize),

    /// More shards than the map supports.
    #[error("shard count {requested} exceeds the supported maximum of {max}")]
    TooManyShards { requested: usize, max: usize },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
