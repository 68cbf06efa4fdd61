//! A map/reduce pipeline that merges stock, crime and weather time series
//! by day, normalizes them and builds the matrix products a regression needs.
//!
//! Every stage is a [`Workload`]: a map function and a reduce function.
//! Partitioning, shuffling, sorting and retries belong to whatever engine
//! runs the workloads; [`standalone`] is a single-process engine used by
//! the command line tool and the tests.

use bytes::Bytes;
use std::hash::Hasher;

pub mod codec;
pub mod context;
pub mod date;
pub mod error;
pub mod ingest;
pub mod matrix;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod standalone;
pub mod stats;
pub mod utils;
pub mod workload;

pub use context::{Counters, MemoryCounters, NoopCounters, TaskContext};
pub use error::{ConfigErrors, PipelineError};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) map operations.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>>;

/// A map function takes a key-value pair, auxiliary arguments and the
/// context of the task it runs in.
///
/// It returns an iterator that yields new key-value pairs.
pub type MapFn = fn(kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// an auxiliary argument and the task context. It returns an
/// [`anyhow::Result`] containing the output bytes for that key.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
    ctx: &TaskContext,
) -> anyhow::Result<Bytes>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> Bytes {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Hashes an intermediate key. Compute a reduce bucket for a given key
/// by calculating `ihash(key) % n_reduce`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    let value = hasher.finish() & 0x7fffffff;
    u32::try_from(value).expect("Failed to compute ihash of value")
}

/// Picks the reduce bucket for `key`.
///
/// Metadata records (key [`date::META_KEY`]) always land in bucket 0, so a
/// dataset's type registry and tag lines live in `mr-out-0`.
pub fn partition(key: &[u8], n_reduce: u32) -> u32 {
    if key == date::META_KEY.as_bytes() || n_reduce <= 1 {
        0
    } else {
        ihash(key) % n_reduce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_always_routes_to_first_bucket() {
        for n in 1..16 {
            assert_eq!(partition(b"#", n), 0);
        }
    }

    #[test]
    fn data_keys_spread_within_bounds() {
        for day in ["2015-01-01", "2015-01-02", "2015-06-30"] {
            assert!(partition(day.as_bytes(), 7) < 7);
            assert_eq!(partition(day.as_bytes(), 7), ihash(day.as_bytes()) % 7);
        }
    }
}
