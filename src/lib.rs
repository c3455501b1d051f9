//! Concurrent cuckoo hash tables.
//!
//! This crate implements a concurrent associative index over fixed-width integer keys, based on
//! bucketized cuckoo hashing¹. Every key has exactly two buckets it may legally live in, so a
//! lookup inspects at most `2 * BUCKET_SLOTS` slots, and an insertion that finds both buckets full
//! displaces existing entries along a shortest relocation path found by breadth-first search.
//!
//! ¹This is the table design behind several high-pressure caches; it keeps working at load
//!  factors where linear probing has long since degenerated.
//!
//! # Concurrency
//!
//! The table permits many readers and many writers at once:
//!
//! - **Readers are optimistic.** A lookup takes no lock. It snapshots a pair of striped version
//!   counters, scans the key's two buckets, and re-reads the counters. If either counter moved
//!   (or a writer's dirty flag is up), the scan is retried. A successful lookup therefore
//!   reflects a consistent key/value pair, never a torn one.
//! - **Writers take per-bucket spinlocks.** An insertion or deletion locks only the two buckets
//!   the key hashes to, so writers on disjoint buckets do not contend. Every mutation is
//!   bracketed by the bucket's dirty flag and a counter increment, which is what the readers
//!   validate against.
//! - **Growth is in-place doubling.** `expand` doubles the bucket array by duplicating it into
//!   both halves, and later writes lazily scrub the duplicate ("stale") entries out, a bounded
//!   number of buckets at a time. Lookups stay correct throughout.
//!
//! # Usage
//!
//! The map stores integer keys and values (64-bit by default, 32-bit with the `small-keys`
//! feature). The all-zero key is reserved to mean "empty slot" and is rejected on insertion.
//!
//! ```rust
//! use ccuckoo::CuckooMap;
//!
//! let map = CuckooMap::with_hashpower(4);
//!
//! map.insert(1, 100).unwrap();
//! assert_eq!(map.find(1), Some(100));
//!
//! assert_eq!(map.delete(1), Some(100));
//! assert_eq!(map.find(1), None);
//! ```
//!
//! Values are plain words, so the map hands out copies rather than guards; there is no in-place
//! mutation and no iteration. If you need either, you want a general-purpose concurrent map, not
//! this structure.

#![warn(missing_docs)]

extern crate byteorder;
extern crate parking_lot;
#[macro_use]
extern crate quick_error;
extern crate rand;
extern crate seahash;
#[macro_use]
extern crate slog;

mod bfs;
mod bucket;
mod dump;
mod map;
mod path;
mod place;
mod table;
mod version;

#[cfg(test)]
mod tests;

pub use dump::LoadError;
pub use map::{CuckooMap, ExpandError, InsertError};

/// The key type stored in the table.
///
/// The all-zero bit pattern (`EMPTY_KEY`) is reserved as the empty-slot sentinel and must not be
/// used as a real key.
#[cfg(not(feature = "small-keys"))]
pub type Key = u64;
/// The value type stored in the table.
#[cfg(not(feature = "small-keys"))]
pub type Val = u64;

/// The key type stored in the table (32-bit configuration).
#[cfg(feature = "small-keys")]
pub type Key = u32;
/// The value type stored in the table (32-bit configuration).
#[cfg(feature = "small-keys")]
pub type Val = u32;

/// The reserved empty-slot sentinel.
///
/// A slot is empty if and only if its key field holds this value.
pub const EMPTY_KEY: Key = 0;

/// The number of slots in every bucket.
pub const BUCKET_SLOTS: usize = 4;

/// The maximal length of a cuckoo relocation path.
///
/// The breadth-first planner never returns a path longer than this. Together with `MAX_KICKS` it
/// satisfies `BUCKET_SLOTS ^ MAX_BFS_DEPTH > MAX_KICKS / 2`, so the search queue cannot overflow
/// before the kick budget runs out.
pub const MAX_BFS_DEPTH: usize = 4;

/// The kick budget: the maximal number of bucket expansions per path search.
///
/// When the planner exhausts this budget without finding a path ending in an empty slot, the
/// insertion reports the table as full.
pub const MAX_KICKS: usize = 250;

/// The number of version counter stripes.
///
/// Bucket `i` maps to counter `i % COUNTER_STRIPES`, so distinct buckets may share a counter.
/// Must be a power of two.
pub const COUNTER_STRIPES: usize = 1 << 13;

/// The number of buckets scrubbed per write while an expansion is being cleaned up.
pub const CLEAN_QUANTUM: usize = 1024;

/// The default hashpower: the table starts with `2 ^ DEFAULT_HASHPOWER` buckets.
pub const DEFAULT_HASHPOWER: usize = 16;
