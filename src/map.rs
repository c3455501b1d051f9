//! The public map type.
//!
//! `CuckooMap` wraps the low-level table in the three things it deliberately doesn't have: a
//! table-wide reader/writer lock, a live-entry counter, and a logger.
//!
//! The table-wide lock is *not* what serializes operations; per-bucket locks and version
//! counters do that. Its job is pinning the bucket array: every operation holds the read side
//! (a single uncontended atomic in the fast path), and only `expand` takes the write side, for
//! exactly as long as it takes to swap in the doubled array. That pin is what makes the swap
//! safe against in-flight optimistic readers, and it means the old array is freed under the
//! write lock, when no reader can still reference it.

use parking_lot::RwLock;
use slog::{Discard, Logger};
use std::mem;
use std::sync::atomic::{self, AtomicUsize};

use bucket::Bucket;
use table::Table;
use {Key, Val, BUCKET_SLOTS, DEFAULT_HASHPOWER, EMPTY_KEY};

/// The atomic ordering used for the item counter.
const ORDERING: atomic::Ordering = atomic::Ordering::SeqCst;

quick_error! {
    /// An insertion failure.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub enum InsertError {
        /// The key is already in the table.
        ///
        /// The existing value is untouched; replacing it takes a `delete` followed by an
        /// `insert`.
        Duplicate {
            display("key already present")
        }
        /// No relocation path was found within the kick budget.
        ///
        /// The table is effectively full for this key. The caller should `expand` and retry.
        Full {
            display("no free slot reachable within the kick budget")
        }
    }
}

quick_error! {
    /// An expansion failure.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub enum ExpandError {
        /// A previous expansion is still being cleaned up.
        ///
        /// The cleanup is driven by ordinary writes; keep writing (or retry later) and it will
        /// finish.
        UnderExpansion {
            display("an expansion is already in progress")
        }
    }
}

/// A concurrent cuckoo hash map over fixed-width integer keys and values.
///
/// Every key lives in one of two buckets determined by its hash, so lookups are constant-time
/// and lock-free; insertions and deletions lock only the two buckets involved. See the crate
/// documentation for the full picture.
///
/// The all-zero key is reserved as the empty-slot sentinel: `insert` panics on it, and `find`
/// and `delete` treat it as trivially absent.
pub struct CuckooMap {
    /// The inner table, behind the array-pinning lock.
    pub(crate) table: RwLock<Table>,
    /// The number of live entries.
    pub(crate) items: AtomicUsize,
    /// The sink for diagnostics and `report`.
    pub(crate) log: Logger,
}

impl CuckooMap {
    /// Create a map with `2 ^ DEFAULT_HASHPOWER` buckets.
    pub fn new() -> CuckooMap {
        CuckooMap::with_hashpower(DEFAULT_HASHPOWER)
    }

    /// Create a map with `2 ^ hashpower` buckets and no logging.
    ///
    /// # Panics
    ///
    /// Panics if `hashpower` is zero (the placement function needs at least two buckets) or
    /// absurdly large.
    pub fn with_hashpower(hashpower: usize) -> CuckooMap {
        CuckooMap::with_logger(hashpower, Logger::root(Discard, o!()))
    }

    /// Create a map with `2 ^ hashpower` buckets, reporting through `log`.
    pub fn with_logger(hashpower: usize, log: Logger) -> CuckooMap {
        assert!(
            hashpower > 0 && hashpower < 32,
            "hashpower {} out of range",
            hashpower
        );

        CuckooMap {
            table: RwLock::new(Table::new(hashpower)),
            items: AtomicUsize::new(0),
            log: log,
        }
    }

    /// Look up the value of `key`.
    ///
    /// Lock-free: concurrent writers never block a lookup, and a returned value is never torn.
    ///
    /// # Example
    ///
    /// ```rust
    /// let map = ccuckoo::CuckooMap::with_hashpower(4);
    ///
    /// map.insert(42, 1).unwrap();
    /// assert_eq!(map.find(42), Some(1));
    /// assert_eq!(map.find(43), None);
    /// ```
    pub fn find(&self, key: Key) -> Option<Val> {
        if key == EMPTY_KEY {
            // The sentinel matches every empty slot; it cannot be a real key.
            return None;
        }

        self.table.read().find(key)
    }

    /// Insert `key` with value `val`.
    ///
    /// Fails with `InsertError::Duplicate` if the key is present (the old value stays), and
    /// with `InsertError::Full` if no slot could be freed within the kick budget; the latter
    /// calls for an `expand`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is the reserved all-zero sentinel.
    pub fn insert(&self, key: Key, val: Val) -> Result<(), InsertError> {
        assert!(key != EMPTY_KEY, "the all-zero key is reserved");

        let table = self.table.read();

        match table.insert(key, val) {
            Ok(()) => {
                self.items.fetch_add(1, ORDERING);
                Ok(())
            }
            Err(InsertError::Full) => {
                debug!(self.log, "table full";
                    "hashpower" => table.hashpower(),
                    "items" => self.len(),
                    "load_factor" => self.items.load(ORDERING) as f64
                        / (BUCKET_SLOTS * table.buckets()) as f64
                );

                Err(InsertError::Full)
            }
            Err(err) => Err(err),
        }
    }

    /// Delete `key`, returning its value if it was present.
    pub fn delete(&self, key: Key) -> Option<Val> {
        if key == EMPTY_KEY {
            // Matching the sentinel would "delete" an empty slot.
            return None;
        }

        let val = self.table.read().delete(key);

        if val.is_some() {
            self.items.fetch_sub(1, ORDERING);
        }

        val
    }

    /// Double the table's capacity.
    ///
    /// The doubled array starts out with every old bucket duplicated into both halves; the
    /// duplicates are scrubbed away incrementally by subsequent writes. Fails with
    /// `ExpandError::UnderExpansion` while a previous doubling is still being scrubbed.
    ///
    /// Expansion briefly excludes all other operations (it holds the write side of the
    /// array-pinning lock across the copy).
    pub fn expand(&self) -> Result<(), ExpandError> {
        let mut table = self.table.write();

        if table.is_expanding() {
            return Err(ExpandError::UnderExpansion);
        }

        table.double();

        debug!(self.log, "table doubled";
            "hashpower" => table.hashpower(),
            "items" => self.len()
        );

        Ok(())
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.items.load(ORDERING)
    }

    /// Is the map empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of buckets.
    pub fn buckets(&self) -> usize {
        self.table.read().buckets()
    }

    /// The total number of slots.
    pub fn capacity(&self) -> usize {
        BUCKET_SLOTS * self.buckets()
    }

    /// The fraction of slots holding a live entry, in `[0, 1]`.
    pub fn load_factor(&self) -> f64 {
        let table = self.table.read();

        self.items.load(ORDERING) as f64 / (BUCKET_SLOTS * table.buckets()) as f64
    }

    /// Log a human-readable summary of the table's state.
    pub fn report(&self) {
        let table = self.table.read();
        let buckets = table.buckets();

        info!(self.log, "cuckoo table report";
            "items" => self.len(),
            "buckets" => buckets,
            "bytes" => buckets * mem::size_of::<Bucket>(),
            "load_factor" => self.items.load(ORDERING) as f64
                / (BUCKET_SLOTS * buckets) as f64,
            "expanding" => table.is_expanding()
        );
    }
}

impl Default for CuckooMap {
    fn default() -> CuckooMap {
        CuckooMap::new()
    }
}

impl Clone for CuckooMap {
    fn clone(&self) -> CuckooMap {
        // The write lock excludes every writer (and reader), making the snapshot consistent.
        let table = self.table.write();

        CuckooMap {
            table: RwLock::new(table.duplicate()),
            items: AtomicUsize::new(self.items.load(ORDERING)),
            log: self.log.clone(),
        }
    }
}
