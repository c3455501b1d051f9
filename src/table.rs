//! The low-level table: bucket array, writer protocol, and slot operations.
//!
//! This is the machinery beneath `CuckooMap`. It owns the bucket array and the version counter
//! array, and implements the two protocols everything else is built from:
//!
//! **The reader protocol** (`find`) takes no lock. It spins while either home bucket is dirty,
//! snapshots both buckets' version stripes, scans the slots, and re-reads the stripes. A changed
//! stripe or a raised dirty flag sends it around again. The loop terminates because writers hold
//! buckets dirty only across a handful of word stores.
//!
//! **The writer protocol** brackets every slot mutation: acquire the bucket lock(s), raise the
//! dirty flag(s), store, bump the version stripe(s), lower the flag(s), release. Two-bucket
//! acquisitions go in ascending bucket order (collapsing when the two homes coincide), so plain
//! writers cannot deadlock against each other.
//!
//! # Expansion and stale slots
//!
//! Doubling the table copies the old bucket array into both halves of the new one. Every live
//! key is then present twice: once in a bucket that is one of its homes under the new hashpower,
//! and once in a bucket that is not. The second copy is a *stale slot*. Stale slots are treated
//! as free space: any scan that holds the owning bucket's lock may clear them (the live copy
//! elsewhere keeps the key findable), and the incremental cleaner scrubs the whole array a
//! quantum at a time until none are left.

use parking_lot::Mutex;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bucket::Bucket;
use map::InsertError;
use version::Counters;
use {path, place};
use {Key, Val, BUCKET_SLOTS, CLEAN_QUANTUM, EMPTY_KEY};

/// The low-level hash table.
///
/// This is `CuckooMap` minus the outer lock, the item counter, and the logger: resizing it is
/// only possible through `&mut self`, and it does not know how many entries it holds.
pub struct Table {
    /// The bucket array; always `2 ^ hashpower` buckets.
    buckets: Box<[Bucket]>,
    /// The version counter stripes.
    counters: Counters,
    /// The current hashpower.
    ///
    /// Only mutated through `&mut self` (i.e. under the map's table-wide write lock), so shared
    /// readers may load it freely.
    hashpower: usize,
    /// Is an expansion awaiting cleanup?
    expanding: AtomicBool,
    /// The prefix of the bucket array that has been scrubbed of stale slots.
    cleaned: AtomicUsize,
    /// Serializes cleaners, so `cleaned` advances from a single thread at a time.
    cleaner: Mutex<()>,
}

impl Table {
    /// Create an empty table with `2 ^ hashpower` buckets.
    pub fn new(hashpower: usize) -> Table {
        let n = place::buckets(hashpower);

        // `Bucket` holds atomics and isn't `Clone`; build the vector by hand.
        let mut vec = Vec::with_capacity(n);
        for _ in 0..n {
            vec.push(Bucket::default());
        }

        Table {
            buckets: vec.into_boxed_slice(),
            counters: Counters::new(),
            hashpower: hashpower,
            expanding: AtomicBool::new(false),
            cleaned: AtomicUsize::new(0),
            cleaner: Mutex::new(()),
        }
    }

    /// The current hashpower.
    pub fn hashpower(&self) -> usize {
        self.hashpower
    }

    /// The number of buckets.
    pub fn buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Is the table still scrubbing stale slots out of a finished doubling?
    pub fn is_expanding(&self) -> bool {
        self.expanding.load(Ordering::Relaxed)
    }

    /// Get bucket `i`.
    #[inline]
    pub fn bucket(&self, i: usize) -> &Bucket {
        &self.buckets[i]
    }

    /// Compute the two home buckets of a digest.
    #[inline]
    pub fn homes(&self, digest: u32) -> (usize, usize) {
        let i1 = place::home(digest, self.hashpower);

        (i1, place::partner(digest, i1, self.hashpower))
    }

    /// The partner bucket of `bucket` under the key sitting in it.
    #[inline]
    pub fn partner_of(&self, key: Key, bucket: usize) -> usize {
        place::partner(place::digest(key), bucket, self.hashpower)
    }

    /// Is bucket `i` neither of `key`'s homes?
    fn misplaced(&self, key: Key, i: usize) -> bool {
        let (i1, i2) = self.homes(place::digest(key));

        i != i1 && i != i2
    }

    /// Is `key`'s residence in bucket `i` a redundant leftover of a doubling?
    ///
    /// Redundant means either misplaced (this bucket is neither home of the key), or the
    /// higher-indexed of two twin copies the doubling left at *both* homes of a key whose old
    /// homes coincided; the lower-indexed copy is the one to keep.
    ///
    /// The twin check is only stable while the caller holds bucket `i`'s lock: any writer
    /// touching the key needs both of its homes' locks, so holding one pins the other copy.
    /// Lock-free callers (such as `dump` on a quiescent table) must tolerate staleness.
    pub fn is_redundant(&self, key: Key, i: usize) -> bool {
        let (i1, i2) = self.homes(place::digest(key));

        if i != i1 && i != i2 {
            // A stale copy; the live one sits at a real home.
            return true;
        }

        let other = if i == i1 { i2 } else { i1 };

        other < i && self.read_from(key, other).is_some()
    }

    /// Is slot `(i, j)` free for placement?
    ///
    /// Truly empty slots are free. During expansion cleanup, slots holding a misplaced key are
    /// also free: such a slot is a stale duplicate of a live entry at the key's real home, so
    /// overwriting it loses nothing. This check takes no lock and may go stale immediately; any
    /// placement based on it must re-validate under the bucket lock.
    pub fn slot_is_free(&self, i: usize, j: usize) -> bool {
        let key = self.bucket(i).key(j);

        if key == EMPTY_KEY {
            return true;
        }

        self.expanding.load(Ordering::Relaxed) && self.misplaced(key, i)
    }

    // -------------------------------------------------------------------------------------
    // Writer protocol
    // -------------------------------------------------------------------------------------

    /// Lock two buckets in canonical (ascending) order.
    ///
    /// When both indices name the same bucket, it is locked once.
    pub fn lock2(&self, i1: usize, i2: usize) {
        let (lo, hi) = if i1 < i2 { (i1, i2) } else { (i2, i1) };

        self.bucket(lo).lock();
        if hi != lo {
            self.bucket(hi).lock();
        }
    }

    /// Unlock two buckets locked by `lock2`.
    pub fn unlock2(&self, i1: usize, i2: usize) {
        self.bucket(i1).unlock();
        if i2 != i1 {
            self.bucket(i2).unlock();
        }
    }

    /// Raise the dirty flags of two buckets (once, if they coincide).
    pub fn mark_dirty2(&self, i1: usize, i2: usize) {
        self.bucket(i1).mark_dirty();
        if i2 != i1 {
            self.bucket(i2).mark_dirty();
        }
    }

    /// Finish a single-bucket mutation: bump the version stripe, then lower the dirty flag.
    ///
    /// The order matters: a reader that sees the flag down must already see the bumped counter,
    /// or it could validate a torn scan against the old version.
    pub fn mark_clean(&self, i: usize) {
        self.counters.incr(i);
        self.bucket(i).mark_clean();
    }

    /// Finish a two-bucket mutation.
    pub fn mark_clean2(&self, i1: usize, i2: usize) {
        self.counters.incr2(i1, i2);

        self.bucket(i1).mark_clean();
        if i2 != i1 {
            self.bucket(i2).mark_clean();
        }
    }

    /// Write a key/value pair into slot `(i, j)` under the writer protocol.
    ///
    /// The caller must hold bucket `i`'s lock and have established that the slot is free.
    pub fn fill_slot(&self, i: usize, j: usize, key: Key, val: Val) {
        self.bucket(i).mark_dirty();
        self.bucket(i).put(j, key, val);
        self.mark_clean(i);
    }

    // -------------------------------------------------------------------------------------
    // Slot operations (under lock)
    // -------------------------------------------------------------------------------------

    /// Find a free slot in bucket `i`, scrubbing stale slots on the way.
    ///
    /// The caller must hold bucket `i`'s lock. A stale slot is cleared as it is found; clearing
    /// is a single key store taking the slot between two states readers can both handle (the
    /// stale key's live copy sits at its real home), so no dirty bracket is needed for it.
    fn free_slot_in(&self, i: usize) -> Option<usize> {
        for j in 0..BUCKET_SLOTS {
            let key = self.bucket(i).key(j);

            if key == EMPTY_KEY {
                return Some(j);
            }

            if self.expanding.load(Ordering::Relaxed) && self.misplaced(key, i) {
                self.bucket(i).clear(j);
                return Some(j);
            }
        }

        None
    }

    /// Is `key` present in either of the two (locked) buckets?
    fn key_in(&self, key: Key, i1: usize, i2: usize) -> bool {
        for j in 0..BUCKET_SLOTS {
            if self.bucket(i1).key(j) == key {
                return true;
            }
        }
        for j in 0..BUCKET_SLOTS {
            if self.bucket(i2).key(j) == key {
                return true;
            }
        }

        false
    }

    /// Delete `key` from bucket `i` if present, returning its value.
    ///
    /// The caller must hold bucket `i`'s lock.
    fn del_from(&self, key: Key, i: usize) -> Option<Val> {
        for j in 0..BUCKET_SLOTS {
            if self.bucket(i).key(j) == key {
                self.bucket(i).mark_dirty();
                let val = self.bucket(i).val(j);
                self.bucket(i).clear(j);
                self.mark_clean(i);

                return Some(val);
            }
        }

        None
    }

    /// Scan bucket `i` for `key` without locking.
    pub fn read_from(&self, key: Key, i: usize) -> Option<Val> {
        for j in 0..BUCKET_SLOTS {
            if self.bucket(i).key(j) == key {
                return Some(self.bucket(i).val(j));
            }
        }

        None
    }

    /// Are either of the two buckets dirty?
    fn dirty2(&self, i1: usize, i2: usize) -> bool {
        self.bucket(i1).is_dirty() || self.bucket(i2).is_dirty()
    }

    // -------------------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------------------

    /// Look up `key` optimistically.
    ///
    /// Never blocks and never takes a lock; retries until it observes a quiescent window for the
    /// key's two buckets. During expansion cleanup, a stale duplicate of `key` may be visible in
    /// one home; it holds the same value as the live copy, so returning it is still consistent.
    pub fn find(&self, key: Key) -> Option<Val> {
        let (i1, i2) = self.homes(place::digest(key));

        loop {
            // Don't bother scanning mid-mutation.
            while self.dirty2(i1, i2) {
                spin_loop();
            }

            let (v1s, v2s) = self.counters.begin_read(i1, i2);

            let found = self.read_from(key, i1).or_else(|| self.read_from(key, i2));

            let (v1e, v2e) = self.counters.end_read(i1, i2);

            // A moved counter or a raised flag means the scan may be torn; go again.
            if v1s == v1e && v2s == v2e && !self.dirty2(i1, i2) {
                return found;
            }
        }
    }

    /// Insert `key` with `val`.
    ///
    /// Tries both homes directly, then asks the relocation machinery to free a slot in one of
    /// them. While an expansion is being cleaned up, a successful or exhausted attempt also
    /// contributes a quantum of scrubbing.
    pub fn insert(&self, key: Key, val: Val) -> Result<(), InsertError> {
        let (i1, i2) = self.homes(place::digest(key));

        self.lock2(i1, i2);

        // Duplicate detection happens under the locks, so two concurrent insertions of the same
        // key cannot both succeed.
        if self.key_in(key, i1, i2) {
            self.unlock2(i1, i2);
            return Err(InsertError::Duplicate);
        }

        let status = if let Some(j) = self.free_slot_in(i1) {
            self.fill_slot(i1, j, key, val);
            Ok(())
        } else if let Some(j) = self.free_slot_in(i2) {
            self.fill_slot(i2, j, key, val);
            Ok(())
        } else if let Some((i, j)) = path::run_cuckoo(self, i1, i2) {
            // The freed slot is in one of our two locked home buckets, so nothing can have
            // taken it between the relocation and this store.
            self.fill_slot(i, j, key, val);
            Ok(())
        } else {
            Err(InsertError::Full)
        };

        if self.is_expanding() {
            self.clean_step(CLEAN_QUANTUM, i1, i2);
        }

        self.unlock2(i1, i2);

        status
    }

    /// Delete `key`, returning its value if it was present.
    pub fn delete(&self, key: Key) -> Option<Val> {
        let (i1, i2) = self.homes(place::digest(key));

        self.lock2(i1, i2);

        // A doubling can leave a key with twin copies at both of its homes (when its old homes
        // coincided); clear every copy, or a leftover twin would undo the deletion.
        let first = self.del_from(key, i1);
        let second = if i2 != i1 { self.del_from(key, i2) } else { None };

        self.unlock2(i1, i2);

        first.or(second)
    }

    // -------------------------------------------------------------------------------------
    // Expansion
    // -------------------------------------------------------------------------------------

    /// Double the bucket array in place.
    ///
    /// The new array is the old one duplicated into both halves, which preserves every lookup:
    /// each live key ends up with one copy in a bucket that is a home under the new hashpower
    /// and one stale copy that the cleaner will scrub. Requires `&mut self`, i.e. the table-wide
    /// write lock, so no reader can hold the old array across the swap.
    pub fn double(&mut self) {
        debug_assert!(!self.is_expanding());

        let n = self.buckets.len();

        let mut vec = Vec::with_capacity(2 * n);
        for i in 0..2 * n {
            vec.push(self.buckets[i & (n - 1)].duplicate());
        }

        // The old array is dropped here, under the write lock.
        self.buckets = vec.into_boxed_slice();
        self.hashpower += 1;
        *self.cleaned.get_mut() = 0;
        *self.expanding.get_mut() = true;
    }

    /// Scrub up to `quantum` buckets of stale slots.
    ///
    /// `held1` and `held2` are the buckets whose locks the caller already holds. Only one
    /// cleaner runs at a time (the cleaner mutex); everyone else skips. Bucket locks are only
    /// tried, never waited on: a cleaner that blocked while holding two home locks could close
    /// a wait cycle with another writer doing the same.
    pub fn clean_step(&self, quantum: usize, held1: usize, held2: usize) {
        let _guard = match self.cleaner.try_lock() {
            Some(guard) => guard,
            // Someone else is already scrubbing.
            None => return,
        };

        let n = self.buckets.len();

        for _ in 0..quantum {
            let i = self.cleaned.load(Ordering::Relaxed);
            if i >= n {
                break;
            }

            let held = i == held1 || i == held2;
            if !held && !self.bucket(i).try_lock_spin(64) {
                // Contended; a later write will resume from here.
                return;
            }

            self.scrub(i);

            if !held {
                self.bucket(i).unlock();
            }

            self.cleaned.store(i + 1, Ordering::Relaxed);
        }

        if self.cleaned.load(Ordering::Relaxed) >= n {
            self.expanding.store(false, Ordering::Relaxed);
        }
    }

    /// Clear every redundant slot of (locked) bucket `i`.
    ///
    /// The sweep visits the higher-indexed twin of a duplicated key while the lower-indexed
    /// one still pins it, so after a full sweep every key is stored exactly once.
    fn scrub(&self, i: usize) {
        let mut dirtied = false;

        for j in 0..BUCKET_SLOTS {
            let key = self.bucket(i).key(j);
            if key == EMPTY_KEY {
                continue;
            }

            if self.is_redundant(key, i) {
                if !dirtied {
                    self.bucket(i).mark_dirty();
                    dirtied = true;
                }

                self.bucket(i).clear(j);
            }
        }

        if dirtied {
            self.mark_clean(i);
        }
    }

    /// Snapshot the whole table.
    ///
    /// Not consistent under concurrent writers; the map's `Clone` takes the table-wide write
    /// lock first.
    pub fn duplicate(&self) -> Table {
        let mut vec = Vec::with_capacity(self.buckets.len());
        for bucket in self.buckets.iter() {
            vec.push(bucket.duplicate());
        }

        Table {
            buckets: vec.into_boxed_slice(),
            counters: Counters::new(),
            hashpower: self.hashpower,
            expanding: AtomicBool::new(self.is_expanding()),
            cleaned: AtomicUsize::new(self.cleaned.load(Ordering::Relaxed)),
            cleaner: Mutex::new(()),
        }
    }
}
