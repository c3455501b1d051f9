//! Buckets: the bricks of the table.
//!
//! A bucket packs a small fixed number of key/value slots together with its own concurrency
//! metadata: a one-bit spinlock serializing writers, and a one-bit dirty flag telling optimistic
//! readers that a mutation is in flight. Slots are atomic words, so a racing reader can never
//! observe a torn key or value; what the dirty flag and the version counters add on top is that
//! the reader can detect a *pair* of words (or a pair of buckets) read across a mutation, and
//! retry.

use std::hint::spin_loop;
use std::sync::atomic::{fence, AtomicBool, Ordering};

use {Key, Val, BUCKET_SLOTS, EMPTY_KEY};

#[cfg(not(feature = "small-keys"))]
use std::sync::atomic::AtomicU64 as AtomicWord;
#[cfg(feature = "small-keys")]
use std::sync::atomic::AtomicU32 as AtomicWord;

/// A bucket of `BUCKET_SLOTS` key/value slots.
///
/// A slot is empty if and only if its key word equals `EMPTY_KEY`. The lock and dirty flags obey
/// the writer protocol described in the module documentation of `table`.
#[derive(Default)]
pub struct Bucket {
    /// The writer exclusion bit.
    lock: AtomicBool,
    /// The mid-mutation marker readers spin on.
    dirty: AtomicBool,
    /// The slot keys.
    keys: [AtomicWord; BUCKET_SLOTS],
    /// The slot values.
    vals: [AtomicWord; BUCKET_SLOTS],
}

impl Bucket {
    /// Acquire the bucket's writer lock, spinning until it is free.
    pub fn lock(&self) {
        loop {
            // Peek before the CAS so contended acquisition spins on a plain load.
            if !self.lock.load(Ordering::Relaxed)
                && self
                    .lock
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }

            spin_loop();
        }
    }

    /// Try to acquire the writer lock without blocking.
    pub fn try_lock(&self) -> bool {
        !self.lock.load(Ordering::Relaxed)
            && self
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Try to acquire the writer lock, giving up after a bounded number of spins.
    ///
    /// The relocation machinery uses this for buckets beyond the two it holds for the whole
    /// operation; giving up (and replanning the path) instead of waiting is what keeps two
    /// relocations from waiting on each other forever.
    pub fn try_lock_spin(&self, mut spins: usize) -> bool {
        loop {
            if self.try_lock() {
                return true;
            }

            if spins == 0 {
                return false;
            }
            spins -= 1;

            spin_loop();
        }
    }

    /// Release the writer lock.
    pub fn unlock(&self) {
        debug_assert!(self.lock.load(Ordering::Relaxed));
        debug_assert!(!self.dirty.load(Ordering::Relaxed));

        self.lock.store(false, Ordering::Release);
    }

    /// Is a writer currently mutating this bucket?
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Raise the dirty flag.
    ///
    /// Must be called with the lock held, before the first slot store of a mutation. The release
    /// fence orders the flag before the stores: a reader that observes any of them observes the
    /// flag too (its validation fence pairs with this one).
    pub fn mark_dirty(&self) {
        debug_assert!(self.lock.load(Ordering::Relaxed));

        self.dirty.store(true, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Lower the dirty flag.
    ///
    /// Must be called after the mutation's slot stores and after the version counter increment;
    /// the release store publishes both to any reader that sees the flag down.
    pub fn mark_clean(&self) {
        debug_assert!(self.lock.load(Ordering::Relaxed));

        self.dirty.store(false, Ordering::Release);
    }

    /// Read the key of slot `j`.
    #[inline]
    pub fn key(&self, j: usize) -> Key {
        self.keys[j].load(Ordering::Relaxed)
    }

    /// Read the value of slot `j`.
    #[inline]
    pub fn val(&self, j: usize) -> Val {
        self.vals[j].load(Ordering::Relaxed)
    }

    /// Store a key/value pair into slot `j`.
    #[inline]
    pub fn put(&self, j: usize, key: Key, val: Val) {
        self.keys[j].store(key, Ordering::Relaxed);
        self.vals[j].store(val, Ordering::Relaxed);
    }

    /// Clear slot `j` by storing the sentinel into its key word.
    ///
    /// The value word is left as-is; a slot's liveness is defined by its key alone.
    #[inline]
    pub fn clear(&self, j: usize) {
        self.keys[j].store(EMPTY_KEY, Ordering::Relaxed);
    }

    /// Snapshot this bucket into a fresh one with clean metadata.
    ///
    /// The atomics make `Bucket` non-`Clone`, so copying is spelled out. The copy is not a
    /// consistent snapshot unless the caller has excluded writers.
    pub fn duplicate(&self) -> Bucket {
        let new = Bucket::default();

        for j in 0..BUCKET_SLOTS {
            new.put(j, self.key(j), self.val(j));
        }

        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_clear() {
        let bucket = Bucket::default();

        for j in 0..BUCKET_SLOTS {
            assert_eq!(bucket.key(j), EMPTY_KEY);
        }

        bucket.put(2, 42, 1000);
        assert_eq!(bucket.key(2), 42);
        assert_eq!(bucket.val(2), 1000);

        bucket.clear(2);
        assert_eq!(bucket.key(2), EMPTY_KEY);
    }

    #[test]
    fn lock_excludes() {
        let bucket = Bucket::default();

        bucket.lock();
        assert!(!bucket.try_lock());
        assert!(!bucket.try_lock_spin(10));
        bucket.unlock();

        assert!(bucket.try_lock());
        bucket.unlock();
    }

    #[test]
    fn dirty_flag() {
        let bucket = Bucket::default();

        bucket.lock();
        assert!(!bucket.is_dirty());
        bucket.mark_dirty();
        assert!(bucket.is_dirty());
        bucket.mark_clean();
        assert!(!bucket.is_dirty());
        bucket.unlock();
    }

    #[test]
    fn duplicate_copies_slots() {
        let bucket = Bucket::default();
        bucket.put(0, 1, 2);
        bucket.put(3, 7, 8);

        let copy = bucket.duplicate();
        assert_eq!(copy.key(0), 1);
        assert_eq!(copy.val(0), 2);
        assert_eq!(copy.key(3), 7);
        assert_eq!(copy.val(3), 8);
        assert_eq!(copy.key(1), EMPTY_KEY);
    }
}
