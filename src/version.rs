//! Striped version counters.
//!
//! Readers validate their optimistic scans against an array of monotonically increasing
//! counters. There are far fewer counters than buckets: bucket `i` maps onto stripe
//! `i % COUNTER_STRIPES`, so unrelated buckets occasionally share a stripe. Sharing is harmless
//! (it can only cause a spurious retry, never a missed mutation), and it keeps the counter array
//! small enough to stay cache-resident.
//!
//! The protocol is a sequence lock split across writer and reader:
//!
//! - a writer bumps the stripe of every bucket it mutated, once, between its slot stores and the
//!   lowering of the dirty flag;
//! - a reader snapshots both relevant stripes before scanning and re-reads them after; any
//!   movement means the scan may have been torn and must be retried.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use COUNTER_STRIPES;

/// The version counter array.
pub struct Counters {
    /// The stripes; always `COUNTER_STRIPES` of them.
    stripes: Box<[AtomicU32]>,
}

impl Counters {
    /// Create a zeroed counter array.
    pub fn new() -> Counters {
        // `AtomicU32` isn't `Clone`, so the vector is built by hand.
        let mut vec = Vec::with_capacity(COUNTER_STRIPES);
        for _ in 0..COUNTER_STRIPES {
            vec.push(AtomicU32::new(0));
        }

        Counters {
            stripes: vec.into_boxed_slice(),
        }
    }

    /// The stripe of bucket `i`.
    #[inline]
    fn stripe(&self, i: usize) -> &AtomicU32 {
        &self.stripes[i & (COUNTER_STRIPES - 1)]
    }

    /// Snapshot the stripes of two buckets before an optimistic scan.
    ///
    /// The acquire loads pair with `incr`'s release increments: the scan that follows sees at
    /// least the slot stores of every mutation whose increment it observed.
    #[inline]
    pub fn begin_read(&self, i1: usize, i2: usize) -> (u32, u32) {
        (
            self.stripe(i1).load(Ordering::Acquire),
            self.stripe(i2).load(Ordering::Acquire),
        )
    }

    /// Re-read the stripes of two buckets after an optimistic scan.
    ///
    /// The fence keeps the scan's slot loads from drifting past this re-read.
    #[inline]
    pub fn end_read(&self, i1: usize, i2: usize) -> (u32, u32) {
        fence(Ordering::Acquire);

        (
            self.stripe(i1).load(Ordering::Relaxed),
            self.stripe(i2).load(Ordering::Relaxed),
        )
    }

    /// Bump the stripe of one bucket.
    #[inline]
    pub fn incr(&self, i: usize) {
        self.stripe(i).fetch_add(1, Ordering::Release);
    }

    /// Bump the stripes of two buckets, once each.
    ///
    /// When both buckets land on the same stripe, it is bumped only once; a double bump would
    /// be wasted work, not a bug.
    #[inline]
    pub fn incr2(&self, i1: usize, i2: usize) {
        let mask = COUNTER_STRIPES - 1;

        if i1 & mask != i2 & mask {
            self.stripe(i1).fetch_add(1, Ordering::Release);
            self.stripe(i2).fetch_add(1, Ordering::Release);
        } else {
            self.stripe(i1).fetch_add(1, Ordering::Release);
        }
    }
}
