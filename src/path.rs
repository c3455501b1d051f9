//! Relocation path execution.
//!
//! The planner hands back a path whose terminal slot was empty when it looked; this module makes
//! it true. The path is walked *backwards*: the key next to the empty slot moves into it, the
//! key before that moves into the hole just vacated, and so on until the hole has bubbled all
//! the way to `entries[0]`, which sits in one of the inserting key's home buckets.
//!
//! The planner ran without locks, so every hop is re-validated once its buckets are actually
//! locked: the key to move must still be the one the planner saw, and the destination slot must
//! still be free. Any mismatch aborts the walk and the insertion replans. The two home buckets
//! stay locked by the insertion for its whole duration; intermediate buckets are only ever
//! *tried* with a bounded spin, never waited on, so two relocations cannot park on each other's
//! held locks indefinitely.

use bfs::{self, Path};
use table::Table;
use EMPTY_KEY;

/// How long to spin for an intermediate bucket before giving the path up.
const LOCK_SPINS: usize = 128;

/// Free a slot in one of the two (locked) home buckets by cuckoo relocation.
///
/// Returns the freed `(bucket, slot)`, or `None` if no path could be found within the kick
/// budget, i.e. the table is effectively full for this key. The freed slot is in a bucket whose
/// lock the caller holds, so it stays free until the caller fills it.
pub fn run_cuckoo(table: &Table, i1: usize, i2: usize) -> Option<(usize, usize)> {
    loop {
        let path = match bfs::plan(table, i1, i2) {
            Some(path) => path,
            None => return None,
        };

        if execute(table, &path, i1, i2) {
            return Some((path.entries[0].bucket, path.entries[0].slot));
        }

        // A concurrent writer beat us to part of the path; plan afresh. This terminates: an
        // aborted walk means somebody else made progress, and the planner itself stays bounded
        // by the kick budget.
    }
}

/// Walk the path backwards, moving one key per hop.
///
/// Returns `false` if any hop failed validation; earlier hops already performed remain in
/// place, which is harmless (they moved keys between their own legal homes).
fn execute(table: &Table, path: &Path, i1: usize, i2: usize) -> bool {
    let mut depth = path.depth;

    while depth > 0 {
        let from = path.entries[depth - 1];
        let to = path.entries[depth];

        if !lock_pair_except(table, from.bucket, to.bucket, i1, i2) {
            return false;
        }

        // There's a small chance we've been scooped by a concurrent relocation since the plan
        // was drawn up; check that the key is still where the planner saw it, and that the
        // destination is still free.
        if table.bucket(from.bucket).key(from.slot) != from.key
            || !table.slot_is_free(to.bucket, to.slot)
        {
            unlock_pair_except(table, from.bucket, to.bucket, i1, i2);
            return false;
        }

        if from.key != EMPTY_KEY && table.read_from(from.key, to.bucket).is_some() {
            // The key already sits in the destination bucket: a doubling left twin copies at
            // both of its homes. Moving would duplicate it within one bucket; dropping this
            // copy frees the slot just as well. Both copies are pinned while we hold the two
            // homes' locks.
            table.bucket(from.bucket).mark_dirty();
            table.bucket(from.bucket).clear(from.slot);
            table.mark_clean(from.bucket);
        } else {
            table.mark_dirty2(from.bucket, to.bucket);

            let val = table.bucket(from.bucket).val(from.slot);
            table.bucket(to.bucket).put(to.slot, from.key, val);
            table.bucket(from.bucket).clear(from.slot);

            table.mark_clean2(from.bucket, to.bucket);
        }

        unlock_pair_except(table, from.bucket, to.bucket, i1, i2);

        depth -= 1;
    }

    true
}

/// Lock the pair `(a, b)` in ascending order, skipping buckets in `{x, y}` (already held by the
/// caller) and collapsing if the pair coincides.
///
/// Returns `false` (with nothing newly held) if either lock could not be taken within the spin
/// bound.
fn lock_pair_except(table: &Table, a: usize, b: usize, x: usize, y: usize) -> bool {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };

    let take_lo = lo != x && lo != y;
    let take_hi = hi != lo && hi != x && hi != y;

    if take_lo && !table.bucket(lo).try_lock_spin(LOCK_SPINS) {
        return false;
    }

    if take_hi && !table.bucket(hi).try_lock_spin(LOCK_SPINS) {
        if take_lo {
            table.bucket(lo).unlock();
        }
        return false;
    }

    true
}

/// Undo `lock_pair_except`.
fn unlock_pair_except(table: &Table, a: usize, b: usize, x: usize, y: usize) {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };

    if hi != lo && hi != x && hi != y {
        table.bucket(hi).unlock();
    }
    if lo != x && lo != y {
        table.bucket(lo).unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use table::Table;

    #[test]
    fn lock_pair_skips_held_buckets() {
        let table = Table::new(3);

        // Simulate an insertion holding its two homes.
        table.lock2(1, 2);

        // A pair overlapping the held set only takes the fresh bucket.
        assert!(lock_pair_except(&table, 1, 5, 1, 2));
        assert!(!table.bucket(5).try_lock());
        assert!(table.bucket(6).try_lock());
        table.bucket(6).unlock();

        unlock_pair_except(&table, 1, 5, 1, 2);
        assert!(table.bucket(5).try_lock());
        table.bucket(5).unlock();

        // A fully-held pair takes nothing and trivially succeeds.
        assert!(lock_pair_except(&table, 2, 1, 1, 2));
        unlock_pair_except(&table, 2, 1, 1, 2);

        table.unlock2(1, 2);
        assert!(table.bucket(1).try_lock());
        table.bucket(1).unlock();
    }

    #[test]
    fn lock_pair_gives_up_on_contention() {
        let table = Table::new(3);

        // Somebody else holds bucket 4.
        table.bucket(4).lock();

        // The pair (3, 4) cannot be completed; bucket 3 must not be left behind locked.
        assert!(!lock_pair_except(&table, 3, 4, 0, 1));
        assert!(table.bucket(3).try_lock());
        table.bucket(3).unlock();

        table.bucket(4).unlock();
    }

    #[test]
    fn collapsed_pair_locks_once() {
        let table = Table::new(3);

        assert!(lock_pair_except(&table, 6, 6, 0, 1));
        assert!(!table.bucket(6).try_lock());

        unlock_pair_except(&table, 6, 6, 0, 1);
        assert!(table.bucket(6).try_lock());
        table.bucket(6).unlock();
    }
}
