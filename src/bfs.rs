//! The breadth-first relocation planner.
//!
//! When both of a key's home buckets are full, the insertion has to displace somebody. Each
//! occupant of a full bucket could move to its own partner bucket, each occupant of *that*
//! bucket could move one further, and so on: the buckets form an implicit graph, and freeing a
//! slot in a home bucket means finding a path through it that ends in a bucket with an empty
//! slot. BFS finds the *shortest* such path, which minimizes the number of locks taken and
//! writes performed per insertion; at the load factors where relocations dominate, that is the
//! metric that matters.
//!
//! The search is bounded by `MAX_KICKS` node expansions and `MAX_BFS_DEPTH` hops, and its queue
//! is a fixed-size array dimensioned so the budget always runs out before the queue does. Paths
//! are not stored in the queue entries; instead every state carries a *pathcode*, a base-`B`
//! integer accumulating the slot index chosen at every hop. Reconstructing the path is then a
//! matter of peeling digits off the code and following partner buckets from the root.
//!
//! The planner reads slots without taking any lock, so the plan it returns is advisory. The
//! executor re-validates every hop under the proper bucket locks and aborts the path if reality
//! has moved on.

use rand;

use table::Table;
use {Key, BUCKET_SLOTS, EMPTY_KEY, MAX_BFS_DEPTH, MAX_KICKS};

/// The search queue capacity.
///
/// At most two roots plus one state per kick can ever be enqueued, and a single expansion adds
/// at most `BUCKET_SLOTS` children after the budget check, so this never overflows.
const QUEUE_CAP: usize = MAX_KICKS + BUCKET_SLOTS + 2;

/// A search state: a bucket reached by a chain of displacements.
#[derive(Copy, Clone)]
struct State {
    /// The bucket this state stands in.
    bucket: usize,
    /// The bucket we came from, for pruning immediate U-turns.
    parent: usize,
    /// The packed path: the root tag followed by one base-`BUCKET_SLOTS` digit per hop.
    pathcode: u32,
    /// The number of hops taken from the root.
    depth: usize,
}

/// The nil state used to fill the queue's backing array.
const NIL: State = State {
    bucket: 0,
    parent: !0,
    pathcode: 0,
    depth: 0,
};

/// A bounded FIFO of search states.
///
/// Since the total number of enqueues is bounded by the kick budget, the backing array never
/// wraps and the cursors only move forward.
struct Queue {
    /// The backing array.
    states: [State; QUEUE_CAP],
    /// The index of the next state to dequeue.
    head: usize,
    /// The index one past the last enqueued state.
    tail: usize,
}

impl Queue {
    /// Create an empty queue.
    fn new() -> Queue {
        Queue {
            states: [NIL; QUEUE_CAP],
            head: 0,
            tail: 0,
        }
    }

    /// Append a state.
    fn push(&mut self, state: State) {
        debug_assert!(self.tail < QUEUE_CAP);

        self.states[self.tail] = state;
        self.tail += 1;
    }

    /// Remove and return the oldest state, if any.
    fn pop(&mut self) -> Option<State> {
        if self.head == self.tail {
            return None;
        }

        let state = self.states[self.head];
        self.head += 1;

        Some(state)
    }
}

/// One step of a reconstructed relocation path.
#[derive(Copy, Clone)]
pub struct PathEntry {
    /// The bucket of this step.
    pub bucket: usize,
    /// The slot within the bucket.
    pub slot: usize,
    /// The key observed in the slot at planning time; the executor re-validates against it.
    ///
    /// Meaningless for the terminal entry, whose slot is the empty target.
    pub key: Key,
}

/// The nil entry used to fill path arrays.
const NIL_ENTRY: PathEntry = PathEntry {
    bucket: 0,
    slot: 0,
    key: EMPTY_KEY,
};

/// A reconstructed relocation path.
///
/// `entries[0]` sits in one of the insertion's home buckets; `entries[depth]` is the empty
/// target slot. Walking the path backwards moves every key one step towards the target,
/// leaving `entries[0]`'s slot free.
pub struct Path {
    /// The steps; only `entries[0..=depth]` are meaningful.
    pub entries: [PathEntry; MAX_BFS_DEPTH + 1],
    /// The number of hops.
    pub depth: usize,
}

/// Plan a relocation path from one of the two home buckets to an empty slot.
///
/// Returns `None` if the kick budget runs out first, which the caller reports as a full table.
pub fn plan(table: &Table, i1: usize, i2: usize) -> Option<Path> {
    search(table, i1, i2).map(|terminal| decode(table, &terminal, i1, i2))
}

/// Breadth-first search for a bucket with a free slot.
fn search(table: &Table, i1: usize, i2: usize) -> Option<State> {
    let mut queue = Queue::new();

    // The root tags 1 and 2 record which home the path starts from; they double as the most
    // significant pathcode digit, so they must be nonzero.
    queue.push(State {
        bucket: i1,
        parent: !0,
        pathcode: 1,
        depth: 0,
    });
    queue.push(State {
        bucket: i2,
        parent: !0,
        pathcode: 2,
        depth: 0,
    });

    // A pseudo-random rotation of the slot scan order, drawn once per search. Without it, an
    // adversarial workload would get the same victim slot kicked over and over.
    let rotation = rand::random::<u8>() as usize % BUCKET_SLOTS;

    let mut kicks = 0;

    while kicks < MAX_KICKS {
        let x = match queue.pop() {
            Some(x) => x,
            None => break,
        };

        // The partner buckets already produced by this expansion, for de-duplication within
        // the fan-out. Tracking visited buckets globally isn't worth it under a budget this
        // small; duplicates across expansions only cost budget, not correctness.
        let mut children = [!0; BUCKET_SLOTS];

        for k in 0..BUCKET_SLOTS {
            let j = (rotation + k) % BUCKET_SLOTS;
            let child = table.partner_of(table.bucket(x.bucket).key(j), x.bucket);

            // Going straight back is never part of a shortest path.
            if child == x.parent {
                continue;
            }
            if children[..k].contains(&child) {
                continue;
            }
            children[k] = child;

            let code = x.pathcode * BUCKET_SLOTS as u32 + j as u32;

            // If the child has a free slot, the path is complete: extend the code by the
            // target slot and hand the state back.
            for m in 0..BUCKET_SLOTS {
                let jj = (rotation + m) % BUCKET_SLOTS;

                if table.slot_is_free(child, jj) {
                    return Some(State {
                        bucket: child,
                        parent: x.bucket,
                        pathcode: code * BUCKET_SLOTS as u32 + jj as u32,
                        depth: x.depth + 1,
                    });
                }
            }

            // Otherwise keep searching through it, depth permitting.
            if x.depth + 1 < MAX_BFS_DEPTH {
                queue.push(State {
                    bucket: child,
                    parent: x.bucket,
                    pathcode: code,
                    depth: x.depth + 1,
                });
            }

            kicks += 1;
        }
    }

    None
}

/// Peel the base-`BUCKET_SLOTS` digits off a pathcode.
///
/// `digits[0]` is the root tag, `digits[1..=depth]` the displaced slot per hop, and
/// `digits[depth + 1]` the target slot.
fn unpack(pathcode: u32, depth: usize) -> [usize; MAX_BFS_DEPTH + 2] {
    let mut digits = [0; MAX_BFS_DEPTH + 2];
    let mut code = pathcode as usize;

    let mut d = depth + 1;
    loop {
        digits[d] = code % BUCKET_SLOTS;
        code /= BUCKET_SLOTS;

        if d == 0 {
            break;
        }
        d -= 1;
    }

    digits
}

/// Reconstruct the full path from a terminal search state.
///
/// The buckets along the path are re-derived by following partners of the keys currently in the
/// recorded slots. A concurrent writer may have moved a key since the search saw it; the
/// recorded key lets the executor detect exactly that.
fn decode(table: &Table, terminal: &State, i1: usize, i2: usize) -> Path {
    let digits = unpack(terminal.pathcode, terminal.depth);

    let mut path = Path {
        entries: [NIL_ENTRY; MAX_BFS_DEPTH + 1],
        depth: terminal.depth,
    };

    path.entries[0].bucket = if digits[0] == 1 { i1 } else { i2 };

    for d in 0..terminal.depth + 1 {
        path.entries[d].slot = digits[d + 1];

        if d == terminal.depth {
            break;
        }

        let key = table.bucket(path.entries[d].bucket).key(path.entries[d].slot);
        path.entries[d].key = key;
        path.entries[d + 1].bucket = table.partner_of(key, path.entries[d].bucket);
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let mut queue = Queue::new();
        assert!(queue.pop().is_none());

        for i in 0..10 {
            let mut state = NIL;
            state.bucket = i;
            queue.push(state);
        }

        for i in 0..10 {
            assert_eq!(queue.pop().unwrap().bucket, i);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn unpack_peels_digits() {
        // Root tag 1, displaced slots 2 and 3, target slot 1, at depth 2.
        let code = ((1 * BUCKET_SLOTS as u32 + 2) * BUCKET_SLOTS as u32 + 3)
            * BUCKET_SLOTS as u32
            + 1;

        let digits = unpack(code, 2);
        assert_eq!(digits[0], 1);
        assert_eq!(digits[1], 2);
        assert_eq!(digits[2], 3);
        assert_eq!(digits[3], 1);
    }

    #[test]
    fn unpack_roundtrips() {
        for depth in 0..MAX_BFS_DEPTH {
            for seed in 0..81usize {
                // Build an arbitrary digit string of the right length and pack it.
                let mut code = 2u32;
                let mut digits = Vec::new();
                let mut s = seed;
                for _ in 0..depth + 2 {
                    digits.push(s % BUCKET_SLOTS);
                    s /= BUCKET_SLOTS;
                }

                for &d in &digits {
                    code = code * BUCKET_SLOTS as u32 + d as u32;
                }

                let unpacked = unpack(code, depth + 1);
                assert_eq!(unpacked[0], 2);
                for (i, &d) in digits.iter().enumerate() {
                    assert_eq!(unpacked[i + 1], d);
                }
            }
        }
    }
}
