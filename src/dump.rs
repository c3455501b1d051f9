//! Dumping tables to and from byte streams.
//!
//! The format is deliberately simple: a header of hashpower and item count (both `u64`), then
//! every slot of every bucket in order, key word then value word. All fields are little-endian.
//! Concurrency metadata is not persisted; a loaded table starts with clean locks and zeroed
//! version counters, which is indistinguishable from a freshly built one.
//!
//! Slots that are stale duplicates from an unfinished expansion are written out as empty, so a
//! loaded table is always fully cleaned: every entry is at one of its homes, exactly once.
//!
//! Dumping does not exclude writers beyond pinning the bucket array; dump a table that other
//! threads are mutating and you get a frankensnapshot. The item-count cross-check on load will
//! usually catch such a stream, but the real fix is to dump quiescent tables.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use slog::{Discard, Logger};
use std::io::{self, Read, Write};
use std::sync::atomic::AtomicUsize;

use map::CuckooMap;
use table::Table;
use {BUCKET_SLOTS, EMPTY_KEY};

quick_error! {
    /// A failure reading a dumped table back in.
    #[derive(Debug)]
    pub enum LoadError {
        /// The stream could not be read, or ended early.
        Io(err: io::Error) {
            from()
            display("read failed: {}", err)
        }
        /// The dumped hashpower is outside the representable range.
        BadHashpower(hashpower: u64) {
            display("hashpower {} out of range", hashpower)
        }
        /// The header's item count disagrees with the slots actually in the stream.
        ///
        /// Either the stream is corrupt, or it was dumped while writers were mutating the
        /// table.
        ItemMismatch {
            expected: u64,
            found: u64,
        } {
            display("header claims {} items, stream holds {}", expected, found)
        }
    }
}

/// Write one key/value word.
#[cfg(not(feature = "small-keys"))]
fn write_word<W: Write>(w: &mut W, word: u64) -> io::Result<()> {
    w.write_u64::<LittleEndian>(word)
}

/// Read one key/value word.
#[cfg(not(feature = "small-keys"))]
fn read_word<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_u64::<LittleEndian>()
}

/// Write one key/value word (32-bit configuration).
#[cfg(feature = "small-keys")]
fn write_word<W: Write>(w: &mut W, word: u32) -> io::Result<()> {
    w.write_u32::<LittleEndian>(word)
}

/// Read one key/value word (32-bit configuration).
#[cfg(feature = "small-keys")]
fn read_word<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<LittleEndian>()
}

impl CuckooMap {
    /// Dump the table to a byte stream.
    ///
    /// The table should be quiescent; see the module documentation.
    pub fn dump<W: Write>(&self, mut w: W) -> io::Result<()> {
        let table = self.table.read();

        w.write_u64::<LittleEndian>(table.hashpower() as u64)?;
        w.write_u64::<LittleEndian>(self.len() as u64)?;

        for i in 0..table.buckets() {
            for j in 0..BUCKET_SLOTS {
                let key = table.bucket(i).key(j);

                // Skip empty slots and every redundant doubling leftover, stale and twin
                // alike; the live copy is dumped from its real home. Otherwise the occupied
                // slots would outnumber the header's item count.
                let dead = key == EMPTY_KEY
                    || (table.is_expanding() && table.is_redundant(key, i));

                if dead {
                    write_word(&mut w, EMPTY_KEY)?;
                    write_word(&mut w, 0)?;
                } else {
                    write_word(&mut w, key)?;
                    write_word(&mut w, table.bucket(i).val(j))?;
                }
            }
        }

        Ok(())
    }

    /// Read a dumped table back from a byte stream.
    pub fn load<R: Read>(r: R) -> Result<CuckooMap, LoadError> {
        CuckooMap::load_with_logger(r, Logger::root(Discard, o!()))
    }

    /// Read a dumped table back from a byte stream, reporting through `log`.
    pub fn load_with_logger<R: Read>(mut r: R, log: Logger) -> Result<CuckooMap, LoadError> {
        let hashpower = r.read_u64::<LittleEndian>()?;
        if hashpower == 0 || hashpower >= 32 {
            return Err(LoadError::BadHashpower(hashpower));
        }

        let items = r.read_u64::<LittleEndian>()?;

        let table = Table::new(hashpower as usize);
        let mut found = 0;

        for i in 0..table.buckets() {
            for j in 0..BUCKET_SLOTS {
                let key = read_word(&mut r)?;
                let val = read_word(&mut r)?;

                if key != EMPTY_KEY {
                    table.bucket(i).put(j, key, val);
                    found += 1;
                }
            }
        }

        if found != items {
            return Err(LoadError::ItemMismatch {
                expected: items,
                found: found,
            });
        }

        Ok(CuckooMap {
            table: RwLock::new(table),
            items: AtomicUsize::new(found as usize),
            log: log,
        })
    }
}
