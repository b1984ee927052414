//! Fixed-bucket, chained, concurrent hash tables.
//!
//! This crate implements a concurrent hash table with a bucket count that is fixed at
//! construction. It is meant as a lookup substrate for protocol and session layers which index
//! live objects (open handles, pending requests, and the like) by a hash they have already
//! computed, so the table itself performs no hashing: the 32-bit hash **is** the key.
//!
//! # Hash-only keys
//!
//! The table never compares full keys, only their 32-bit hashes. Two inserts with the same hash
//! denote the same logical key, regardless of what the values are. It is the caller's
//! responsibility to guarantee that no two distinct logical keys ever share a 32-bit hash; if
//! that guarantee is broken, the table will treat them as one key. This is a deliberate
//! contract, not a shortcut, and it will not be "upgraded" to full key comparison.
//!
//! # Structure
//!
//! The table is an array of independent chains ("buckets"). An entry with hash `h` lives in
//! chain `h % bucket_count`, and each chain holds at most one entry per hash. The whole array is
//! guarded by a single reader-writer lock: lookups and iterator steps share it, while inserts
//! and removals take it exclusively. There is no per-bucket striping; one lock keeps structural
//! changes trivially correct, and the critical sections are short linear scans of a single
//! chain.
//!
//! The lock is not reentrant. Do not call back into the table from code running inside one of
//! its methods on the same thread.
//!
//! # Iteration
//!
//! Iteration is *live*: the lock is only held for the duration of a single cursor step, never
//! between steps, so other threads can freely mutate the table while an iteration is in
//! progress. The price is weak consistency. An iteration is a sequence of point-in-time
//! snapshots of "where to look next", not one consistent snapshot of the table: entries
//! inserted mid-iteration may or may not be observed depending on where they land relative to
//! the cursor, and entries removed mid-iteration are simply never yielded. The cursor also
//! supports removing the entry it most recently yielded, which is how a session layer evicts
//! entries while sweeping the table.

#[macro_use]
extern crate quick_error;
extern crate parking_lot;
#[cfg(test)]
extern crate rand;


use parking_lot::RwLock;
use std::sync::atomic::{self, AtomicUsize};

/// The atomic ordering used for the length counter.
const ORDERING: atomic::Ordering = atomic::Ordering::SeqCst;
/// The default number of buckets.
const DEFAULT_BUCKETS: usize = 32;

quick_error! {
    /// A table operation error.
    ///
    /// Every failure is reported synchronously to the caller and leaves the table unchanged;
    /// the table never logs, retries, or backs off.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum Error {
        /// An insertion was attempted with a hash which is already present.
        ///
        /// The caller decides if this is benign (an idempotent insert racing itself) or a real
        /// conflict.
        DuplicateKey {
            display("the hash is already present in the table")
        }
        /// A removal was attempted with a hash which is not present.
        NotFound {
            display("no entry with the given hash exists in the table")
        }
        /// A cursor removal was attempted with no entry selected.
        ///
        /// This happens when `remove_current` is called before the first `next`, after the
        /// cursor is exhausted, or twice without an intervening `next`.
        InvalidCursor {
            display("the cursor does not currently select an entry")
        }
    }
}

/// A stored entry.
///
/// The entry is owned by its chain; the chain's bucket index is always `hash % bucket_count`.
struct Entry<V> {
    /// The 32-bit hash the entry was inserted under.
    hash: u32,
    /// The stored value.
    value: V,
}

/// A fixed-bucket, chained, concurrent hash table.
///
/// Values are owned by the table and handed back by value on removal. Because lookups and
/// iterator steps release the lock before returning (see the crate docs), they return *clones*
/// of the stored value, so `V` is typically a cheap handle such as an `Arc`.
///
/// Dropping the table drops every entry still stored, chain heads included.
pub struct ChainTable<V> {
    /// The chains, guarded collectively by one reader-writer lock.
    ///
    /// The boxed slice length is the bucket count, immutable for the table's lifetime. The
    /// table never resizes or rehashes.
    chains: RwLock<Box<[Vec<Entry<V>>]>>,
    /// The number of entries in the table.
    len: AtomicUsize,
}

impl<V> ChainTable<V> {
    /// Create a table with `buckets` chains.
    ///
    /// The bucket count is fixed for the lifetime of the table. A small count merely lengthens
    /// the chains; correctness is unaffected.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is zero.
    pub fn with_buckets(buckets: usize) -> ChainTable<V> {
        assert!(buckets > 0, "a chained table needs at least one bucket");

        let mut vec = Vec::with_capacity(buckets);
        for _ in 0..buckets {
            vec.push(Vec::new());
        }

        ChainTable {
            chains: RwLock::new(vec.into_boxed_slice()),
            len: AtomicUsize::new(0),
        }
    }

    /// Create a table with the default bucket count.
    pub fn new() -> ChainTable<V> {
        ChainTable::with_buckets(DEFAULT_BUCKETS)
    }

    /// Get the fixed bucket count.
    pub fn buckets(&self) -> usize {
        self.chains.read().len()
    }

    /// Get the number of entries in the table.
    pub fn len(&self) -> usize {
        self.len.load(ORDERING)
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Does the table contain an entry with hash `hash`?
    pub fn contains(&self, hash: u32) -> bool {
        let chains = self.chains.read();
        chains[hash as usize % chains.len()]
            .iter()
            .any(|entry| entry.hash == hash)
    }

    /// Insert a value under `hash`.
    ///
    /// The entry is appended to the tail of its chain. The duplicate check and the append
    /// happen in one exclusive critical section, so two racing inserts of the same hash can
    /// never both succeed.
    ///
    /// On `Error::DuplicateKey` the table is unchanged and `value` is dropped; callers who
    /// need the rejected value back should pass a clonable handle.
    pub fn insert(&self, hash: u32, value: V) -> Result<(), Error> {
        let mut chains = self.chains.write();
        let len = chains.len();
        let chain = &mut chains[hash as usize % len];

        if chain.iter().any(|entry| entry.hash == hash) {
            return Err(Error::DuplicateKey);
        }

        chain.push(Entry {
            hash: hash,
            value: value,
        });
        self.len.fetch_add(1, ORDERING);

        Ok(())
    }

    /// Remove the entry with hash `hash`, returning its value.
    ///
    /// Fails with `Error::NotFound`, leaving the table unchanged, if no such entry exists.
    pub fn remove(&self, hash: u32) -> Result<V, Error> {
        let mut chains = self.chains.write();
        let len = chains.len();
        let chain = &mut chains[hash as usize % len];

        match chain.iter().position(|entry| entry.hash == hash) {
            Some(i) => {
                let entry = chain.remove(i);
                self.len.fetch_sub(1, ORDERING);
                Ok(entry.value)
            },
            None => Err(Error::NotFound),
        }
    }

    /// Begin an iteration over the table.
    ///
    /// The cursor starts ahead of the first bucket and yields a clone of every entry's value
    /// as it sweeps the chains in bucket order. See the crate docs for the consistency
    /// contract; a cursor is not restartable, begin a new one to re-scan.
    pub fn iter(&self) -> Cursor<V> {
        Cursor {
            table: self,
            bucket: 0,
            pos: 0,
            last: None,
        }
    }
}

impl<V: Clone> ChainTable<V> {
    /// Look up the value stored under `hash`.
    ///
    /// This takes the shared lock for the duration of the chain scan only; the returned clone
    /// outlives the critical section, so concurrent mutation after the return is harmless.
    pub fn get(&self, hash: u32) -> Option<V> {
        let chains = self.chains.read();
        chains[hash as usize % chains.len()]
            .iter()
            .find(|entry| entry.hash == hash)
            .map(|entry| entry.value.clone())
    }
}

impl<V> Default for ChainTable<V> {
    fn default() -> ChainTable<V> {
        ChainTable::new()
    }
}

impl<'a, V: Clone> IntoIterator for &'a ChainTable<V> {
    type Item = V;
    type IntoIter = Cursor<'a, V>;

    fn into_iter(self) -> Cursor<'a, V> {
        self.iter()
    }
}

/// A live cursor over a table.
///
/// The cursor is a pair of a bucket index and a position within that bucket's chain, denoting
/// the next entry to yield. It holds no lock between steps and no pointer into the chains, so
/// it can never dangle: each `next` call re-acquires the shared lock, reads whatever is at the
/// cursor position *now*, and advances. `bucket == bucket_count` is the exhausted state.
///
/// The cursor additionally remembers the entry it most recently yielded, which is the target of
/// [`remove_current`](#method.remove_current).
pub struct Cursor<'a, V: 'a> {
    /// The table being iterated.
    table: &'a ChainTable<V>,
    /// The bucket the cursor is in.
    bucket: usize,
    /// The position of the next entry to yield within the bucket's chain.
    pos: usize,
    /// The bucket and hash of the most recently yielded entry, if it is still removable.
    ///
    /// `None` both before the first `next` and after exhaustion, which makes `remove_current`
    /// fail in exactly the states where there is nothing sensible to remove.
    last: Option<(usize, u32)>,
}

impl<'a, V> Cursor<'a, V> {
    /// Remove the entry most recently yielded by `next`, returning its value.
    ///
    /// Note the tense: this removes the entry the cursor already *returned*, not the one it is
    /// about to return. The intended shape is `next`, inspect the value, then optionally
    /// `remove_current` before the next `next`. Removal does not disturb forward iteration,
    /// as the cursor advanced past the entry before yielding it.
    ///
    /// Fails with `Error::InvalidCursor` if no entry is selected (fresh cursor, exhausted
    /// cursor, or a repeated call without an intervening `next`). Fails with `Error::NotFound`
    /// if another thread removed the same entry in the meantime.
    pub fn remove_current(&mut self) -> Result<V, Error> {
        let (bucket, hash) = self.last.take().ok_or(Error::InvalidCursor)?;

        let mut chains = self.table.chains.write();
        let chain = &mut chains[bucket];

        match chain.iter().position(|entry| entry.hash == hash) {
            Some(i) => {
                // Unlinking an entry behind the cursor shifts the rest of the chain one step
                // towards the head, so the cursor follows it to avoid skipping an entry.
                if bucket == self.bucket && i < self.pos {
                    self.pos -= 1;
                }

                let entry = chain.remove(i);
                self.table.len.fetch_sub(1, ORDERING);
                Ok(entry.value)
            },
            None => Err(Error::NotFound),
        }
    }
}

impl<'a, V: Clone> Iterator for Cursor<'a, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let chains = self.table.chains.read();

        // Skip empty buckets (and exhausted tails of chains) until an entry turns up under the
        // cursor or the bucket array runs out.
        while self.bucket < chains.len() {
            match chains[self.bucket].get(self.pos) {
                Some(entry) => {
                    // Advance past the entry before yielding it, so removing it through
                    // `remove_current` cannot invalidate the iteration.
                    self.last = Some((self.bucket, entry.hash));
                    self.pos += 1;

                    return Some(entry.value.clone());
                },
                None => {
                    self.bucket += 1;
                    self.pos = 0;
                },
            }
        }

        // Exhausted. Clear the removal target so `remove_current` reports the state instead
        // of reaching for a stale entry.
        self.last = None;

        None
    }
}
