//! Concurrent map with one reader-writer lock per entry.
//!
//! A single map-wide lock would serialise every transaction against every
//! other.  [`LockedMap`] instead locks at two levels:
//! - a coarse mutex protects only the hash-table skeleton (insert, lookup);
//! - each entry owns an independent reader-writer lock protecting its value.
//!
//! No thread ever holds the map mutex while acquiring an entry lock, so an
//! insert never waits behind a long-running transfer, and operations on
//! different entries proceed in parallel.
//!
//! # Writer preference
//!
//! The entry lock is hand-rolled (mutex + condvar + counters) rather than a
//! `std::sync::RwLock` because it must prefer writers: a reader waits while
//! a writer is active **or merely waiting**, and a writer announces itself
//! in `waiting_writers` before blocking.  A continuous stream of readers
//! against a hot entry can therefore never starve a writer.
//!
//! # Two-entry atomicity
//!
//! [`LockedMap::atomic_pair`] write-locks two entries and runs a closure
//! with exclusive access to both values.  Entries live behind `Arc` and are
//! never moved or removed, so their allocation addresses form a stable total
//! order; both locks are always acquired in address order and released in
//! reverse.  Any two threads operating on the same pair agree on the order,
//! which rules out AB–BA cycles.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Reader-writer lock state for one entry.
#[derive(Debug, Default)]
struct LockState {
    /// Threads currently holding the read lock.
    active_readers: u32,
    /// A thread holds the write lock (exclusive, at most one).
    writer_active: bool,
    /// Threads blocked in `lock_write`; readers yield to them.
    waiting_writers: u32,
}

/// One map entry: a value plus its private reader-writer lock.
///
/// The value sits in an `UnsafeCell` because the protecting lock is the
/// protocol above, not a wrapper type the compiler knows about.  All access
/// goes through [`ReadGuard`] / [`WriteGuard`], which hold the lock for
/// their lifetime.
struct Entry<V> {
    sync: Mutex<LockState>,
    cond: Condvar,
    value: UnsafeCell<V>,
}

// Entry hands out &V only under the read lock and &mut V only under the
// write lock, which is exactly the contract RwLock<V> promises.
unsafe impl<V: Send> Send for Entry<V> {}
unsafe impl<V: Send + Sync> Sync for Entry<V> {}

impl<V> Entry<V> {
    fn new(value: V) -> Self {
        Self {
            sync: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Shared acquire: wait out active and waiting writers.
    fn read_guard(&self) -> ReadGuard<'_, V> {
        let mut state = self.sync.lock().unwrap();
        while state.writer_active || state.waiting_writers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.active_readers += 1;
        ReadGuard { entry: self }
    }

    /// Exclusive acquire: register as waiting first, which blocks new
    /// readers, then wait until the entry is idle.
    fn write_guard(&self) -> WriteGuard<'_, V> {
        let mut state = self.sync.lock().unwrap();
        state.waiting_writers += 1;
        while state.writer_active || state.active_readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.waiting_writers -= 1;
        state.writer_active = true;
        WriteGuard { entry: self }
    }
}

/// Shared access to an entry's value; releases the read lock on drop.
struct ReadGuard<'a, V> {
    entry: &'a Entry<V>,
}

impl<V> Deref for ReadGuard<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        // Safety: the read lock is held for the guard's lifetime, so no
        // writer can be active.
        unsafe { &*self.entry.value.get() }
    }
}

impl<V> Drop for ReadGuard<'_, V> {
    fn drop(&mut self) {
        let mut state = self.entry.sync.lock().unwrap();
        state.active_readers -= 1;
        if state.active_readers == 0 {
            self.entry.cond.notify_all();
        }
    }
}

/// Exclusive access to an entry's value; releases the write lock on drop.
struct WriteGuard<'a, V> {
    entry: &'a Entry<V>,
}

impl<V> Deref for WriteGuard<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        // Safety: the write lock is held for the guard's lifetime.
        unsafe { &*self.entry.value.get() }
    }
}

impl<V> DerefMut for WriteGuard<'_, V> {
    fn deref_mut(&mut self) -> &mut V {
        // Safety: the write lock is exclusive for the guard's lifetime.
        unsafe { &mut *self.entry.value.get() }
    }
}

impl<V> Drop for WriteGuard<'_, V> {
    fn drop(&mut self) {
        let mut state = self.entry.sync.lock().unwrap();
        state.writer_active = false;
        self.entry.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// LockedMap
// ---------------------------------------------------------------------------

/// Thread-safe map with per-entry reader-writer locks.
///
/// Entries are created by [`insert`](LockedMap::insert) and never removed;
/// the stored `Arc` keeps each entry at a stable address for the lifetime of
/// the map.
pub struct LockedMap<K, V> {
    entries: Mutex<HashMap<K, Arc<Entry<V>>>>,
}

impl<K: Eq + Hash, V> LockedMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `value` under `key` if the key is not already present.
    ///
    /// Returns `true` iff the key was new.  An existing entry is left
    /// untouched, so repeated inserts are idempotent.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut map = self.entries.lock().unwrap();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, Arc::new(Entry::new(value)));
        true
    }

    /// Structural existence check.  Advisory only: the answer can go stale
    /// the moment the map mutex is released.
    pub fn exists(&self, key: &K) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out the value under the entry's read lock.
    pub fn read(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let entry = self.entry(key)?;
        let guard = entry.read_guard();
        Some((*guard).clone())
    }

    /// Replace the value under the entry's write lock.
    ///
    /// Returns `false` if the key is absent; `write` never creates entries.
    pub fn write(&self, key: &K, value: V) -> bool {
        self.update(key, move |slot| *slot = value).is_some()
    }

    /// Read-modify-write under the entry's write lock.
    ///
    /// The closure runs while the lock is held, so a check and a dependent
    /// mutation observed together stay atomic with respect to every other
    /// writer on the same entry.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let entry = self.entry(key)?;
        let mut guard = entry.write_guard();
        Some(f(&mut guard))
    }

    /// Run `f` with exclusive access to the values of two distinct keys.
    ///
    /// Both write locks are held while `f` runs; they are acquired in entry
    /// address order and released in reverse, so concurrent pair operations
    /// on overlapping keys cannot deadlock.
    ///
    /// Returns `None` if either key is absent, or if `k1 == k2` — two
    /// exclusive references cannot alias one value, so same-key mutations
    /// go through [`update`](LockedMap::update) instead.
    pub fn atomic_pair<R>(&self, k1: &K, k2: &K, f: impl FnOnce(&mut V, &mut V) -> R) -> Option<R> {
        if k1 == k2 {
            return None;
        }

        // Look up both entries, then release the map mutex before touching
        // any entry lock.
        let (e1, e2) = {
            let map = self.entries.lock().unwrap();
            (map.get(k1)?.clone(), map.get(k2)?.clone())
        };

        // Distinct keys map to distinct allocations; lock in address order.
        let (first, second) = if Arc::as_ptr(&e1) < Arc::as_ptr(&e2) {
            (&e1, &e2)
        } else {
            (&e2, &e1)
        };
        let outer = first.write_guard();
        let inner = second.write_guard();

        // Safety: both write locks are held and the entries are distinct,
        // so the two exclusive references cannot alias.
        let result = unsafe { f(&mut *e1.value.get(), &mut *e2.value.get()) };

        // Release in reverse acquisition order.
        drop(inner);
        drop(outer);
        Some(result)
    }

    /// Fetch the entry handle for `key` under the map mutex.
    fn entry(&self, key: &K) -> Option<Arc<Entry<V>>> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

impl<K: Eq + Hash, V> Default for LockedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
