//! Per-mount directory-entry cache.
//!
//! Maps `(directory id, name)` to a child node id, including negative
//! ("missing") entries. Approximate LRU comes from N generation arrays:
//! every hit moves the entry's slot into the current generation, and when
//! the current array fills the cache advances to the next generation and
//! batch-evicts the contents of the one after it, which keeps one empty
//! guard generation ahead of the write position. No per-entry reference
//! counting is needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::ids::NodeId;

const DEFAULT_GENERATION_COUNT: usize = 8;
const DEFAULT_ENTRIES_PER_GENERATION: usize = 1024;

/// `index` values outside `0..entries_per_generation`.
const ENTRY_NOT_IN_ARRAY: i32 = -1;
const ENTRY_REMOVED: i32 = -2;

struct Entry {
    dir: NodeId,
    name: Box<str>,
    node: AtomicI64,
    missing: AtomicBool,
    generation: AtomicI32,
    /// Three-state: `ENTRY_NOT_IN_ARRAY`, `ENTRY_REMOVED`, or a slot index.
    index: AtomicI32,
}

struct Generation {
    next_index: AtomicUsize,
    slots: Box<[Mutex<Option<Arc<Entry>>>]>,
}

impl Generation {
    fn new(size: usize) -> Generation {
        Generation {
            next_index: AtomicUsize::new(0),
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
        }
    }
}

/// Map of live entries: directory id to name to entry.
type EntryMap = HashMap<NodeId, HashMap<Box<str>, Arc<Entry>>>;

/// Positive-and-negative entry cache with generational eviction.
pub(crate) struct EntryCache {
    /// Guards the map; generation slots have their own short locks so hits
    /// only ever take this as a reader.
    map: RwLock<EntryMap>,
    current: AtomicUsize,
    generations: Box<[Generation]>,
    entries_per_generation: usize,
}

impl EntryCache {
    pub(crate) fn new() -> EntryCache {
        EntryCache::with_geometry(DEFAULT_GENERATION_COUNT, DEFAULT_ENTRIES_PER_GENERATION)
    }

    /// A cache with explicit geometry; generation count must be at least 2
    /// (one active, one guard).
    pub(crate) fn with_geometry(generations: usize, entries_per_generation: usize) -> EntryCache {
        assert!(generations >= 2 && entries_per_generation >= 1);
        EntryCache {
            map: RwLock::new(HashMap::new()),
            current: AtomicUsize::new(0),
            generations: (0..generations)
                .map(|_| Generation::new(entries_per_generation))
                .collect(),
            entries_per_generation,
        }
    }

    /// Inserts or refreshes the entry for `name` in directory `dir`.
    pub(crate) fn add(&self, dir: NodeId, name: &str, node: NodeId, missing: bool) {
        let map = self.map.upgradable_read();
        if let Some(existing) = map.get(&dir).and_then(|names| names.get(name)) {
            let existing = existing.clone();
            existing.node.store(node.0, Ordering::Release);
            existing.missing.store(missing, Ordering::Release);
            let map = RwLockUpgradableReadGuard::downgrade(map);
            self.promote(map, &existing, true);
            return;
        }

        let entry = Arc::new(Entry {
            dir,
            name: name.into(),
            node: AtomicI64::new(node.0),
            missing: AtomicBool::new(missing),
            generation: AtomicI32::new(-1),
            index: AtomicI32::new(ENTRY_NOT_IN_ARRAY),
        });

        let mut map = RwLockUpgradableReadGuard::upgrade(map);
        map.entry(dir)
            .or_default()
            .insert(entry.name.clone(), entry.clone());
        let map = parking_lot::RwLockWriteGuard::downgrade(map);
        self.promote(map, &entry, false);
    }

    /// Looks the entry up, promoting it to the current generation on a hit.
    /// Returns the cached child id and whether it is a negative entry.
    pub(crate) fn lookup(&self, dir: NodeId, name: &str) -> Option<(NodeId, bool)> {
        let map = self.map.read();
        let entry = map.get(&dir)?.get(name)?.clone();
        let node = NodeId(entry.node.load(Ordering::Acquire));
        let missing = entry.missing.load(Ordering::Acquire);
        self.promote(map, &entry, true);
        Some((node, missing))
    }

    /// Drops the entry for `name` in `dir`, if cached.
    pub(crate) fn remove(&self, dir: NodeId, name: &str) -> bool {
        let mut map = self.map.write();
        let Some(names) = map.get_mut(&dir) else {
            return false;
        };
        let Some(entry) = names.remove(name) else {
            return false;
        };
        if names.is_empty() {
            map.remove(&dir);
        }

        let index = entry.index.load(Ordering::Acquire);
        if index >= 0 {
            let generation = entry.generation.load(Ordering::Acquire) as usize;
            *self.generations[generation].slots[index as usize].lock() = None;
        } else {
            // A promoter still owns the slot transition; leave it a marker
            // so it won't re-enter the entry into a generation array.
            entry.index.store(ENTRY_REMOVED, Ordering::Release);
        }
        true
    }

    /// Drops every entry referring to directory `dir` itself.
    pub(crate) fn remove_dir(&self, dir: NodeId) {
        let mut map = self.map.write();
        if let Some(names) = map.remove(&dir) {
            for entry in names.values() {
                let index = entry.index.load(Ordering::Acquire);
                if index >= 0 {
                    let generation = entry.generation.load(Ordering::Acquire) as usize;
                    *self.generations[generation].slots[index as usize].lock() = None;
                } else {
                    entry.index.store(ENTRY_REMOVED, Ordering::Release);
                }
            }
        }
    }

    /// Moves `entry` into the current generation. `moved` is false only for
    /// a freshly inserted entry that was never in any array.
    fn promote(
        &self,
        map: parking_lot::RwLockReadGuard<'_, EntryMap>,
        entry: &Arc<Entry>,
        moved: bool,
    ) {
        let current = self.current.load(Ordering::Acquire) as i32;

        if moved {
            let old_generation = entry.generation.swap(current, Ordering::AcqRel);
            if old_generation == current {
                // Already in the current generation, or another thread is
                // moving it there right now.
                return;
            }
            let index = entry.index.swap(ENTRY_NOT_IN_ARRAY, Ordering::AcqRel);
            if index < 0 {
                return;
            }
            *self.generations[old_generation as usize].slots[index as usize].lock() = None;
        } else {
            entry.generation.store(current, Ordering::Release);
        }

        // Claim a slot in the current generation.
        let generation = &self.generations[current as usize];
        let index = generation.next_index.fetch_add(1, Ordering::AcqRel);
        if index < self.entries_per_generation {
            *generation.slots[index].lock() = Some(entry.clone());
            entry.index.store(index as i32, Ordering::Release);
            if index + 1 == self.entries_per_generation {
                // The array just filled up; rotate eagerly so the next
                // insert finds a fresh generation.
                drop(map);
                self.rotate(current as usize);
            }
            return;
        }

        // The array overflowed before the filling thread managed to rotate.
        drop(map);
        self.rotate(current as usize);
        let mut map = self.map.write();
        if entry.index.load(Ordering::Acquire) == ENTRY_REMOVED {
            // Removed in the meantime; the map no longer knows the entry.
            return;
        }
        let current = self.current.load(Ordering::Acquire) as i32;
        let generation = &self.generations[current as usize];
        let index = generation.next_index.fetch_add(1, Ordering::AcqRel);
        if index < self.entries_per_generation {
            *generation.slots[index].lock() = Some(entry.clone());
            entry.generation.store(current, Ordering::Release);
            entry.index.store(index as i32, Ordering::Release);
            return;
        }

        // Even the fresh generation is contended full; give up on caching
        // this entry rather than looping.
        if let Some(names) = map.get_mut(&entry.dir) {
            names.remove(&entry.name);
            if names.is_empty() {
                map.remove(&entry.dir);
            }
        }
    }

    /// Advances from `from` to the next generation and batch-evicts the one
    /// after it, keeping an empty guard generation ahead.
    fn rotate(&self, from: usize) {
        let mut evicted = Vec::new();
        {
            let mut map = self.map.write();
            if self.current.load(Ordering::Acquire) != from {
                // Someone else rotated while we waited for the lock.
                return;
            }
            let next = (from + 1) % self.generations.len();
            let guard = (next + 1) % self.generations.len();

            for slot in &self.generations[guard].slots {
                if let Some(entry) = slot.lock().take() {
                    entry.index.store(ENTRY_NOT_IN_ARRAY, Ordering::Release);
                    if let Some(names) = map.get_mut(&entry.dir) {
                        names.remove(&entry.name);
                        if names.is_empty() {
                            map.remove(&entry.dir);
                        }
                    }
                    evicted.push(entry);
                }
            }
            self.generations[guard].next_index.store(0, Ordering::Release);
            self.current.store(next, Ordering::Release);
        }
        // The evicted batch is dropped outside the lock; it can be large.
        drop(evicted);
    }
}

impl Default for EntryCache {
    fn default() -> Self {
        EntryCache::new()
    }
}
