//! Bookkeeping for unreferenced nodes.
//!
//! Nodes whose reference count dropped to zero go through a two-stage LRU:
//! a fixed-size "hot" array absorbing recent transitions, and a cold queue
//! ordered oldest-first. When the hot array fills it is drained into the
//! cold queue. A check counter periodically asks whether reclaim should
//! run, so the cost of probing the resource level is amortized over many
//! transitions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::node::Vnode;

/// Memory-pressure report from the embedder's low-resource probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceLevel {
    /// No pressure; reclaim is a no-op.
    None,
    /// Mild pressure; reclaim a small fraction.
    Note,
    /// Serious pressure; reclaim aggressively.
    Warning,
    /// Critical pressure; reclaim everything reclaimable.
    Critical,
}

pub(crate) const MAX_UNUSED_NODES: usize = 8192;
const MAX_HOT_NODES: usize = 1024;
const CHECK_INTERVAL: u32 = 64;

pub(crate) struct UnusedNodes {
    /// Readers insert into hot slots; the writer drains the array.
    hot_lock: RwLock<()>,
    hot_slots: Box<[Mutex<Option<Arc<Vnode>>>]>,
    next_hot: AtomicUsize,
    /// Oldest-first queue of cold unused nodes. Innermost lock; taken with
    /// `hot_lock` held, never the other way around.
    cold: Mutex<VecDeque<Arc<Vnode>>>,
    check_count: AtomicU32,
    max_unused: usize,
}

impl UnusedNodes {
    pub(crate) fn new(max_unused: usize) -> UnusedNodes {
        UnusedNodes {
            hot_lock: RwLock::new(()),
            hot_slots: (0..MAX_HOT_NODES).map(|_| Mutex::new(None)).collect(),
            next_hot: AtomicUsize::new(0),
            cold: Mutex::new(VecDeque::new()),
            check_count: AtomicU32::new(0),
            max_unused,
        }
    }

    pub(crate) fn cold_len(&self) -> usize {
        self.cold.lock().len()
    }

    /// Called on a node's 1 -> 0 reference transition, with the node table
    /// read-locked and the node locked. Returns true when the caller should
    /// run a reclaim pass.
    pub(crate) fn node_unused(&self, node: &Arc<Vnode>, pressure: impl FnOnce() -> bool) -> bool {
        let guard = self.hot_lock.read();

        node.set_unused(true);

        let mut reclaim = false;
        let checks = self.check_count.fetch_add(1, Ordering::AcqRel);
        if checks == CHECK_INTERVAL {
            if self.cold_len() > self.max_unused && pressure() {
                // Too many idle nodes; have the caller free the oldest.
                reclaim = true;
            } else {
                self.check_count.store(0, Ordering::Release);
            }
        }

        if node.is_hot() {
            return reclaim;
        }

        let index = self.next_hot.fetch_add(1, Ordering::AcqRel);
        if index < MAX_HOT_NODES {
            node.set_hot(true);
            *self.hot_slots[index].lock() = Some(node.clone());
            return reclaim;
        }

        // The array is full and has to be drained first.
        drop(guard);
        let _guard = self.hot_lock.write();

        if self.next_hot.load(Ordering::Acquire) >= MAX_HOT_NODES {
            self.drain_hot_locked();
        }

        let index = self.next_hot.fetch_add(1, Ordering::AcqRel);
        node.set_hot(true);
        *self.hot_slots[index].lock() = Some(node.clone());

        reclaim
    }

    /// Called on a node's 0 -> 1 reference transition, same locking rules
    /// as [`UnusedNodes::node_unused`].
    pub(crate) fn node_used(&self, node: &Arc<Vnode>) {
        let _guard = self.hot_lock.read();

        if !node.is_unused() {
            return;
        }
        node.set_unused(false);

        if !node.is_hot() {
            self.remove_cold(node);
        }
    }

    /// Called when a node is about to be surrendered to its driver.
    pub(crate) fn node_to_be_freed(&self, node: &Arc<Vnode>) {
        let _guard = self.hot_lock.read();

        if node.is_hot() {
            let count = self.next_hot.load(Ordering::Acquire).min(MAX_HOT_NODES);
            for slot in &self.hot_slots[..count] {
                let mut slot = slot.lock();
                if slot
                    .as_ref()
                    .is_some_and(|candidate| Arc::ptr_eq(candidate, node))
                {
                    *slot = None;
                    break;
                }
            }
            node.set_hot(false);
        } else if node.is_unused() {
            self.remove_cold(node);
        }

        node.set_unused(false);
    }

    /// Drains the hot array into the cold queue.
    pub(crate) fn drain_hot(&self) {
        let _guard = self.hot_lock.write();
        self.drain_hot_locked();
    }

    fn drain_hot_locked(&self) {
        let mut cold = self.cold.lock();

        let count = self.next_hot.load(Ordering::Acquire).min(MAX_HOT_NODES);
        for slot in &self.hot_slots[..count] {
            let Some(node) = slot.lock().take() else {
                continue;
            };
            if node.is_hot() {
                if node.is_unused() {
                    cold.push_back(node.clone());
                }
                node.set_hot(false);
            }
        }

        drop(cold);
        self.next_hot.store(0, Ordering::Release);
    }

    /// The least recently used cold node, left in place.
    pub(crate) fn oldest(&self) -> Option<Arc<Vnode>> {
        let _guard = self.hot_lock.read();
        self.cold.lock().front().cloned()
    }

    fn remove_cold(&self, node: &Arc<Vnode>) {
        let mut cold = self.cold.lock();
        if let Some(position) = cold.iter().position(|candidate| Arc::ptr_eq(candidate, node)) {
            cold.remove(position);
        }
    }

    /// Suppresses nested reclaim triggers while a reclaim pass runs.
    pub(crate) fn check_started(&self) {
        self.check_count.store(CHECK_INTERVAL + 1, Ordering::Release);
    }

    pub(crate) fn check_done(&self) {
        self.check_count.store(0, Ordering::Release);
    }
}
