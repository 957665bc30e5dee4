//! The node table: registry and lifecycle of live nodes.
//!
//! All nodes are keyed by `(device, id)` in one hash table behind a
//! reader-writer lock. Creation and destruction are serialized per node by
//! the busy bit: a node under construction is inserted busy, and everyone
//! else either waits it out (bounded) or fails with `EBUSY`. The explicit
//! reference count drives the lifecycle; the `Arc`s held by the table, the
//! LRU and covering links are storage only.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::warn;
use parking_lot::RwLock;

use crate::errno::{Errno, Result};
use crate::fs::{LoadedNode, NodeOps, PublishFlags};
use crate::ids::{DeviceId, NodeId};
use crate::mount::Mount;
use crate::node::Vnode;
use crate::stat::FileType;
use crate::unused::ResourceLevel;
use crate::vfs::Vfs;

/// How often a `get` retries a busy node before giving up.
pub(crate) const BUSY_NODE_RETRIES: u32 = 2000;
/// Sleep between busy retries; together with the retry count this bounds
/// the wait at roughly ten seconds.
pub(crate) const BUSY_NODE_DELAY: Duration = Duration::from_millis(5);

type NodeKey = (DeviceId, NodeId);

/// Hash-indexed registry of all live nodes.
#[derive(Default)]
pub(crate) struct NodeTable {
    pub(crate) map: RwLock<HashMap<NodeKey, Arc<Vnode>>>,
}

impl NodeTable {
    /// Fast lookup; takes the table as a reader.
    pub(crate) fn lookup(&self, device: DeviceId, id: NodeId) -> Option<Arc<Vnode>> {
        self.map.read().get(&(device, id)).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }
}

/// Sleeps off one busy-wait round. Returns false once the retry budget is
/// exhausted.
fn retry_busy_node(tries: &mut u32, device: DeviceId, id: NodeId) -> bool {
    if *tries == 0 {
        warn!("node {device}:{id} is not becoming unbusy");
        return false;
    }
    *tries -= 1;
    std::thread::sleep(BUSY_NODE_DELAY);
    true
}

impl Vfs {
    /// Creates a busy node stub and inserts it, unless the identity already
    /// exists. Returns the node and whether this call created it.
    fn create_node_stub(&self, device: DeviceId, id: NodeId) -> Result<(Arc<Vnode>, bool)> {
        let mut map = self.nodes.map.write();
        if let Some(existing) = map.get(&(device, id)) {
            return Ok((existing.clone(), false));
        }

        let mount = self
            .mounts
            .get(device)
            .filter(|mount| !mount.is_unmounting())
            .ok_or(Errno::ENOENT)?;

        let node = Arc::new(Vnode::new(mount.clone(), device, id));
        map.insert((device, id), node.clone());
        mount.add_node(&node);
        drop(map);

        Ok((node, true))
    }

    /// Drops a node that never finished construction.
    fn discard_node_stub(&self, node: &Arc<Vnode>) {
        self.nodes.map.write().remove(&(node.device(), node.id()));
        node.mount().remove_node(node);
    }

    /// Acquires a reference to the node `(device, id)`, loading it through
    /// the owning mount's driver when absent.
    pub(crate) fn get_vnode(
        &self,
        device: DeviceId,
        id: NodeId,
        can_wait: bool,
        reenter: bool,
    ) -> Result<Arc<Vnode>> {
        let mut tries = BUSY_NODE_RETRIES;

        'restart: loop {
            let map = self.nodes.map.read();
            let node = map.get(&(device, id)).cloned();

            if let Some(ref node) = node {
                if !node.is_busy() {
                    // Try to take a reference without the node lock. Only
                    // valid while the count is positive; the 0 -> 1
                    // transition needs the lock for the LRU bookkeeping.
                    let count = node.ref_count.load(Ordering::SeqCst);
                    if count > 0
                        && node
                            .ref_count
                            .compare_exchange(count, count + 1, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                    {
                        return Ok(node.clone());
                    }
                }

                let guard = node.lock();
                if node.is_busy() {
                    // Nodes that are both removed and published will be gone
                    // momentarily; there is no point in waiting for them.
                    let vanishing = node.is_removed() && !node.is_unpublished();
                    drop(guard);
                    drop(map);

                    if !can_wait {
                        warn!("node {device}:{id} is busy");
                        return Err(Errno::EBUSY);
                    }
                    if vanishing {
                        return Err(Errno::ENOENT);
                    }
                    if !retry_busy_node(&mut tries, device, id) {
                        return Err(Errno::EBUSY);
                    }
                    continue 'restart;
                }

                let previous = node.ref_count.fetch_add(1, Ordering::SeqCst);
                debug_assert!(previous >= 0, "node {device}:{id} resurrected");
                if previous == 0 {
                    self.unused.node_used(node);
                }
                drop(guard);
                return Ok(node.clone());
            }

            drop(map);

            // Not present: create a stub and ask the driver to load it.
            let (node, created) = self.create_node_stub(device, id)?;
            if !created {
                continue 'restart;
            }

            let mount = node.mount().clone();
            match mount.volume().get_node(id, reenter) {
                Ok(loaded) => {
                    self.complete_loaded_node(&node, loaded);
                    return Ok(node);
                }
                Err(error) => {
                    self.discard_node_stub(&node);
                    return Err(error);
                }
            }
        }
    }

    /// Finishes a driver-loaded node: installs ops (wrapping special types)
    /// and clears the busy bit.
    fn complete_loaded_node(&self, node: &Arc<Vnode>, loaded: LoadedNode) {
        node.set_mode(loaded.mode);
        node.set_ops(self.wrap_special_ops(loaded.mode, loaded.ops, loaded.flags));
        if loaded.flags.contains(PublishFlags::REMOVED) {
            node.set_removed(true);
        }

        let guard = node.lock();
        node.set_busy(false);
        drop(guard);
    }

    /// Wraps FIFO nodes with the pipe engine unless the driver opted out.
    pub(crate) fn wrap_special_ops(
        &self,
        mode: u32,
        ops: Arc<dyn NodeOps>,
        flags: PublishFlags,
    ) -> Arc<dyn NodeOps> {
        if FileType::from_mode(mode) == Some(FileType::Fifo)
            && !flags.contains(PublishFlags::NO_SPECIAL_SUB_NODE)
        {
            crate::fifo::wrap_fifo_ops(ops)
        } else {
            ops
        }
    }

    /// Increments a node's reference count. The caller must already be
    /// holding either a reference or the node lock; on a 0 -> 1 transition
    /// under the node lock it must also call `unused.node_used`.
    pub(crate) fn inc_node_ref(&self, node: &Arc<Vnode>) -> i32 {
        let previous = node.ref_count.fetch_add(1, Ordering::SeqCst);
        debug_assert!(
            previous >= 0,
            "node {}:{} acquired while being freed",
            node.device(),
            node.id()
        );
        previous
    }

    /// Decrements a node's reference count. On the 1 -> 0 transition the
    /// node is either destroyed right away (removed, always-free, or on an
    /// unmounting volume) or parked on the unused LRU.
    ///
    /// Must not be called with the node table or mount table locked.
    pub(crate) fn dec_node_ref(&self, node: &Arc<Vnode>, always_free: bool, reenter: bool) {
        let map = self.nodes.map.read();
        let guard = node.lock();

        let previous = node.ref_count.fetch_sub(1, Ordering::SeqCst);
        assert!(
            previous > 0,
            "node {}:{} over-released",
            node.device(),
            node.id()
        );
        if previous != 1 {
            return;
        }

        if node.is_busy() {
            panic!("dec_node_ref: called on busy node {}:{}", node.device(), node.id());
        }

        let always_free = always_free || node.mount().is_unmounting();

        let mut free_node = false;
        let mut reclaim = false;
        if node.is_removed() || always_free {
            self.unused.node_to_be_freed(node);
            node.set_busy(true);
            free_node = true;
        } else {
            reclaim = self
                .unused
                .node_unused(node, || self.resource_level() != ResourceLevel::None);
        }

        drop(guard);
        drop(map);

        if free_node {
            self.free_vnode(node, reenter);
        } else if reclaim {
            self.free_unused_nodes(self.resource_level());
        }
    }

    /// Surrenders the node to its driver and removes every trace of it.
    /// The node must be busy with a reference count of zero.
    pub(crate) fn free_vnode(&self, node: &Arc<Vnode>, _reenter: bool) {
        debug_assert!(node.is_busy() && node.ref_count() == 0);
        debug_assert!(
            node.lock().advisory.is_none(),
            "node {}:{} freed with advisory locks",
            node.device(),
            node.id()
        );

        // Write back while the driver still knows the node; pointless when
        // the node is going away entirely.
        if !node.is_removed() {
            if let Some(ops) = node.current_ops() {
                let _ = ops.fsync(node, false);
            }
        }

        // Sentinel: nobody may take a new reference from here on.
        node.ref_count.store(-1, Ordering::SeqCst);

        if !node.is_unpublished() {
            let ops = node.ops();
            if node.is_removed() {
                ops.remove(node);
            } else {
                ops.put(node);
            }
        }

        self.nodes.map.write().remove(&(node.device(), node.id()));
        node.mount().remove_node(node);
    }

    /// Reclaims the oldest unused nodes according to the pressure level.
    pub(crate) fn free_unused_nodes(&self, level: ResourceLevel) {
        self.unused.check_started();
        if level == ResourceLevel::None {
            self.unused.check_done();
            return;
        }

        self.unused.drain_hot();

        let cold = self.unused.cold_len();
        let count = match level {
            ResourceLevel::None => 0,
            ResourceLevel::Note => cold / 100,
            ResourceLevel::Warning => cold / 10,
            ResourceLevel::Critical => cold,
        }
        .clamp(1, cold.max(1));

        for _ in 0..count {
            let Some(node) = self.unused.oldest() else {
                break;
            };

            {
                let _map = self.nodes.map.read();
                let guard = node.lock();

                // Only append happens at the tail, so if the node is no
                // longer the queue head it has been touched since; rather
                // leave it alone then.
                match self.unused.oldest() {
                    Some(head) if Arc::ptr_eq(&head, &node) => {}
                    _ => continue,
                }

                debug_assert!(!node.is_busy() && node.ref_count() == 0);
                self.inc_node_ref(&node);
                self.unused.node_used(&node);
                drop(guard);
            }

            self.dec_node_ref(&node, true, false);
        }

        self.unused.check_done();
    }

    // --- driver-facing registry API ---

    /// Reserves an unpublished node: it exists in the table (busy) but is
    /// invisible to lookups until published.
    ///
    /// Panics when the identity already exists unbusy; that is a driver
    /// contract violation.
    pub fn new_node_on(
        &self,
        device: DeviceId,
        id: NodeId,
        ops: Arc<dyn NodeOps>,
    ) -> Result<()> {
        let mut tries = BUSY_NODE_RETRIES;
        loop {
            let (node, created) = self.create_node_stub(device, id)?;
            if created {
                node.set_ops(ops);
                node.set_unpublished(true);
                return Ok(());
            }
            if node.is_busy() {
                if !retry_busy_node(&mut tries, device, id) {
                    return Err(Errno::EBUSY);
                }
                continue;
            }
            panic!("new_node_on: node {device}:{id} already exists");
        }
    }

    /// Publishes a node: registers a freshly created node, or completes a
    /// stub previously reserved with [`Vfs::new_node_on`].
    pub fn publish_node_on(
        &self,
        device: DeviceId,
        id: NodeId,
        ops: Arc<dyn NodeOps>,
        mode: u32,
        flags: PublishFlags,
    ) -> Result<()> {
        let mut tries = BUSY_NODE_RETRIES;
        let node = loop {
            let (node, created) = self.create_node_stub(device, id)?;
            if created {
                node.set_unpublished(true);
                break node;
            }
            let completing_stub = node.is_busy()
                && node.is_unpublished()
                && node
                    .current_ops()
                    .is_some_and(|current| Arc::ptr_eq(&current, &ops));
            if completing_stub {
                break node;
            }
            if node.is_busy() {
                if !retry_busy_node(&mut tries, device, id) {
                    return Err(Errno::EBUSY);
                }
                continue;
            }
            return Err(Errno::EINVAL);
        };

        node.set_mode(mode);
        node.set_ops(self.wrap_special_ops(mode, ops, flags));
        if flags.contains(PublishFlags::REMOVED) {
            node.set_removed(true);
        }

        // Give the upper layers of a stacked mount the chance to attach.
        let layers = node.mount().layers().to_vec();
        for layer in layers.iter().skip(1) {
            if let Err(error) = layer.create_sub_node(id, &node) {
                self.discard_node_stub(&node);
                return Err(error);
            }
        }

        let guard = node.lock();
        node.set_busy(false);
        node.set_unpublished(false);
        drop(guard);

        Ok(())
    }

    /// Marks the node removed; it is destroyed once the last reference is
    /// surrendered. Tearing down still-unpublished nodes happens here.
    pub fn remove_node(&self, device: DeviceId, id: NodeId) -> Result<()> {
        let map = self.nodes.map.read();
        let node = map.get(&(device, id)).cloned().ok_or(Errno::ENOENT)?;

        let guard = node.lock();
        if guard.covers.is_some() || guard.covered_by.upgrade().is_some() {
            // The node participates in a covering chain and is in use.
            return Err(Errno::EBUSY);
        }

        node.set_removed(true);
        let remove_unpublished = node.is_unpublished();
        if remove_unpublished {
            node.set_busy(true);
        }
        drop(guard);
        drop(map);

        if remove_unpublished {
            node.ref_count.fetch_sub(1, Ordering::SeqCst);
            self.free_vnode(&node, true);
        }
        Ok(())
    }

    /// Clears a node's removed mark.
    pub fn unremove_node(&self, device: DeviceId, id: NodeId) -> Result<()> {
        let node = self.nodes.lookup(device, id).ok_or(Errno::ENOENT)?;
        let guard = node.lock();
        node.set_removed(false);
        drop(guard);
        Ok(())
    }

    /// Whether the node is currently marked removed.
    pub fn node_removed(&self, device: DeviceId, id: NodeId) -> Result<bool> {
        let node = self.nodes.lookup(device, id).ok_or(Errno::EINVAL)?;
        Ok(node.is_removed())
    }

    /// Takes an additional reference to a node that must already be
    /// referenced.
    pub fn acquire_node(&self, device: DeviceId, id: NodeId) -> Result<()> {
        let map = self.nodes.map.read();
        let node = map.get(&(device, id)).cloned().ok_or(Errno::EINVAL)?;
        let previous = self.inc_node_ref(&node);
        assert!(
            previous > 0,
            "acquire_node: node {device}:{id} wasn't referenced"
        );
        Ok(())
    }

    /// Surrenders one reference taken via the driver API.
    pub fn put_node_by_id(&self, device: DeviceId, id: NodeId) -> Result<()> {
        let node = self.nodes.lookup(device, id).ok_or(Errno::EINVAL)?;
        self.dec_node_ref(&node, false, true);
        Ok(())
    }

    // --- covering links ---

    /// The bottom of the covering stack below `node`, with a reference, or
    /// `None` when the node covers nothing.
    pub(crate) fn get_covered_node(&self, node: &Arc<Vnode>) -> Option<Arc<Vnode>> {
        if !node.is_covering() {
            return None;
        }
        let _map = self.nodes.map.read();
        self.get_covered_node_locked(node)
    }

    /// As [`Vfs::get_covered_node`], with the node table already locked.
    pub(crate) fn get_covered_node_locked(&self, node: &Arc<Vnode>) -> Option<Arc<Vnode>> {
        let mut covered = node.lock().covers.clone()?;
        loop {
            let next = covered.lock().covers.clone();
            match next {
                Some(next) => covered = next,
                None => break,
            }
        }
        self.inc_node_ref(&covered);
        Some(covered)
    }

    /// The top of the covering stack above `node`, with a reference, or
    /// `None` when the node is not covered.
    pub(crate) fn get_covering_node(&self, node: &Arc<Vnode>) -> Option<Arc<Vnode>> {
        if !node.is_covered() {
            return None;
        }
        let _map = self.nodes.map.read();
        self.get_covering_node_locked(node)
    }

    /// As [`Vfs::get_covering_node`], with the node table already locked.
    pub(crate) fn get_covering_node_locked(&self, node: &Arc<Vnode>) -> Option<Arc<Vnode>> {
        let mut covering = node.lock().covered_by.upgrade()?;
        loop {
            let next = covering.lock().covered_by.upgrade();
            match next {
                Some(next) => covering = next,
                None => break,
            }
        }
        self.inc_node_ref(&covering);
        Some(covering)
    }

    /// Establishes `covering` (a mount root) over `covered`, taking the
    /// node table write lock. Both links carry a lifecycle reference.
    pub(crate) fn link_covering(
        &self,
        mount: &Arc<Mount>,
        covering: &Arc<Vnode>,
        covered: &Arc<Vnode>,
    ) -> Result<()> {
        let _map = self.nodes.map.write();

        if covered.is_covered() {
            // Someone else layered a mount here in the meantime.
            return Err(Errno::EBUSY);
        }

        {
            let mut guard = covering.lock();
            guard.covers = Some(covered.clone());
        }
        covering.set_covering(true);

        {
            let mut guard = covered.lock();
            guard.covered_by = Arc::downgrade(covering);
        }
        covered.set_covered(true);

        self.inc_node_ref(covering);
        *mount.covers.lock() = Some(covered.clone());
        Ok(())
    }
}
