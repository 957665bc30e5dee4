//! The core context: global tables, bootstrap, mount operations and the
//! user-visible entry points.
//!
//! A [`Vfs`] value owns what a kernel would keep in globals: the node
//! table, the mount table, the driver registry, the unused-node LRU and
//! the monitor service. All entry points take the caller's [`IoContext`]
//! explicitly. Mount and unmount are serialized by one reentrant lock;
//! everything else relies on the finer-grained locks of the individual
//! components.

use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, ReentrantMutex};

use crate::advisory::{self, FileLock, LockOwner};
use crate::context::{DEFAULT_FD_TABLE_SIZE, IoContext};
use crate::entry_cache::EntryCache;
use crate::errno::{Errno, Result};
use crate::fd::{Descriptor, Whence};
use crate::fs::{
    BoxedCookie, FileSystem, LoadedNode, MountContext, NodeOps, PublishFlags, Volume,
};
use crate::ids::{DeviceId, NodeId, TeamId};
use crate::mount::{
    FileSystemRegistry, Mount, MountFlags, MountTable, UnmountFlags, layer_names,
};
use crate::monitor::{AttrCause, NodeMonitorService};
use crate::node::Vnode;
use crate::node_table::NodeTable;
use crate::open_flags::OpenFlags;
use crate::resolver::LeafHint;
use crate::stat::{DirEntry, FileType, FsInfo, NodeStat, StatFields};
use crate::unused::{MAX_UNUSED_NODES, ResourceLevel, UnusedNodes};

/// Tunables for a [`Vfs`] instance.
pub struct VfsOptions {
    /// Size of freshly created descriptor tables.
    pub fd_table_size: usize,
    /// Soft ceiling on unused nodes kept around.
    pub max_unused_nodes: usize,
    /// Probe reporting the current memory-pressure level; the default
    /// reports no pressure, which disables background reclaim.
    pub low_resource: Box<dyn Fn() -> ResourceLevel + Send + Sync>,
}

impl Default for VfsOptions {
    fn default() -> VfsOptions {
        VfsOptions {
            fd_table_size: DEFAULT_FD_TABLE_SIZE,
            max_unused_nodes: MAX_UNUSED_NODES,
            low_resource: Box::new(|| ResourceLevel::None),
        }
    }
}

/// The virtual file system core.
pub struct Vfs {
    pub(crate) nodes: NodeTable,
    pub(crate) mounts: MountTable,
    pub(crate) filesystems: FileSystemRegistry,
    pub(crate) unused: UnusedNodes,
    pub(crate) monitors: NodeMonitorService,
    /// Serializes mount and unmount; reentrant because filesystem hooks
    /// may call back into mount entry points while initializing.
    mount_op_lock: ReentrantMutex<()>,
    root: Mutex<Option<Arc<Vnode>>>,
    contexts: Mutex<Vec<Weak<IoContext>>>,
    next_mount_id: AtomicI32,
    next_pipe_id: AtomicI64,
    pipe_device: DeviceId,
    fd_table_size: usize,
    low_resource: Box<dyn Fn() -> ResourceLevel + Send + Sync>,
}

impl Vfs {
    /// Creates a core with default options.
    pub fn new() -> Arc<Vfs> {
        Vfs::with_options(VfsOptions::default())
    }

    /// Creates a core with explicit options.
    pub fn with_options(options: VfsOptions) -> Arc<Vfs> {
        let vfs = Arc::new(Vfs {
            nodes: NodeTable::default(),
            mounts: MountTable::default(),
            filesystems: FileSystemRegistry::default(),
            unused: UnusedNodes::new(options.max_unused_nodes),
            monitors: NodeMonitorService::default(),
            mount_op_lock: ReentrantMutex::new(()),
            root: Mutex::new(None),
            contexts: Mutex::new(Vec::new()),
            next_mount_id: AtomicI32::new(1),
            next_pipe_id: AtomicI64::new(1),
            pipe_device: DeviceId(0),
            fd_table_size: options.fd_table_size,
            low_resource: options.low_resource,
        });

        // The internal mount anonymous pipes live on. It is never covered
        // and cannot be unmounted.
        let pipe_mount = Arc::new(Mount::new(
            vfs.pipe_device,
            "pipefs",
            None,
            MountFlags::empty(),
            false,
            EntryCache::new(),
        ));
        pipe_mount.set_layers(vec![Arc::new(PipeVolume) as Arc<dyn Volume>]);
        vfs.mounts.insert(pipe_mount);

        vfs
    }

    /// The node-event notification service.
    pub fn monitors(&self) -> &NodeMonitorService {
        &self.monitors
    }

    pub(crate) fn resource_level(&self) -> ResourceLevel {
        (self.low_resource)()
    }

    pub(crate) fn global_root(&self) -> Option<Arc<Vnode>> {
        self.root.lock().clone()
    }

    /// Registers a filesystem driver under its name.
    pub fn register_file_system(&self, driver: Arc<dyn FileSystem>) -> Result<()> {
        self.filesystems.register(driver)
    }

    /// Unregisters a filesystem driver.
    pub fn unregister_file_system(&self, name: &str) -> Result<()> {
        self.filesystems.unregister(name)
    }

    /// Looks a mount up by device id.
    pub fn mount_for(&self, device: DeviceId) -> Result<Arc<Mount>> {
        self.mounts.get(device).ok_or(Errno::ENOENT)
    }

    /// Acquires a reference to the node `(device, id)`, loading it from
    /// its driver when absent. The guard releases the reference on drop.
    pub fn get_node(&self, device: DeviceId, id: NodeId) -> Result<NodeGuard<'_>> {
        let node = self.get_vnode(device, id, true, false)?;
        Ok(NodeGuard {
            vfs: self,
            node: Some(node),
        })
    }

    // --- I/O contexts ---

    /// Creates a context, inheriting root, working directory and the
    /// non-close-on-fork descriptors from `parent` (fork semantics).
    pub fn new_io_context(self: &Arc<Vfs>, parent: Option<&Arc<IoContext>>) -> Arc<IoContext> {
        let team = parent.map(|parent| parent.team()).unwrap_or_else(|| {
            TeamId(std::process::id() as i32)
        });
        self.new_io_context_for_team(parent, team)
    }

    /// As [`Vfs::new_io_context`], but places the context in `team`.
    pub fn new_io_context_for_team(
        self: &Arc<Vfs>,
        parent: Option<&Arc<IoContext>>,
        team: TeamId,
    ) -> Arc<IoContext> {
        let context = Arc::new(IoContext::new(team, self.fd_table_size));

        if let Some(parent) = parent {
            if let Some(root) = parent.root.lock().clone() {
                self.inc_node_ref(&root);
                *context.root.lock() = Some(root);
            }
            if let Some(cwd) = parent.cwd.lock().clone() {
                self.inc_node_ref(&cwd);
                *context.cwd.lock() = Some(cwd);
            }

            let parent_table = parent.table.read();
            let mut table = context.table.write();
            if table.size() < parent_table.size() {
                table.resize(parent_table.size());
            }
            for index in 0..parent_table.size() {
                let Some(descriptor) = parent_table.fds[index].as_ref() else {
                    continue;
                };
                if parent_table.close_on_fork(index) {
                    continue;
                }
                crate::fd::dup_descriptor_into_slot(descriptor, &mut table, index);
                table.set_close_on_exec(index, parent_table.close_on_exec(index));
            }
        } else if let Some(root) = self.global_root() {
            self.inc_node_ref(&root);
            *context.root.lock() = Some(root.clone());
            self.inc_node_ref(&root);
            *context.cwd.lock() = Some(root);
        }

        self.contexts.lock().push(Arc::downgrade(&context));
        context
    }

    /// Tears a context down: closes every descriptor, releases root and
    /// working directory, and drops its monitor subscriptions.
    pub fn exit_io_context(&self, context: &Arc<IoContext>) {
        let size = context.table.read().size();
        for index in 0..size {
            if let Some(descriptor) = self.remove_fd(context, index as i32) {
                self.close_fd(context, &descriptor);
                self.put_fd(&descriptor);
            }
        }

        if let Some(root) = context.root.lock().take() {
            self.dec_node_ref(&root, false, false);
        }
        if let Some(cwd) = context.cwd.lock().take() {
            self.dec_node_ref(&cwd, false, false);
        }

        self.monitors.remove_context_listeners(context.id());
        self.contexts
            .lock()
            .retain(|candidate| match candidate.upgrade() {
                Some(live) => !Arc::ptr_eq(&live, context),
                None => false,
            });
    }

    fn live_contexts(&self) -> Vec<Arc<IoContext>> {
        let mut contexts = self.contexts.lock();
        contexts.retain(|candidate| candidate.upgrade().is_some());
        contexts.iter().filter_map(Weak::upgrade).collect()
    }

    // --- mounting ---

    /// Mounts the filesystem `fs_name` (possibly a colon-separated layer
    /// stack) at `path`. The very first mount must be at `/`.
    pub fn mount(
        self: &Arc<Vfs>,
        context: &IoContext,
        path: &str,
        device: Option<&str>,
        fs_name: &str,
        flags: MountFlags,
        args: Option<&str>,
    ) -> Result<DeviceId> {
        let _op = self.mount_op_lock.lock();

        let names = layer_names(fs_name)?;
        let mut drivers = Vec::with_capacity(names.len());
        for name in &names {
            drivers.push(self.filesystems.get(name)?);
        }

        // Resolve the mount point up front; the root mount has none.
        let covered = if self.global_root().is_some() {
            let outcome = self.path_to_node(context, path, true, None)?;
            let covered = outcome.node;
            if !covered.is_directory() {
                self.dec_node_ref(&covered, false, false);
                return Err(Errno::ENOTDIR);
            }
            if covered.is_covered() {
                self.dec_node_ref(&covered, false, false);
                return Err(Errno::EBUSY);
            }
            Some(covered)
        } else {
            if path != "/" {
                return Err(Errno::EINVAL);
            }
            None
        };

        let id = DeviceId(self.next_mount_id.fetch_add(1, Ordering::AcqRel));
        let mount = Arc::new(Mount::new(
            id,
            fs_name,
            device,
            flags,
            device.is_some(),
            EntryCache::new(),
        ));
        self.mounts.insert(mount.clone());

        let fail = |covered: &Option<Arc<Vnode>>, mounted: &[Arc<dyn Volume>], error: Errno| {
            for volume in mounted.iter().rev() {
                volume.unmount();
            }
            self.mounts.remove(id);
            if let Some(covered) = covered {
                self.dec_node_ref(covered, false, false);
            }
            Err(error)
        };

        // Bring the layer stack up, bottom layer first.
        let mut volumes: Vec<Arc<dyn Volume>> = Vec::with_capacity(drivers.len());
        let mut root_id = None;
        for (layer, driver) in drivers.iter().enumerate() {
            let mount_context = MountContext {
                vfs: self,
                device: id,
                layer: layer as u32,
            };
            match driver.mount(&mount_context, device, args) {
                Ok(mounted) => {
                    root_id = Some(mounted.root);
                    volumes.push(mounted.volume);
                }
                Err(error) => return fail(&covered, &volumes, error),
            }
        }
        let root_id = root_id.expect("layer stack cannot be empty");
        mount.set_layers(volumes);
        for volume in mount.layers() {
            volume.all_layers_mounted();
        }

        // The driver has published its root; it must own exactly the one
        // reference publishing left behind.
        let Some(root) = self.nodes.lookup(id, root_id) else {
            panic!("mount: file system did not publish its root node");
        };
        if root.ref_count() != 1 {
            panic!("mount: file system does not own its root node");
        }
        *mount.root.lock() = Some(root.clone());

        match covered {
            Some(ref covered_node) => {
                if let Err(error) = self.link_covering(&mount, &root, covered_node) {
                    *mount.root.lock() = None;
                    return fail(&covered, mount.layers(), error);
                }
            }
            None => {
                self.inc_node_ref(&root);
                *self.root.lock() = Some(root.clone());

                // Give every rootless context the new root as root and cwd.
                for context in self.live_contexts() {
                    if context.root.lock().is_none() {
                        self.inc_node_ref(&root);
                        *context.root.lock() = Some(root.clone());
                    }
                    if context.cwd.lock().is_none() {
                        self.inc_node_ref(&root);
                        *context.cwd.lock() = Some(root.clone());
                    }
                }
            }
        }

        debug!("mounted {fs_name} as {id} at {path}");
        self.monitors.notify_mount(
            id,
            mount.covers.lock().as_ref().map(|node| node.device()),
            mount.covers.lock().as_ref().map(|node| node.id()),
        );
        Ok(id)
    }

    /// Unmounts the volume whose root sits at `path`.
    pub fn unmount(&self, context: &IoContext, path: &str, flags: UnmountFlags) -> Result<()> {
        let outcome = self.path_to_node(context, path, true, None)?;
        let node = outcome.node;
        let device = node.device();
        let is_root_of_mount = node
            .mount()
            .root_node()
            .is_some_and(|root| Arc::ptr_eq(&root, &node));
        self.dec_node_ref(&node, false, false);

        if !is_root_of_mount {
            return Err(Errno::EINVAL);
        }
        self.unmount_device(device, flags)
    }

    /// Unmounts the volume with the given device id.
    pub fn unmount_device(&self, device: DeviceId, flags: UnmountFlags) -> Result<()> {
        let _op = self.mount_op_lock.lock();

        if device == self.pipe_device {
            return Err(Errno::EINVAL);
        }
        let mount = self.mounts.get(device).ok_or(Errno::ENOENT)?;
        let root = mount.root_node().ok_or(Errno::EINVAL)?;
        let is_global_root = self
            .global_root()
            .is_some_and(|global| Arc::ptr_eq(&global, &root));
        if is_global_root {
            return Err(Errno::EBUSY);
        }

        // Wait until nothing but the structural references remain.
        let mut disconnected = false;
        loop {
            let busy = {
                let _map = self.nodes.map.write();
                mount.live_nodes().iter().any(|node| {
                    if node.is_busy() {
                        return true;
                    }
                    let guard = node.lock();
                    let mut refs = node.ref_count();
                    if guard.covers.is_some() {
                        refs -= 1;
                    }
                    if guard.covered_by.upgrade().is_some() {
                        refs -= 1;
                    }
                    if Arc::ptr_eq(node, &root) {
                        refs -= 1;
                    }
                    if refs != 0 {
                        warn!(
                            "unmount {device}: node {} still referenced ({refs})",
                            node.id()
                        );
                    }
                    refs != 0
                })
            };

            if !busy {
                break;
            }
            if !flags.contains(UnmountFlags::FORCE) {
                return Err(Errno::EBUSY);
            }
            if disconnected {
                // Give the last accesses a moment to drain, then retry.
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            mount.unmounting.store(true, Ordering::Release);
            self.disconnect_mount_descriptors(&mount);
            disconnected = true;
        }

        mount.unmounting.store(true, Ordering::Release);

        // Undo covering links and strip the structural references.
        let mut external_refs: Vec<Arc<Vnode>> = Vec::new();
        {
            let _map = self.nodes.map.write();
            for node in mount.live_nodes() {
                let mut guard = node.lock();

                if let Some(covered) = guard.covers.take() {
                    // This node is the mount's root, layered over a
                    // directory elsewhere.
                    node.set_covering(false);
                    node.ref_count.fetch_sub(1, Ordering::SeqCst);

                    let mut covered_guard = covered.lock();
                    covered_guard.covered_by = Weak::new();
                    drop(covered_guard);
                    covered.set_covered(false);

                    if Arc::ptr_eq(covered.mount(), &mount) {
                        covered.ref_count.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        external_refs.push(covered);
                    }
                }

                if let Some(covering) = guard.covered_by.upgrade() {
                    // An external mount's root is layered over this node.
                    guard.covered_by = Weak::new();
                    node.set_covered(false);
                    node.ref_count.fetch_sub(1, Ordering::SeqCst);

                    let mut covering_guard = covering.lock();
                    covering_guard.covers = None;
                    drop(covering_guard);
                    covering.set_covering(false);
                }

                drop(guard);

                if !Arc::ptr_eq(&node, &root) {
                    node.set_busy(true);
                    self.unused.node_to_be_freed(&node);
                }
            }
        }

        for covered in external_refs {
            self.dec_node_ref(&covered, false, false);
        }

        // Free every node; the root goes last, surrendering the reference
        // the filesystem held on it.
        for node in mount.live_nodes() {
            if Arc::ptr_eq(&node, &root) {
                continue;
            }
            node.ref_count.store(0, Ordering::SeqCst);
            self.free_vnode(&node, false);
        }

        *mount.root.lock() = None;
        *mount.covers.lock() = None;
        {
            let _map = self.nodes.map.read();
            let guard = root.lock();
            root.set_busy(true);
            self.unused.node_to_be_freed(&root);
            drop(guard);
        }
        root.ref_count.store(0, Ordering::SeqCst);
        self.free_vnode(&root, false);

        self.mounts.remove(device);
        for volume in mount.layers().iter().rev() {
            volume.unmount();
        }

        debug!("unmounted {device}");
        self.monitors.notify_unmount(device);
        Ok(())
    }

    /// Disconnects every descriptor of every context that references the
    /// mount, and reroutes roots and working directories off it.
    fn disconnect_mount_descriptors(&self, mount: &Arc<Mount>) {
        for context in self.live_contexts() {
            self.replace_context_node(mount, &context.root);
            self.replace_context_node(mount, &context.cwd);

            let descriptors: Vec<Arc<Descriptor>> = {
                let table = context.table.read();
                table
                    .fds
                    .iter()
                    .flatten()
                    .filter(|descriptor| !descriptor.is_disconnected())
                    .filter(|descriptor| {
                        let on_mount = descriptor
                            .node()
                            .is_some_and(|node| Arc::ptr_eq(node.mount(), mount));
                        let mount_fd = descriptor
                            .mount
                            .as_ref()
                            .is_some_and(|held| Arc::ptr_eq(held, mount));
                        on_mount || mount_fd
                    })
                    .cloned()
                    .collect()
            };

            for descriptor in descriptors {
                crate::fd::acquire_descriptor(&descriptor);
                descriptor.disconnect();
                self.put_fd(&descriptor);
            }
        }
    }

    /// Replaces a context's root/cwd slot when it lives on `mount`,
    /// falling back to the covered node or the global root.
    fn replace_context_node(&self, mount: &Arc<Mount>, slot: &Mutex<Option<Arc<Vnode>>>) {
        let mut slot = slot.lock();
        let Some(current) = slot.clone() else {
            return;
        };
        if !Arc::ptr_eq(current.mount(), mount) {
            return;
        }

        let replacement = current
            .lock()
            .covers
            .clone()
            .or_else(|| self.global_root());
        if let Some(replacement) = replacement {
            self.inc_node_ref(&replacement);
            *slot = Some(replacement);
        } else {
            *slot = None;
        }
        self.dec_node_ref(&current, false, false);
    }

    /// Writes back every node of the volume, then the volume itself.
    pub fn sync_volume(&self, device: DeviceId) -> Result<()> {
        let mount = self.mounts.get(device).ok_or(Errno::ENOENT)?;
        for node in mount.live_nodes() {
            if node.is_busy() || node.is_removed() || !node.has_ops() {
                continue;
            }
            if let Err(error) = node.ops().fsync(&node, false) {
                warn!("sync {device}: node {} fsync failed: {error}", node.id());
            }
        }
        for volume in mount.layers() {
            volume.sync()?;
        }
        Ok(())
    }

    /// Syncs every mounted volume.
    pub fn sync_all(&self) -> Result<()> {
        for mount in self.mounts.all() {
            if mount.device() == self.pipe_device {
                continue;
            }
            let _ = self.sync_volume(mount.device());
        }
        Ok(())
    }

    /// Volume-wide information of the mounted volume.
    pub fn read_fs_info(&self, device: DeviceId) -> Result<FsInfo> {
        let mount = self.mounts.get(device).ok_or(Errno::ENOENT)?;
        mount.volume().read_fs_info()
    }

    // --- entry cache driver API ---

    /// Adds a (positive or negative) entry to the mount's entry cache.
    pub fn entry_cache_add(
        &self,
        device: DeviceId,
        directory: NodeId,
        name: &str,
        node: NodeId,
        missing: bool,
    ) -> Result<()> {
        let mount = self.mounts.get(device).ok_or(Errno::ENOENT)?;
        mount.entry_cache.add(directory, name, node, missing);
        Ok(())
    }

    /// Drops an entry from the mount's entry cache.
    pub fn entry_cache_remove(&self, device: DeviceId, directory: NodeId, name: &str) -> Result<()> {
        let mount = self.mounts.get(device).ok_or(Errno::ENOENT)?;
        mount.entry_cache.remove(directory, name);
        Ok(())
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("nodes", &self.nodes.len())
            .field("unused", &self.unused.cold_len())
            .finish_non_exhaustive()
    }
}

/// A held node reference, released on drop.
pub struct NodeGuard<'v> {
    vfs: &'v Vfs,
    node: Option<Arc<Vnode>>,
}

impl NodeGuard<'_> {
    /// The node itself.
    pub fn node(&self) -> &Arc<Vnode> {
        self.node.as_ref().expect("guard already detached")
    }

    /// Hands the reference to the caller, who becomes responsible for
    /// returning it via [`Vfs::put_node_by_id`].
    pub fn detach(mut self) -> Arc<Vnode> {
        self.node.take().expect("guard already detached")
    }
}

impl Deref for NodeGuard<'_> {
    type Target = Vnode;

    fn deref(&self) -> &Vnode {
        self.node()
    }
}

impl Drop for NodeGuard<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            self.vfs.dec_node_ref(&node, false, false);
        }
    }
}

/// Volume backing the internal pipe mount. Pipe nodes are only reachable
/// through descriptors, so there is nothing to load.
struct PipeVolume;

impl Volume for PipeVolume {
    fn get_node(&self, _id: NodeId, _reenter: bool) -> Result<LoadedNode> {
        Err(Errno::ENOENT)
    }
}

/// Minimal node backing for an anonymous pipe: metadata only, the pipe
/// engine wraps around it.
pub(crate) struct PipeNodeBase {
    stat: Mutex<NodeStat>,
}

impl PipeNodeBase {
    pub(crate) fn new(device: DeviceId, id: NodeId) -> Arc<PipeNodeBase> {
        Arc::new(PipeNodeBase {
            stat: Mutex::new(NodeStat::for_mode(
                device,
                id,
                FileType::Fifo.mode_bits() | 0o600,
            )),
        })
    }
}

impl NodeOps for PipeNodeBase {
    fn open(&self, _node: &Vnode, _open_mode: OpenFlags) -> Result<BoxedCookie> {
        Ok(Box::new(()))
    }

    fn read_stat(&self, _node: &Vnode) -> Result<NodeStat> {
        Ok(self.stat.lock().clone())
    }

    fn write_stat(&self, _node: &Vnode, stat: &NodeStat, fields: StatFields) -> Result<()> {
        let mut current = self.stat.lock();
        if fields.contains(StatFields::MODE) {
            current.mode = (current.mode & libc::S_IFMT) | (stat.mode & !libc::S_IFMT);
        }
        if fields.contains(StatFields::UID) {
            current.uid = stat.uid;
        }
        if fields.contains(StatFields::GID) {
            current.gid = stat.gid;
        }
        Ok(())
    }
}

impl Vfs {
    /// Creates an unnamed pipe and returns `(read_fd, write_fd)`.
    pub fn pipe(&self, context: &IoContext) -> Result<(i32, i32)> {
        let id = NodeId(self.next_pipe_id.fetch_add(1, Ordering::AcqRel));
        let base = PipeNodeBase::new(self.pipe_device, id);
        self.publish_node_on(
            self.pipe_device,
            id,
            base,
            FileType::Fifo.mode_bits() | 0o600,
            PublishFlags::empty(),
        )?;

        let node = self
            .nodes
            .lookup(self.pipe_device, id)
            .expect("pipe node vanished");

        // The read end opens non-blocking so it does not wait for the
        // writer; the flag is cleared again below.
        let read_flags = OpenFlags(libc::O_RDONLY | libc::O_NONBLOCK);
        let read_cookie = match node.ops().open(&node, read_flags) {
            Ok(cookie) => cookie,
            Err(error) => {
                self.dec_node_ref(&node, false, false);
                return Err(error);
            }
        };
        let write_cookie = match node.ops().open(&node, OpenFlags(libc::O_WRONLY)) {
            Ok(cookie) => cookie,
            Err(error) => {
                let _ = node.ops().close(&node, read_cookie.as_ref());
                self.dec_node_ref(&node, false, false);
                return Err(error);
            }
        };
        let _ = node
            .ops()
            .set_flags(&node, read_cookie.as_ref(), OpenFlags(libc::O_RDONLY));

        // An anonymous pipe has no name; it dies with its last reference.
        self.remove_node(self.pipe_device, id)?;

        self.inc_node_ref(&node);
        let reader = Descriptor::new_file(node.clone(), read_cookie, OpenFlags(libc::O_RDONLY));
        let writer = Descriptor::new_file(node, write_cookie, OpenFlags(libc::O_WRONLY));

        let read_fd = match self.new_fd(context, reader.clone()) {
            Ok(fd) => fd,
            Err(error) => {
                self.discard_descriptor(&reader);
                self.discard_descriptor(&writer);
                return Err(error);
            }
        };
        let write_fd = match self.new_fd(context, writer.clone()) {
            Ok(fd) => fd,
            Err(error) => {
                let _ = self.close(context, read_fd);
                self.discard_descriptor(&writer);
                return Err(error);
            }
        };
        Ok((read_fd, write_fd))
    }

    fn discard_descriptor(&self, descriptor: &Arc<Descriptor>) {
        descriptor.ops.close(self, descriptor);
        self.put_fd(descriptor);
    }

    /// Creates a named pipe at `path`.
    pub fn mkfifo(&self, context: &IoContext, fd: Option<i32>, path: &str, perms: u32) -> Result<()> {
        let (dir, name) = self.fd_and_path_to_dir(context, fd, path)?;
        if name == "." || name == ".." {
            self.dec_node_ref(&dir, false, false);
            return Err(Errno::EEXIST);
        }

        let result = dir
            .ops()
            .create_special(&dir, &name, FileType::Fifo.mode_bits() | (perms & 0o7777), perms);
        match result {
            Ok(id) => {
                dir.mount().entry_cache.remove(dir.id(), &name);
                self.monitors
                    .notify_entry_created(dir.device(), dir.id(), &name, id);
                self.dec_node_ref(&dir, false, false);
                Ok(())
            }
            Err(error) => {
                self.dec_node_ref(&dir, false, false);
                Err(error)
            }
        }
    }
}

// --- fcntl plumbing ---

/// `F_SETFD` flag: close the descriptor on `exec`.
pub const FD_CLOEXEC: i32 = 1;
/// `F_SETFD` flag: do not inherit the descriptor across a fork.
pub const FD_CLOFORK: i32 = 2;
/// `fcntl` command duplicating with the close-on-fork bit set; `libc`
/// does not carry this one.
pub const F_DUPFD_CLOFORK: i32 = 0x7006;

/// A `struct flock` equivalent for the lock-related `fcntl` commands.
#[derive(Clone, Copy, Debug)]
pub struct Flock {
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub kind: i32,
    /// `SEEK_SET`, `SEEK_CUR` or `SEEK_END`.
    pub whence: i32,
    /// Range start relative to `whence`.
    pub start: i64,
    /// Range length; zero means "to end of file".
    pub len: i64,
    /// On `F_GETLK`, the team owning a conflicting lock.
    pub team: Option<TeamId>,
}

impl Flock {
    /// An unlocked record, the usual starting point for `F_GETLK`.
    pub fn unlocked() -> Flock {
        Flock {
            kind: libc::F_UNLCK,
            whence: libc::SEEK_SET,
            start: 0,
            len: 0,
            team: None,
        }
    }
}

/// Argument to [`Vfs::fcntl`].
pub enum FcntlArg<'a> {
    /// No argument.
    None,
    /// An integer argument.
    Value(i32),
    /// A lock description, updated in place by `F_GETLK`.
    Lock(&'a mut Flock),
}

impl Vfs {
    // --- open/close ---

    /// Opens `path` relative to `fd` (or the working directory) and
    /// returns a new descriptor index.
    pub fn open_at(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
        open_mode: i32,
        perms: u32,
    ) -> Result<i32> {
        let flags = OpenFlags(open_mode & !OpenFlags::DISCONNECTED);
        let traverse = open_mode & libc::O_NOFOLLOW == 0;

        if open_mode & libc::O_CREAT != 0 {
            let mut hint: LeafHint = None;
            return match self.fd_and_path_to_node(context, fd, path, traverse, Some(&mut hint)) {
                Ok(outcome) => {
                    if open_mode & libc::O_EXCL != 0 {
                        self.dec_node_ref(&outcome.node, false, false);
                        return Err(Errno::EEXIST);
                    }
                    self.open_node(context, outcome.node, flags)
                }
                Err(Errno::ENOENT) if hint.is_some() => {
                    let (dir, name) = hint.unwrap();
                    let result = self.create_in_dir(context, &dir, &name, flags, perms);
                    self.dec_node_ref(&dir, false, false);
                    result
                }
                Err(error) => Err(error),
            };
        }

        let outcome = self.fd_and_path_to_node(context, fd, path, traverse, None)?;
        self.open_node(context, outcome.node, flags)
    }

    /// Opens `path` resolved from the working directory.
    pub fn open(&self, context: &IoContext, path: &str, open_mode: i32, perms: u32) -> Result<i32> {
        self.open_at(context, None, path, open_mode, perms)
    }

    /// `open` with `O_CREAT` forced: creates the file if missing.
    pub fn create(
        &self,
        context: &IoContext,
        path: &str,
        open_mode: i32,
        perms: u32,
    ) -> Result<i32> {
        self.open_at(context, None, path, open_mode | libc::O_CREAT, perms)
    }

    fn create_in_dir(
        &self,
        context: &IoContext,
        dir: &Arc<Vnode>,
        name: &str,
        flags: OpenFlags,
        perms: u32,
    ) -> Result<i32> {
        if name == "." || name == ".." {
            return Err(Errno::EISDIR);
        }

        let (id, cookie) = dir.ops().create(dir, name, flags, perms)?;

        // A stale negative entry would hide the new file.
        dir.mount().entry_cache.remove(dir.id(), name);
        self.monitors
            .notify_entry_created(dir.device(), dir.id(), name, id);

        let node = self.get_vnode(dir.device(), id, true, false)?;
        self.install_file_descriptor(context, node, cookie, flags)
    }

    /// Opens a node the walk produced; consumes the walk's reference.
    fn open_node(&self, context: &IoContext, node: Arc<Vnode>, flags: OpenFlags) -> Result<i32> {
        if node.is_directory() && flags.writable() {
            self.dec_node_ref(&node, false, false);
            return Err(Errno::EISDIR);
        }

        let cookie = match node.ops().open(&node, flags) {
            Ok(cookie) => cookie,
            Err(error) => {
                self.dec_node_ref(&node, false, false);
                return Err(error);
            }
        };
        self.install_file_descriptor(context, node, cookie, flags)
    }

    fn install_file_descriptor(
        &self,
        context: &IoContext,
        node: Arc<Vnode>,
        cookie: BoxedCookie,
        flags: OpenFlags,
    ) -> Result<i32> {
        let descriptor = Descriptor::new_file(node, cookie, flags);
        self.install_descriptor(context, descriptor, flags.0 & libc::O_CLOEXEC != 0)
    }

    fn install_descriptor(
        &self,
        context: &IoContext,
        descriptor: Arc<Descriptor>,
        close_on_exec: bool,
    ) -> Result<i32> {
        match self.new_fd(context, descriptor.clone()) {
            Ok(slot) => {
                if close_on_exec {
                    context.table.write().set_close_on_exec(slot as usize, true);
                }
                Ok(slot)
            }
            Err(error) => {
                self.discard_descriptor(&descriptor);
                Err(error)
            }
        }
    }

    // --- data transfer ---

    /// Reads from the descriptor's current position, advancing it.
    pub fn read(&self, context: &IoContext, fd: i32, buf: &mut [u8]) -> Result<usize> {
        let descriptor = self.get_fd(context, fd)?;
        let pos = *descriptor.pos.lock();
        let result = descriptor.ops.read(self, &descriptor, pos, buf);
        if let Ok(transferred) = result {
            if pos >= 0 {
                *descriptor.pos.lock() = pos + transferred as i64;
            }
        }
        self.put_fd(&descriptor);
        result
    }

    /// Reads at an explicit position without touching the descriptor's
    /// position.
    pub fn read_at(&self, context: &IoContext, fd: i32, pos: i64, buf: &mut [u8]) -> Result<usize> {
        if pos < 0 {
            return Err(Errno::EINVAL);
        }
        let descriptor = self.get_fd(context, fd)?;
        let result = descriptor.ops.read(self, &descriptor, pos, buf);
        self.put_fd(&descriptor);
        result
    }

    /// Writes at the descriptor's current position, advancing it. With
    /// `O_APPEND` every write goes to the end of the file.
    pub fn write(&self, context: &IoContext, fd: i32, buf: &[u8]) -> Result<usize> {
        let descriptor = self.get_fd(context, fd)?;
        let mut pos = *descriptor.pos.lock();
        if pos >= 0 && descriptor.open_mode().append() {
            pos = match descriptor.ops.read_stat(self, &descriptor) {
                Ok(stat) => stat.size,
                Err(_) => pos,
            };
        }
        let result = descriptor.ops.write(self, &descriptor, pos, buf);
        if let Ok(transferred) = result {
            if pos >= 0 {
                *descriptor.pos.lock() = pos + transferred as i64;
            }
        }
        self.put_fd(&descriptor);
        result
    }

    /// Writes at an explicit position without touching the descriptor's
    /// position.
    pub fn write_at(&self, context: &IoContext, fd: i32, pos: i64, buf: &[u8]) -> Result<usize> {
        if pos < 0 {
            return Err(Errno::EINVAL);
        }
        let descriptor = self.get_fd(context, fd)?;
        let result = descriptor.ops.write(self, &descriptor, pos, buf);
        self.put_fd(&descriptor);
        result
    }

    /// Scatter read at the current position. A partial transfer suppresses
    /// the error and reports the bytes gathered so far.
    pub fn readv(&self, context: &IoContext, fd: i32, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let descriptor = self.get_fd(context, fd)?;
        let mut pos = *descriptor.pos.lock();
        let mut total = 0usize;

        for buf in bufs.iter_mut() {
            match descriptor.ops.read(self, &descriptor, pos, buf) {
                Ok(transferred) => {
                    total += transferred;
                    if pos >= 0 {
                        pos += transferred as i64;
                    }
                    if transferred < buf.len() {
                        break;
                    }
                }
                Err(error) => {
                    if total == 0 {
                        self.put_fd(&descriptor);
                        return Err(error);
                    }
                    break;
                }
            }
        }

        if *descriptor.pos.lock() >= 0 {
            *descriptor.pos.lock() = pos;
        }
        self.put_fd(&descriptor);
        Ok(total)
    }

    /// Gather write at the current position, with partial-transfer
    /// suppression like [`Vfs::readv`].
    pub fn writev(&self, context: &IoContext, fd: i32, bufs: &[&[u8]]) -> Result<usize> {
        let descriptor = self.get_fd(context, fd)?;
        let mut pos = *descriptor.pos.lock();
        if pos >= 0 && descriptor.open_mode().append() {
            pos = match descriptor.ops.read_stat(self, &descriptor) {
                Ok(stat) => stat.size,
                Err(_) => pos,
            };
        }
        let mut total = 0usize;

        for buf in bufs.iter() {
            match descriptor.ops.write(self, &descriptor, pos, buf) {
                Ok(transferred) => {
                    total += transferred;
                    if pos >= 0 {
                        pos += transferred as i64;
                    }
                    if transferred < buf.len() {
                        break;
                    }
                }
                Err(error) => {
                    if total == 0 {
                        self.put_fd(&descriptor);
                        return Err(error);
                    }
                    break;
                }
            }
        }

        if *descriptor.pos.lock() >= 0 {
            *descriptor.pos.lock() = pos;
        }
        self.put_fd(&descriptor);
        Ok(total)
    }

    /// Moves the descriptor's position.
    pub fn seek(&self, context: &IoContext, fd: i32, pos: i64, whence: Whence) -> Result<i64> {
        let descriptor = self.get_fd(context, fd)?;
        let result = descriptor.ops.seek(self, &descriptor, pos, whence);
        self.put_fd(&descriptor);
        result
    }

    /// Driver-defined control operation. A descriptor that accepts no
    /// control operations reports `ENOTTY`.
    pub fn ioctl(&self, context: &IoContext, fd: i32, op: u32, buf: &mut [u8]) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = match descriptor.ops.ioctl(self, &descriptor, op, buf) {
            Err(Errno::ENOSYS) => Err(Errno::ENOTTY),
            other => other,
        };
        self.put_fd(&descriptor);
        result
    }

    /// Flushes the descriptor's node.
    pub fn fsync(&self, context: &IoContext, fd: i32) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = descriptor.ops.fsync(self, &descriptor);
        self.put_fd(&descriptor);
        result
    }

    // --- directories ---

    /// Opens the directory at `path` for iteration.
    pub fn open_dir_at(&self, context: &IoContext, fd: Option<i32>, path: &str) -> Result<i32> {
        let outcome = self.fd_and_path_to_node(context, fd, path, true, None)?;
        let node = outcome.node;
        if !node.is_directory() {
            self.dec_node_ref(&node, false, false);
            return Err(Errno::ENOTDIR);
        }
        let cookie = match node.ops().open_dir(&node) {
            Ok(cookie) => cookie,
            Err(error) => {
                self.dec_node_ref(&node, false, false);
                return Err(error);
            }
        };
        let descriptor = Descriptor::new_dir(node, cookie);
        self.install_descriptor(context, descriptor, false)
    }

    /// Produces the next entry of an open directory (or attribute/index/
    /// query) descriptor.
    pub fn read_dir(&self, context: &IoContext, fd: i32) -> Result<Option<DirEntry>> {
        let descriptor = self.get_fd(context, fd)?;
        let result = descriptor.ops.read_dir(self, &descriptor);
        self.put_fd(&descriptor);
        result
    }

    /// Restarts an open directory iteration.
    pub fn rewind_dir(&self, context: &IoContext, fd: i32) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = descriptor.ops.rewind_dir(self, &descriptor);
        self.put_fd(&descriptor);
        result
    }

    /// Creates a directory.
    pub fn create_dir(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
        perms: u32,
    ) -> Result<()> {
        let (dir, name) = self.fd_and_path_to_dir(context, fd, path)?;
        if name == "." || name == ".." {
            self.dec_node_ref(&dir, false, false);
            return Err(Errno::EEXIST);
        }

        let result = dir.ops().create_dir(&dir, &name, perms);
        if result.is_ok() {
            dir.mount().entry_cache.remove(dir.id(), &name);
            if let Ok(id) = dir.ops().lookup(&dir, &name) {
                self.monitors
                    .notify_entry_created(dir.device(), dir.id(), &name, id);
            }
        }
        self.dec_node_ref(&dir, false, false);
        result
    }

    /// Removes an empty directory.
    pub fn remove_dir_at(&self, context: &IoContext, fd: Option<i32>, path: &str) -> Result<()> {
        let (dir, name) = self.fd_and_path_to_dir(context, fd, path)?;
        if name == "." || name == ".." {
            self.dec_node_ref(&dir, false, false);
            return Err(Errno::EINVAL);
        }

        let removed = dir.ops().lookup(&dir, &name).ok();
        let result = dir.ops().remove_dir(&dir, &name);
        if result.is_ok() {
            dir.mount().entry_cache.remove(dir.id(), &name);
            if let Some(id) = removed {
                dir.mount().entry_cache.remove_dir(id);
                self.monitors
                    .notify_entry_removed(dir.device(), dir.id(), &name, id);
            }
        }
        self.dec_node_ref(&dir, false, false);
        result
    }

    // --- metadata ---

    /// Metadata of the object at `path`.
    pub fn read_stat_at(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
        traverse: bool,
    ) -> Result<NodeStat> {
        let outcome = self.fd_and_path_to_node(context, fd, path, traverse, None)?;
        let node = outcome.node;
        let result = node.ops().read_stat(&node).map(|mut stat| {
            stat.device = node.device();
            stat.node = node.id();
            stat
        });
        self.dec_node_ref(&node, false, false);
        result
    }

    /// Metadata of an open descriptor.
    pub fn read_fd_stat(&self, context: &IoContext, fd: i32) -> Result<NodeStat> {
        let descriptor = self.get_fd(context, fd)?;
        let result = descriptor.ops.read_stat(self, &descriptor);
        self.put_fd(&descriptor);
        result
    }

    /// Changes the selected metadata fields of the object at `path`.
    pub fn write_stat_at(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
        traverse: bool,
        stat: &NodeStat,
        fields: StatFields,
    ) -> Result<()> {
        let outcome = self.fd_and_path_to_node(context, fd, path, traverse, None)?;
        let node = outcome.node;
        let result = node.ops().write_stat(&node, stat, fields);
        if result.is_ok() {
            self.monitors
                .notify_stat_changed(node.device(), node.id(), fields);
        }
        self.dec_node_ref(&node, false, false);
        result
    }

    /// Changes the selected metadata fields of an open descriptor.
    pub fn write_fd_stat(
        &self,
        context: &IoContext,
        fd: i32,
        stat: &NodeStat,
        fields: StatFields,
    ) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = descriptor.ops.write_stat(self, &descriptor, stat, fields);
        self.put_fd(&descriptor);
        result
    }

    /// Checks accessibility of `path` for the given `R_OK`/`W_OK`/`X_OK`
    /// mask.
    pub fn access(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
        mode: i32,
    ) -> Result<()> {
        let outcome = self.fd_and_path_to_node(context, fd, path, true, None)?;
        let node = outcome.node;
        let result = node.ops().access(&node, mode);
        self.dec_node_ref(&node, false, false);
        result
    }

    // --- links ---

    /// Reads the target of the symbolic link at `path`.
    pub fn read_link(&self, context: &IoContext, fd: Option<i32>, path: &str) -> Result<String> {
        let outcome = self.fd_and_path_to_node(context, fd, path, false, None)?;
        let node = outcome.node;
        let result = if node.is_symlink() {
            node.ops().read_symlink(&node)
        } else {
            Err(Errno::EINVAL)
        };
        self.dec_node_ref(&node, false, false);
        result
    }

    /// Creates a symbolic link at `path` pointing to `target`.
    pub fn create_symlink(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
        target: &str,
        perms: u32,
    ) -> Result<()> {
        if target.len() >= crate::MAX_PATH {
            return Err(Errno::ENAMETOOLONG);
        }
        let (dir, name) = self.fd_and_path_to_dir(context, fd, path)?;
        if name == "." || name == ".." {
            self.dec_node_ref(&dir, false, false);
            return Err(Errno::EEXIST);
        }

        let result = dir.ops().create_symlink(&dir, &name, target, perms);
        if result.is_ok() {
            dir.mount().entry_cache.remove(dir.id(), &name);
            if let Ok(id) = dir.ops().lookup(&dir, &name) {
                self.monitors
                    .notify_entry_created(dir.device(), dir.id(), &name, id);
            }
        }
        self.dec_node_ref(&dir, false, false);
        result
    }

    /// Creates a hard link at `path` to the object at `target_path`.
    pub fn create_link(
        &self,
        context: &IoContext,
        fd: Option<i32>,
        path: &str,
        target_fd: Option<i32>,
        target_path: &str,
        traverse: bool,
    ) -> Result<()> {
        let (dir, name) = self.fd_and_path_to_dir(context, fd, path)?;
        if name == "." || name == ".." {
            self.dec_node_ref(&dir, false, false);
            return Err(Errno::EEXIST);
        }

        let target = match self.fd_and_path_to_node(context, target_fd, target_path, traverse, None)
        {
            Ok(outcome) => outcome.node,
            Err(error) => {
                self.dec_node_ref(&dir, false, false);
                return Err(error);
            }
        };

        let result = if target.device() != dir.device() {
            Err(Errno::EXDEV)
        } else {
            dir.ops().link(&dir, &name, &target)
        };
        if result.is_ok() {
            dir.mount().entry_cache.remove(dir.id(), &name);
            self.monitors
                .notify_entry_created(dir.device(), dir.id(), &name, target.id());
        }
        self.dec_node_ref(&target, false, false);
        self.dec_node_ref(&dir, false, false);
        result
    }

    /// Removes the entry at `path`.
    pub fn unlink(&self, context: &IoContext, fd: Option<i32>, path: &str) -> Result<()> {
        let (dir, name) = self.fd_and_path_to_dir(context, fd, path)?;
        if name == "." || name == ".." {
            self.dec_node_ref(&dir, false, false);
            return Err(Errno::EINVAL);
        }

        let removed = dir.ops().lookup(&dir, &name).ok();
        let result = dir.ops().unlink(&dir, &name);
        if result.is_ok() {
            dir.mount().entry_cache.remove(dir.id(), &name);
            if let Some(id) = removed {
                self.monitors
                    .notify_entry_removed(dir.device(), dir.id(), &name, id);
            }
        }
        self.dec_node_ref(&dir, false, false);
        result
    }

    /// Renames the entry at `from_path` to `to_path`. Both must live on
    /// the same mount.
    pub fn rename(
        &self,
        context: &IoContext,
        from_fd: Option<i32>,
        from_path: &str,
        to_fd: Option<i32>,
        to_path: &str,
    ) -> Result<()> {
        let (from_dir, from_name) = self.fd_and_path_to_dir(context, from_fd, from_path)?;
        let (to_dir, to_name) = match self.fd_and_path_to_dir(context, to_fd, to_path) {
            Ok(resolved) => resolved,
            Err(error) => {
                self.dec_node_ref(&from_dir, false, false);
                return Err(error);
            }
        };

        let result = (|| {
            if from_name == "." || from_name == ".." || to_name == "." || to_name == ".." {
                return Err(Errno::EINVAL);
            }
            if from_dir.device() != to_dir.device() {
                return Err(Errno::EXDEV);
            }

            let moved = from_dir.ops().lookup(&from_dir, &from_name).ok();
            from_dir
                .ops()
                .rename(&from_dir, &from_name, &to_dir, &to_name)?;

            from_dir.mount().entry_cache.remove(from_dir.id(), &from_name);
            to_dir.mount().entry_cache.remove(to_dir.id(), &to_name);
            if let Some(id) = moved {
                self.monitors.notify_entry_moved(
                    from_dir.device(),
                    from_dir.id(),
                    &from_name,
                    to_dir.id(),
                    &to_name,
                    id,
                );
            }
            Ok(())
        })();

        self.dec_node_ref(&to_dir, false, false);
        self.dec_node_ref(&from_dir, false, false);
        result
    }

    // --- working directory and root ---

    /// Changes the context's working directory to `path`.
    pub fn chdir(&self, context: &IoContext, path: &str) -> Result<()> {
        let outcome = self.path_to_node(context, path, true, None)?;
        let node = outcome.node;
        if !node.is_directory() {
            self.dec_node_ref(&node, false, false);
            return Err(Errno::ENOTDIR);
        }

        let previous = context.cwd.lock().replace(node);
        if let Some(previous) = previous {
            self.dec_node_ref(&previous, false, false);
        }
        Ok(())
    }

    /// Changes the working directory to an open directory descriptor.
    pub fn fchdir(&self, context: &IoContext, fd: i32) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = match descriptor.node() {
            Some(node) if node.is_directory() => {
                self.inc_node_ref(node);
                let previous = context.cwd.lock().replace(node.clone());
                if let Some(previous) = previous {
                    self.dec_node_ref(&previous, false, false);
                }
                Ok(())
            }
            Some(_) => Err(Errno::ENOTDIR),
            None => Err(Errno::EBADF),
        };
        self.put_fd(&descriptor);
        result
    }

    /// Changes the context's root to `path`; `..` will not escape it.
    pub fn chroot(&self, context: &IoContext, path: &str) -> Result<()> {
        let outcome = self.path_to_node(context, path, true, None)?;
        let node = outcome.node;
        if !node.is_directory() {
            self.dec_node_ref(&node, false, false);
            return Err(Errno::ENOTDIR);
        }

        let previous = context.root.lock().replace(node);
        if let Some(previous) = previous {
            self.dec_node_ref(&previous, false, false);
        }
        Ok(())
    }

    /// The absolute path of the context's working directory.
    pub fn getcwd(&self, context: &IoContext) -> Result<String> {
        let cwd = {
            let guard = context.cwd.lock();
            let cwd = guard.clone().ok_or(Errno::ENOENT)?;
            self.inc_node_ref(&cwd);
            cwd
        };
        self.dir_node_to_path(context, cwd)
    }

    // --- fcntl / flock ---

    /// The `fcntl` multiplexer.
    pub fn fcntl(&self, context: &IoContext, fd: i32, cmd: i32, arg: FcntlArg<'_>) -> Result<i32> {
        match cmd {
            libc::F_DUPFD | libc::F_DUPFD_CLOEXEC | F_DUPFD_CLOFORK => {
                let min = match arg {
                    FcntlArg::Value(min) if min >= 0 => min as usize,
                    FcntlArg::Value(_) => return Err(Errno::EINVAL),
                    _ => 0,
                };
                let descriptor = self.get_fd(context, fd)?;
                let slot = match self.new_fd_at(context, descriptor.clone(), min) {
                    Ok(slot) => slot,
                    Err(error) => {
                        self.put_fd(&descriptor);
                        return Err(error);
                    }
                };
                let mut table = context.table.write();
                table.set_close_on_exec(slot as usize, cmd == libc::F_DUPFD_CLOEXEC);
                table.set_close_on_fork(slot as usize, cmd == F_DUPFD_CLOFORK);
                Ok(slot)
            }
            libc::F_GETFD => {
                // Validate the descriptor, then read the slot bits.
                let descriptor = self.get_fd(context, fd)?;
                self.put_fd(&descriptor);
                let mut bits = 0;
                if context.fd_close_on_exec(fd) {
                    bits |= FD_CLOEXEC;
                }
                if context.fd_close_on_fork(fd) {
                    bits |= FD_CLOFORK;
                }
                Ok(bits)
            }
            libc::F_SETFD => {
                let FcntlArg::Value(bits) = arg else {
                    return Err(Errno::EINVAL);
                };
                let descriptor = self.get_fd(context, fd)?;
                self.put_fd(&descriptor);
                let mut table = context.table.write();
                table.set_close_on_exec(fd as usize, bits & FD_CLOEXEC != 0);
                table.set_close_on_fork(fd as usize, bits & FD_CLOFORK != 0);
                Ok(0)
            }
            libc::F_GETFL => {
                let descriptor = self.get_fd(context, fd)?;
                let flags = descriptor.open_mode().0 & !OpenFlags::DISCONNECTED;
                self.put_fd(&descriptor);
                Ok(flags)
            }
            libc::F_SETFL => {
                let FcntlArg::Value(new_flags) = arg else {
                    return Err(Errno::EINVAL);
                };
                let descriptor = self.get_fd(context, fd)?;
                let settable = OpenFlags::settable_mask();
                let current = descriptor.open_mode().0;
                let target = OpenFlags((current & !settable) | (new_flags & settable));

                let result = descriptor.ops.set_flags(self, &descriptor, target);
                if result.is_ok() {
                    descriptor
                        .open_mode
                        .store(target.0, std::sync::atomic::Ordering::Release);
                }
                self.put_fd(&descriptor);
                result.map(|()| 0)
            }
            libc::F_GETLK => {
                let FcntlArg::Lock(flock) = arg else {
                    return Err(Errno::EINVAL);
                };
                self.test_posix_lock(context, fd, flock)?;
                Ok(0)
            }
            libc::F_SETLK | libc::F_SETLKW => {
                let FcntlArg::Lock(flock) = arg else {
                    return Err(Errno::EINVAL);
                };
                self.set_posix_lock(context, fd, flock, cmd == libc::F_SETLKW)?;
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn lock_base(&self, descriptor: &Arc<Descriptor>, whence: i32) -> Result<i64> {
        let whence = Whence::try_from(whence).map_err(|_| Errno::EINVAL)?;
        Ok(match whence {
            Whence::Set => 0,
            Whence::Current => *descriptor.pos.lock(),
            Whence::End => {
                let node = descriptor.node().ok_or(Errno::EBADF)?;
                node.ops().read_stat(node)?.size
            }
        })
    }

    fn test_posix_lock(&self, context: &IoContext, fd: i32, flock: &mut Flock) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = (|| {
            let node = descriptor.node().ok_or(Errno::EBADF)?;
            let base = self.lock_base(&descriptor, flock.whence)?;
            let (start, end) = advisory::normalize_lock_range(flock.start, flock.len, base)?;
            let shared = flock.kind == libc::F_RDLCK;
            let owner = LockOwner::Posix {
                context: context.id(),
                team: context.team(),
            };

            let probe = FileLock {
                start,
                end,
                shared,
                owner,
            };
            let conflict = match node.ops().test_lock(node, &probe) {
                Err(Errno::ENOSYS) => advisory::test_advisory_lock(node, &owner, start, end, shared),
                Ok(conflict) => conflict,
                Err(error) => return Err(error),
            };

            match conflict {
                Some(lock) => {
                    flock.kind = if lock.shared {
                        libc::F_RDLCK
                    } else {
                        libc::F_WRLCK
                    };
                    flock.whence = libc::SEEK_SET;
                    flock.start = lock.start;
                    flock.len = lock.end - lock.start + 1;
                    flock.team = lock.owner.team();
                }
                None => flock.kind = libc::F_UNLCK,
            }
            Ok(())
        })();
        self.put_fd(&descriptor);
        result
    }

    fn set_posix_lock(
        &self,
        context: &IoContext,
        fd: i32,
        flock: &Flock,
        wait: bool,
    ) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = (|| {
            let node = descriptor.node().ok_or(Errno::EBADF)?;
            let base = self.lock_base(&descriptor, flock.whence)?;
            let (start, end) = advisory::normalize_lock_range(flock.start, flock.len, base)?;
            let owner = LockOwner::Posix {
                context: context.id(),
                team: context.team(),
            };
            let lock = FileLock {
                start,
                end,
                shared: flock.kind == libc::F_RDLCK,
                owner,
            };

            match flock.kind {
                libc::F_UNLCK => match node.ops().release_lock(node, &lock) {
                    Err(Errno::ENOSYS) => {
                        advisory::release_advisory_lock(node, &owner, Some((start, end)))
                    }
                    other => other,
                },
                libc::F_RDLCK | libc::F_WRLCK => {
                    let open_mode = descriptor.open_mode();
                    if lock.shared && !open_mode.readable() {
                        return Err(Errno::EBADF);
                    }
                    if !lock.shared && !open_mode.writable() {
                        return Err(Errno::EBADF);
                    }
                    match node.ops().acquire_lock(node, &lock, wait) {
                        Err(Errno::ENOSYS) => advisory::acquire_advisory_lock(
                            node, owner, start, end, lock.shared, wait,
                        ),
                        other => other,
                    }
                }
                _ => Err(Errno::EINVAL),
            }
        })();
        self.put_fd(&descriptor);
        result
    }

    /// Whole-file `flock()` locking, owned by the descriptor.
    pub fn flock(&self, context: &IoContext, fd: i32, op: i32) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = (|| {
            let node = descriptor.node().ok_or(Errno::EBADF)?;
            let owner = LockOwner::Descriptor(descriptor.fd_id());

            if op & libc::LOCK_UN != 0 {
                return advisory::release_advisory_lock(node, &owner, None);
            }

            let shared = match (op & libc::LOCK_SH != 0, op & libc::LOCK_EX != 0) {
                (true, false) => true,
                (false, true) => false,
                _ => return Err(Errno::EINVAL),
            };
            let wait = op & libc::LOCK_NB == 0;
            // Re-locking replaces the previous flock-style lock.
            advisory::release_advisory_lock(node, &owner, None)?;
            advisory::acquire_advisory_lock(node, owner, 0, i64::MAX - 1, shared, wait)
        })();
        self.put_fd(&descriptor);
        result
    }

    // --- attributes ---

    /// Opens the attribute directory of the node behind `fd`.
    pub fn open_attr_dir(&self, context: &IoContext, fd: i32) -> Result<i32> {
        let descriptor = self.get_fd(context, fd)?;
        let result = (|| {
            let node = descriptor.node().ok_or(Errno::EBADF)?;
            let cookie = node.ops().open_attr_dir(node)?;
            self.inc_node_ref(node);
            let attr_dir = Descriptor::new_attr_dir(node.clone(), cookie);
            self.install_descriptor(context, attr_dir, false)
        })();
        self.put_fd(&descriptor);
        result
    }

    /// Opens the named attribute of the node behind `fd`.
    pub fn open_attr(
        &self,
        context: &IoContext,
        fd: i32,
        name: &str,
        open_mode: i32,
    ) -> Result<i32> {
        let descriptor = self.get_fd(context, fd)?;
        let flags = OpenFlags(open_mode);
        let result = (|| {
            let node = descriptor.node().ok_or(Errno::EBADF)?;
            let cookie = node.ops().open_attr(node, name, flags)?;
            self.inc_node_ref(node);
            let attr = Descriptor::new_attr(node.clone(), cookie, flags, name);
            self.install_descriptor(context, attr, false)
        })();
        self.put_fd(&descriptor);
        result
    }

    /// Creates (and opens) an attribute on the node behind `fd`.
    pub fn create_attr(
        &self,
        context: &IoContext,
        fd: i32,
        name: &str,
        attr_type: u32,
        open_mode: i32,
    ) -> Result<i32> {
        let descriptor = self.get_fd(context, fd)?;
        let flags = OpenFlags(open_mode);
        let result = (|| {
            let node = descriptor.node().ok_or(Errno::EBADF)?;
            let cookie = node.ops().create_attr(node, name, attr_type, flags)?;
            self.monitors
                .notify_attr_changed(node.device(), node.id(), name, AttrCause::Created);
            self.inc_node_ref(node);
            let attr = Descriptor::new_attr(node.clone(), cookie, flags, name);
            self.install_descriptor(context, attr, false)
        })();
        self.put_fd(&descriptor);
        result
    }

    /// Removes an attribute from the node behind `fd`.
    pub fn remove_attr(&self, context: &IoContext, fd: i32, name: &str) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = (|| {
            let node = descriptor.node().ok_or(Errno::EBADF)?;
            node.ops().remove_attr(node, name)?;
            self.monitors
                .notify_attr_changed(node.device(), node.id(), name, AttrCause::Removed);
            Ok(())
        })();
        self.put_fd(&descriptor);
        result
    }

    /// Renames an attribute of the node behind `fd`.
    pub fn rename_attr(
        &self,
        context: &IoContext,
        fd: i32,
        from_name: &str,
        to_name: &str,
    ) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;
        let result = (|| {
            let node = descriptor.node().ok_or(Errno::EBADF)?;
            node.ops().rename_attr(node, from_name, to_name)?;
            self.monitors
                .notify_attr_changed(node.device(), node.id(), from_name, AttrCause::Removed);
            self.monitors
                .notify_attr_changed(node.device(), node.id(), to_name, AttrCause::Created);
            Ok(())
        })();
        self.put_fd(&descriptor);
        result
    }

    // --- indices and queries ---

    /// Opens the index directory of the volume `device`.
    pub fn open_index_dir(&self, context: &IoContext, device: DeviceId) -> Result<i32> {
        let mount = self.mounts.get(device).ok_or(Errno::ENOENT)?;
        let cookie = mount.volume().open_index_dir()?;
        let descriptor = Descriptor::new_index_dir(mount, cookie);
        self.install_descriptor(context, descriptor, false)
    }

    /// Starts a query on the volume `device`; entries are read through
    /// [`Vfs::read_dir`].
    pub fn open_query(
        &self,
        context: &IoContext,
        device: DeviceId,
        query: &str,
        flags: u32,
    ) -> Result<i32> {
        let mount = self.mounts.get(device).ok_or(Errno::ENOENT)?;
        let cookie = mount.volume().open_query(query, flags)?;
        let descriptor = Descriptor::new_query(mount, cookie);
        self.install_descriptor(context, descriptor, false)
    }
}

impl std::fmt::Debug for VfsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsOptions")
            .field("fd_table_size", &self.fd_table_size)
            .field("max_unused_nodes", &self.max_unused_nodes)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for NodeGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeGuard").field(&self.node).finish()
    }
}

impl std::fmt::Debug for FcntlArg<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FcntlArg::None => f.write_str("None"),
            FcntlArg::Value(value) => f.debug_tuple("Value").field(value).finish(),
            FcntlArg::Lock(lock) => f.debug_tuple("Lock").field(lock).finish(),
        }
    }
}
