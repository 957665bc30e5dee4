//! The filesystem driver interface.
//!
//! A driver is split the way the mounted volume is: a [`FileSystem`] is the
//! named, registered module that can produce volumes; a [`Volume`] is one
//! mounted instance (one layer of one, for layered stacks); [`NodeOps`] is
//! the per-node operation vector. All hooks have default implementations
//! that map a missing hook to the specific error the operation contract
//! requires, so a driver only implements what its volume supports.

use std::any::Any;
use std::sync::{Arc, Weak};

use crate::advisory::FileLock;
use crate::errno::{Errno, Result};
use crate::ids::{DeviceId, NodeId};
use crate::node::Vnode;
use crate::open_flags::OpenFlags;
use crate::select::{SelectEvents, SelectHandle};
use crate::stat::{DirEntry, FsInfo, FsInfoFields, NodeStat, StatFields};

/// Opaque per-open state owned by the driver, threaded through every
/// descriptor operation.
pub type Cookie = dyn Any + Send + Sync;

/// Boxed [`Cookie`].
pub type BoxedCookie = Box<Cookie>;

/// Stateful iteration cookie for directories, attribute directories, index
/// directories and query results.
pub trait DirCookie: Send {
    /// Produces the next entry, or `None` when the iteration is exhausted.
    fn read_entry(&mut self) -> Result<Option<DirEntry>>;

    /// Restarts the iteration from the first entry.
    fn rewind(&mut self) -> Result<()>;
}

/// What a volume hands back when the core asks it to load a node by id.
pub struct LoadedNode {
    /// The node's operation vector, carrying the driver's private state.
    pub ops: Arc<dyn NodeOps>,
    /// Raw mode; only the `S_IFMT` bits are interpreted by the core.
    pub mode: u32,
    /// Publish-time flags.
    pub flags: PublishFlags,
}

bitflags::bitflags! {
    /// Flags a driver may pass when publishing or loading a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PublishFlags: u32 {
        /// The node is published in already-removed state; it is freed as
        /// soon as its last reference is surrendered.
        const REMOVED = 1 << 0;
        /// Do not wrap FIFO nodes with the core's pipe engine.
        const NO_SPECIAL_SUB_NODE = 1 << 1;
    }
}

/// A named filesystem module, registered with the core so `mount` can find
/// it. One registered `FileSystem` can back any number of volumes.
pub trait FileSystem: Send + Sync {
    /// The name `mount` resolves, e.g. `"scratchfs"`.
    fn name(&self) -> &str;

    /// Mounts a new volume instance.
    ///
    /// The driver must publish its root node through
    /// [`MountContext::publish`] before returning, and hand back the root's
    /// node id together with the volume operation vector.
    fn mount(
        &self,
        ctx: &MountContext<'_>,
        device: Option<&str>,
        args: Option<&str>,
    ) -> Result<MountedVolume>;
}

/// Result of a successful [`FileSystem::mount`] call.
pub struct MountedVolume {
    /// The volume operation vector for this layer.
    pub volume: Arc<dyn Volume>,
    /// Id of the root node the driver has published.
    pub root: NodeId,
}

/// Handle passed to a driver while it mounts, giving it access to the node
/// registry of the volume being created.
pub struct MountContext<'a> {
    pub(crate) vfs: &'a Arc<crate::vfs::Vfs>,
    pub(crate) device: DeviceId,
    pub(crate) layer: u32,
}

impl MountContext<'_> {
    /// Device id assigned to the volume being mounted.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Which layer of a stacked mount this driver provides (0 = bottom).
    pub fn layer(&self) -> u32 {
        self.layer
    }

    /// A durable handle to the core, for drivers that publish or remove
    /// nodes after mounting has finished.
    pub fn core(&self) -> Weak<crate::vfs::Vfs> {
        Arc::downgrade(self.vfs)
    }

    /// Publishes a node of the volume being mounted. See
    /// [`Vfs::publish_node_on`](crate::vfs::Vfs::publish_node_on).
    pub fn publish(
        &self,
        id: NodeId,
        ops: Arc<dyn NodeOps>,
        mode: u32,
        flags: PublishFlags,
    ) -> Result<()> {
        self.vfs.publish_node_on(self.device, id, ops, mode, flags)
    }
}

/// Per-volume operations (one instance per mounted layer).
pub trait Volume: Send + Sync {
    /// Tears the volume down. Called once, after all nodes are drained.
    fn unmount(&self) {}

    /// Writes back all volume state. Hook absence is not an error.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Reports volume-wide information.
    fn read_fs_info(&self) -> Result<FsInfo> {
        Err(Errno::ENOSYS)
    }

    /// Changes volume-wide information.
    fn write_fs_info(&self, _info: &FsInfo, _fields: FsInfoFields) -> Result<()> {
        Err(Errno::EROFS)
    }

    /// Loads the node with the given id.
    ///
    /// `reenter` is true when the call originates from within another driver
    /// hook on the same volume.
    fn get_node(&self, id: NodeId, reenter: bool) -> Result<LoadedNode>;

    /// Layered stacks: gives an upper layer the chance to attach its own
    /// state when a lower layer publishes a node.
    fn create_sub_node(&self, _id: NodeId, _node: &Arc<Vnode>) -> Result<()> {
        Ok(())
    }

    /// Layered stacks: called once every layer's `mount` hook has returned.
    fn all_layers_mounted(&self) {}

    /// Opens the volume's index directory.
    fn open_index_dir(&self) -> Result<Box<dyn DirCookie>> {
        Err(Errno::ENOSYS)
    }

    /// Starts a live or one-shot query. The core only routes; it does not
    /// interpret the query string.
    fn open_query(&self, _query: &str, _flags: u32) -> Result<Box<dyn DirCookie>> {
        Err(Errno::ENOSYS)
    }
}

/// Per-node operations. The implementing value owns the driver's private
/// node data; the core never looks inside.
#[allow(unused_variables)]
pub trait NodeOps: Send + Sync {
    // --- identity ---

    /// Surrenders the node: the core no longer references it. Not called
    /// for removed nodes (see [`NodeOps::remove`]).
    fn put(&self, node: &Vnode) {}

    /// Destroys the node; it was marked removed and the last reference is
    /// gone.
    fn remove(&self, node: &Vnode) {}

    /// Layered stacks: resolves this node to the layer below.
    fn get_super_ops(&self) -> Option<Arc<dyn NodeOps>> {
        None
    }

    // --- directory ---

    /// Resolves `name` within this directory to a node id.
    fn lookup(&self, dir: &Vnode, name: &str) -> Result<NodeId> {
        Err(Errno::ENOSYS)
    }

    /// Opens the directory for iteration.
    fn open_dir(&self, node: &Vnode) -> Result<Box<dyn DirCookie>> {
        Err(Errno::ENOSYS)
    }

    /// Creates a subdirectory.
    fn create_dir(&self, dir: &Vnode, name: &str, perms: u32) -> Result<()> {
        Err(Errno::EROFS)
    }

    /// Removes an empty subdirectory.
    fn remove_dir(&self, dir: &Vnode, name: &str) -> Result<()> {
        Err(Errno::EROFS)
    }

    // --- file ---

    /// Creates and opens a regular file. Returns the new node's id and the
    /// open cookie.
    fn create(
        &self,
        dir: &Vnode,
        name: &str,
        open_mode: OpenFlags,
        perms: u32,
    ) -> Result<(NodeId, BoxedCookie)> {
        Err(Errno::EROFS)
    }

    /// Creates a special node (FIFO, device, socket) named `name`; the
    /// type comes from the `S_IFMT` bits of `mode`.
    fn create_special(&self, dir: &Vnode, name: &str, mode: u32, perms: u32) -> Result<NodeId> {
        Err(Errno::EROFS)
    }

    /// Opens the node.
    fn open(&self, node: &Vnode, open_mode: OpenFlags) -> Result<BoxedCookie> {
        Err(Errno::ENOSYS)
    }

    /// Closes an open cookie. The cookie is dropped afterwards; drivers
    /// needing teardown beyond `Drop` do it here.
    fn close(&self, node: &Vnode, cookie: &Cookie) -> Result<()> {
        Ok(())
    }

    /// Reads at `pos` into `buf`, returning the number of bytes produced.
    fn read(&self, node: &Vnode, cookie: &Cookie, pos: i64, buf: &mut [u8]) -> Result<usize> {
        Err(Errno::EBADF)
    }

    /// Writes `buf` at `pos`, returning the number of bytes consumed.
    fn write(&self, node: &Vnode, cookie: &Cookie, pos: i64, buf: &[u8]) -> Result<usize> {
        Err(Errno::EBADF)
    }

    /// Driver-defined control operation.
    fn ioctl(&self, node: &Vnode, cookie: &Cookie, op: u32, buf: &mut [u8]) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Applies changed status flags (`F_SETFL`) to an open cookie.
    fn set_flags(&self, node: &Vnode, cookie: &Cookie, flags: OpenFlags) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Writes back the node's data and, unless `data_only`, its metadata.
    fn fsync(&self, node: &Vnode, data_only: bool) -> Result<()> {
        Ok(())
    }

    // --- metadata ---

    /// Reports the node's metadata.
    fn read_stat(&self, node: &Vnode) -> Result<NodeStat>;

    /// Changes the fields of the node's metadata selected by `fields`.
    fn write_stat(&self, node: &Vnode, stat: &NodeStat, fields: StatFields) -> Result<()> {
        Err(Errno::EROFS)
    }

    /// Checks whether the caller may access the node as requested
    /// (`libc::R_OK`/`W_OK`/`X_OK` mask). Hook absence grants access.
    fn access(&self, node: &Vnode, mode: i32) -> Result<()> {
        Ok(())
    }

    // --- links ---

    /// Creates a symbolic link `name` in this directory.
    fn create_symlink(&self, dir: &Vnode, name: &str, target: &str, perms: u32) -> Result<()> {
        Err(Errno::EROFS)
    }

    /// Reads the target of a symbolic link.
    fn read_symlink(&self, node: &Vnode) -> Result<String> {
        Err(Errno::EINVAL)
    }

    /// Creates a hard link `name` in `dir` to `target`.
    fn link(&self, dir: &Vnode, name: &str, target: &Vnode) -> Result<()> {
        Err(Errno::EROFS)
    }

    /// Removes the entry `name` from this directory.
    fn unlink(&self, dir: &Vnode, name: &str) -> Result<()> {
        Err(Errno::EROFS)
    }

    /// Renames `from_name` in `from_dir` to `to_name` in `to_dir` (both on
    /// this volume).
    fn rename(&self, from_dir: &Vnode, from_name: &str, to_dir: &Vnode, to_name: &str)
    -> Result<()> {
        Err(Errno::EROFS)
    }

    // --- attributes ---

    /// Opens the node's attribute directory.
    fn open_attr_dir(&self, node: &Vnode) -> Result<Box<dyn DirCookie>> {
        Err(Errno::ENOSYS)
    }

    /// Opens the named attribute.
    fn open_attr(&self, node: &Vnode, name: &str, open_mode: OpenFlags) -> Result<BoxedCookie> {
        Err(Errno::ENOSYS)
    }

    /// Creates and opens an attribute.
    fn create_attr(
        &self,
        node: &Vnode,
        name: &str,
        attr_type: u32,
        open_mode: OpenFlags,
    ) -> Result<BoxedCookie> {
        Err(Errno::EROFS)
    }

    /// Reads attribute data.
    fn read_attr(&self, node: &Vnode, cookie: &Cookie, pos: i64, buf: &mut [u8]) -> Result<usize> {
        Err(Errno::EBADF)
    }

    /// Writes attribute data.
    fn write_attr(&self, node: &Vnode, cookie: &Cookie, pos: i64, buf: &[u8]) -> Result<usize> {
        Err(Errno::EBADF)
    }

    /// Removes the named attribute.
    fn remove_attr(&self, node: &Vnode, name: &str) -> Result<()> {
        Err(Errno::EROFS)
    }

    /// Renames an attribute.
    fn rename_attr(&self, node: &Vnode, from_name: &str, to_name: &str) -> Result<()> {
        Err(Errno::EROFS)
    }

    // --- locking (optional; the core's advisory manager is the fallback) ---

    /// Tests whether `lock` could be acquired, returning a conflicting lock
    /// if not. `ENOSYS` selects the core's built-in manager.
    fn test_lock(&self, node: &Vnode, lock: &FileLock) -> Result<Option<FileLock>> {
        Err(Errno::ENOSYS)
    }

    /// Acquires an advisory lock. `ENOSYS` selects the built-in manager.
    fn acquire_lock(&self, node: &Vnode, lock: &FileLock, wait: bool) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Releases an advisory lock. `ENOSYS` selects the built-in manager.
    fn release_lock(&self, node: &Vnode, lock: &FileLock) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    // --- select ---

    /// Registers interest in `event` on an open cookie. Drivers without
    /// readiness semantics keep the default, which signals the event
    /// immediately (everything is always ready).
    fn select(
        &self,
        node: &Vnode,
        cookie: &Cookie,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        handle.notify(event);
        Ok(())
    }

    /// Withdraws interest previously registered with `select`.
    fn deselect(
        &self,
        node: &Vnode,
        cookie: &Cookie,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        Ok(())
    }
}
