//! File descriptors and the descriptor-table operations.
//!
//! A [`Descriptor`] pairs an operation vector with the provider's cookie
//! and a node or mount back-pointer. Slots in the per-context table hold
//! one reference each; `open_count` tracks how many tables the descriptor
//! sits in. A disconnected descriptor cannot be re-acquired and is closed
//! as soon as the last outstanding reference is dropped, while its slot
//! stays occupied so the numeric fd is not reused behind the caller's
//! back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use num_enum::TryFromPrimitive;
use parking_lot::Mutex;

use crate::advisory::LockOwner;
use crate::context::{IoContext, MAX_FD_TABLE_SIZE};
use crate::errno::{Errno, Result};
use crate::fs::{BoxedCookie, DirCookie};
use crate::ids::FdId;
use crate::mount::Mount;
use crate::node::Vnode;
use crate::open_flags::OpenFlags;
use crate::select::{SelectEvents, SelectHandle};
use crate::stat::{DirEntry, NodeStat, StatFields};
use crate::vfs::Vfs;

/// Where a seek offset is measured from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum Whence {
    /// From the start of the file.
    Set = libc::SEEK_SET,
    /// From the current position.
    Current = libc::SEEK_CUR,
    /// From the end of the file.
    End = libc::SEEK_END,
}

static NEXT_FD_ID: AtomicU64 = AtomicU64::new(1);

/// One open file description.
pub struct Descriptor {
    id: FdId,
    pub(crate) ops: &'static dyn FdOps,
    pub(crate) node: Option<Arc<Vnode>>,
    pub(crate) mount: Option<Arc<Mount>>,
    pub(crate) cookie: BoxedCookie,
    /// For attribute descriptors, the attribute's name.
    pub(crate) attr_name: Option<String>,
    pub(crate) open_mode: AtomicI32,
    /// Seek position; -1 on non-seekable descriptors.
    pub(crate) pos: Mutex<i64>,
    ref_count: AtomicI32,
    open_count: AtomicI32,
    /// Set once the underlying object has been closed through the
    /// disconnect path, so it is not closed again.
    defunct: AtomicBool,
}

/// Wrapper letting directory-iteration cookies travel as generic cookies.
pub(crate) struct DirCookieSlot(pub(crate) Mutex<Box<dyn DirCookie>>);

impl Descriptor {
    fn new(
        ops: &'static dyn FdOps,
        node: Option<Arc<Vnode>>,
        mount: Option<Arc<Mount>>,
        cookie: BoxedCookie,
        open_mode: OpenFlags,
        pos: i64,
    ) -> Arc<Descriptor> {
        Arc::new(Descriptor {
            id: FdId(NEXT_FD_ID.fetch_add(1, Ordering::Relaxed)),
            ops,
            node,
            mount,
            cookie,
            attr_name: None,
            open_mode: AtomicI32::new(open_mode.0),
            pos: Mutex::new(pos),
            ref_count: AtomicI32::new(1),
            open_count: AtomicI32::new(0),
            defunct: AtomicBool::new(false),
        })
    }

    pub(crate) fn new_file(
        node: Arc<Vnode>,
        cookie: BoxedCookie,
        open_mode: OpenFlags,
    ) -> Arc<Descriptor> {
        let pos = if node.is_fifo() { -1 } else { 0 };
        Descriptor::new(&FILE_OPS, Some(node), None, cookie, open_mode, pos)
    }

    pub(crate) fn new_dir(node: Arc<Vnode>, cookie: Box<dyn DirCookie>) -> Arc<Descriptor> {
        Descriptor::new(
            &DIR_OPS,
            Some(node),
            None,
            Box::new(DirCookieSlot(Mutex::new(cookie))),
            OpenFlags(libc::O_RDONLY),
            0,
        )
    }

    pub(crate) fn new_attr(
        node: Arc<Vnode>,
        cookie: BoxedCookie,
        open_mode: OpenFlags,
        name: &str,
    ) -> Arc<Descriptor> {
        Arc::new(Descriptor {
            id: FdId(NEXT_FD_ID.fetch_add(1, Ordering::Relaxed)),
            ops: &ATTR_OPS,
            node: Some(node),
            mount: None,
            cookie,
            attr_name: Some(name.to_owned()),
            open_mode: AtomicI32::new(open_mode.0),
            pos: Mutex::new(0),
            ref_count: AtomicI32::new(1),
            open_count: AtomicI32::new(0),
            defunct: AtomicBool::new(false),
        })
    }

    pub(crate) fn new_attr_dir(node: Arc<Vnode>, cookie: Box<dyn DirCookie>) -> Arc<Descriptor> {
        Descriptor::new(
            &ATTR_DIR_OPS,
            Some(node),
            None,
            Box::new(DirCookieSlot(Mutex::new(cookie))),
            OpenFlags(libc::O_RDONLY),
            0,
        )
    }

    pub(crate) fn new_index_dir(mount: Arc<Mount>, cookie: Box<dyn DirCookie>) -> Arc<Descriptor> {
        Descriptor::new(
            &INDEX_DIR_OPS,
            None,
            Some(mount),
            Box::new(DirCookieSlot(Mutex::new(cookie))),
            OpenFlags(libc::O_RDONLY),
            0,
        )
    }

    pub(crate) fn new_query(mount: Arc<Mount>, cookie: Box<dyn DirCookie>) -> Arc<Descriptor> {
        Descriptor::new(
            &QUERY_OPS,
            None,
            Some(mount),
            Box::new(DirCookieSlot(Mutex::new(cookie))),
            OpenFlags(libc::O_RDONLY),
            0,
        )
    }

    /// The descriptor's unique object id.
    pub fn fd_id(&self) -> FdId {
        self.id
    }

    /// Current open mode including status flags.
    pub fn open_mode(&self) -> OpenFlags {
        OpenFlags(self.open_mode.load(Ordering::Acquire))
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.open_mode().disconnected()
    }

    pub(crate) fn disconnect(&self) {
        self.open_mode
            .fetch_or(OpenFlags::DISCONNECTED, Ordering::AcqRel);
    }

    /// The node behind this descriptor, if it has one (index-directory and
    /// query descriptors reference a mount instead).
    pub fn node(&self) -> Option<&Arc<Vnode>> {
        self.node.as_ref()
    }

    pub(crate) fn dir_cookie(&self) -> Result<&DirCookieSlot> {
        self.cookie.downcast_ref::<DirCookieSlot>().ok_or(Errno::EBADF)
    }

    pub(crate) fn is_file(&self) -> bool {
        self.ops.is_file()
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("open_mode", &self.open_mode())
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("open_count", &self.open_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A registered readiness subscription on one descriptor slot.
#[derive(Clone)]
pub(crate) struct SelectInfo {
    pub(crate) handle: Arc<SelectHandle>,
    pub(crate) events: SelectEvents,
}

/// The descriptor operation vector. One static instance per descriptor
/// flavor; a missing operation keeps the default, which reports the
/// appropriate error.
#[allow(unused_variables)]
pub(crate) trait FdOps: Send + Sync {
    fn is_file(&self) -> bool {
        false
    }

    fn read(&self, vfs: &Vfs, fd: &Descriptor, pos: i64, buf: &mut [u8]) -> Result<usize> {
        Err(Errno::EBADF)
    }

    fn write(&self, vfs: &Vfs, fd: &Descriptor, pos: i64, buf: &[u8]) -> Result<usize> {
        Err(Errno::EBADF)
    }

    fn seek(&self, vfs: &Vfs, fd: &Descriptor, pos: i64, whence: Whence) -> Result<i64> {
        Err(Errno::ESPIPE)
    }

    fn ioctl(&self, vfs: &Vfs, fd: &Descriptor, op: u32, buf: &mut [u8]) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn set_flags(&self, vfs: &Vfs, fd: &Descriptor, flags: OpenFlags) -> Result<()> {
        Ok(())
    }

    fn read_dir(&self, vfs: &Vfs, fd: &Descriptor) -> Result<Option<DirEntry>> {
        Err(Errno::ENOSYS)
    }

    fn rewind_dir(&self, vfs: &Vfs, fd: &Descriptor) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn read_stat(&self, vfs: &Vfs, fd: &Descriptor) -> Result<NodeStat> {
        Err(Errno::ENOSYS)
    }

    fn write_stat(&self, vfs: &Vfs, fd: &Descriptor, stat: &NodeStat, fields: StatFields)
    -> Result<()> {
        Err(Errno::ENOSYS)
    }

    fn fsync(&self, vfs: &Vfs, fd: &Descriptor) -> Result<()> {
        Err(Errno::EINVAL)
    }

    fn select(
        &self,
        vfs: &Vfs,
        fd: &Descriptor,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        // Without readiness semantics everything is considered ready.
        handle.notify(event);
        Ok(())
    }

    fn deselect(
        &self,
        vfs: &Vfs,
        fd: &Descriptor,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        Ok(())
    }

    fn close(&self, vfs: &Vfs, fd: &Descriptor) {}

    /// Releases the resources the descriptor borrowed from the core (node
    /// references); called when the last reference goes away.
    fn free(&self, vfs: &Vfs, fd: &Descriptor) {}
}

fn fd_node(fd: &Descriptor) -> Result<&Arc<Vnode>> {
    fd.node.as_ref().ok_or(Errno::EBADF)
}

// --- regular files (and FIFOs wrapped by the pipe engine) ---

pub(crate) struct FileOps;
pub(crate) static FILE_OPS: FileOps = FileOps;

impl FdOps for FileOps {
    fn is_file(&self) -> bool {
        true
    }

    fn read(&self, _vfs: &Vfs, fd: &Descriptor, pos: i64, buf: &mut [u8]) -> Result<usize> {
        if !fd.open_mode().readable() {
            return Err(Errno::EBADF);
        }
        let node = fd_node(fd)?;
        node.ops().read(node, fd.cookie.as_ref(), pos, buf)
    }

    fn write(&self, _vfs: &Vfs, fd: &Descriptor, pos: i64, buf: &[u8]) -> Result<usize> {
        if !fd.open_mode().writable() {
            return Err(Errno::EBADF);
        }
        let node = fd_node(fd)?;
        node.ops().write(node, fd.cookie.as_ref(), pos, buf)
    }

    fn seek(&self, _vfs: &Vfs, fd: &Descriptor, pos: i64, whence: Whence) -> Result<i64> {
        let node = fd_node(fd)?;
        if node.is_fifo() {
            return Err(Errno::ESPIPE);
        }

        let mut position = fd.pos.lock();
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => *position,
            Whence::End => {
                let stat = node.ops().read_stat(node)?;
                stat.size
            }
        };
        let target = base.checked_add(pos).ok_or(Errno::EOVERFLOW)?;
        if target < 0 {
            return Err(Errno::EINVAL);
        }
        *position = target;
        Ok(target)
    }

    fn ioctl(&self, _vfs: &Vfs, fd: &Descriptor, op: u32, buf: &mut [u8]) -> Result<()> {
        let node = fd_node(fd)?;
        node.ops().ioctl(node, fd.cookie.as_ref(), op, buf)
    }

    fn set_flags(&self, _vfs: &Vfs, fd: &Descriptor, flags: OpenFlags) -> Result<()> {
        let node = fd_node(fd)?;
        match node.ops().set_flags(node, fd.cookie.as_ref(), flags) {
            Ok(()) | Err(Errno::ENOSYS) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn read_stat(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<NodeStat> {
        let node = fd_node(fd)?;
        node.ops().read_stat(node)
    }

    fn write_stat(
        &self,
        vfs: &Vfs,
        fd: &Descriptor,
        stat: &NodeStat,
        fields: StatFields,
    ) -> Result<()> {
        let node = fd_node(fd)?;
        node.ops().write_stat(node, stat, fields)?;
        vfs.monitors.notify_stat_changed(node.device(), node.id(), fields);
        Ok(())
    }

    fn fsync(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<()> {
        let node = fd_node(fd)?;
        node.ops().fsync(node, false)
    }

    fn select(
        &self,
        _vfs: &Vfs,
        fd: &Descriptor,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        let node = fd_node(fd)?;
        node.ops().select(node, fd.cookie.as_ref(), event, handle)
    }

    fn deselect(
        &self,
        _vfs: &Vfs,
        fd: &Descriptor,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        let node = fd_node(fd)?;
        node.ops().deselect(node, fd.cookie.as_ref(), event, handle)
    }

    fn close(&self, _vfs: &Vfs, fd: &Descriptor) {
        if let Some(node) = fd.node.as_ref() {
            let _ = node.ops().close(node, fd.cookie.as_ref());
        }
    }

    fn free(&self, vfs: &Vfs, fd: &Descriptor) {
        if let Some(node) = fd.node.as_ref() {
            // flock-style locks die with the descriptor.
            let owner = LockOwner::Descriptor(fd.fd_id());
            let _ = crate::advisory::release_advisory_lock(node, &owner, None);
            vfs.dec_node_ref(node, false, false);
        }
    }
}

// --- directories ---

pub(crate) struct DirOps;
pub(crate) static DIR_OPS: DirOps = DirOps;

impl FdOps for DirOps {
    fn read_dir(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<Option<DirEntry>> {
        fd.dir_cookie()?.0.lock().read_entry()
    }

    fn rewind_dir(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<()> {
        fd.dir_cookie()?.0.lock().rewind()
    }

    fn read_stat(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<NodeStat> {
        let node = fd_node(fd)?;
        node.ops().read_stat(node)
    }

    fn write_stat(
        &self,
        vfs: &Vfs,
        fd: &Descriptor,
        stat: &NodeStat,
        fields: StatFields,
    ) -> Result<()> {
        let node = fd_node(fd)?;
        node.ops().write_stat(node, stat, fields)?;
        vfs.monitors.notify_stat_changed(node.device(), node.id(), fields);
        Ok(())
    }

    fn fsync(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<()> {
        let node = fd_node(fd)?;
        node.ops().fsync(node, false)
    }

    fn free(&self, vfs: &Vfs, fd: &Descriptor) {
        if let Some(node) = fd.node.as_ref() {
            vfs.dec_node_ref(node, false, false);
        }
    }
}

// --- attributes ---

pub(crate) struct AttrOps;
pub(crate) static ATTR_OPS: AttrOps = AttrOps;

impl FdOps for AttrOps {
    fn read(&self, _vfs: &Vfs, fd: &Descriptor, pos: i64, buf: &mut [u8]) -> Result<usize> {
        if !fd.open_mode().readable() {
            return Err(Errno::EBADF);
        }
        let node = fd_node(fd)?;
        node.ops().read_attr(node, fd.cookie.as_ref(), pos, buf)
    }

    fn write(&self, vfs: &Vfs, fd: &Descriptor, pos: i64, buf: &[u8]) -> Result<usize> {
        if !fd.open_mode().writable() {
            return Err(Errno::EBADF);
        }
        let node = fd_node(fd)?;
        let written = node.ops().write_attr(node, fd.cookie.as_ref(), pos, buf)?;
        if let Some(name) = fd.attr_name.as_deref() {
            vfs.monitors.notify_attr_changed(
                node.device(),
                node.id(),
                name,
                crate::monitor::AttrCause::Changed,
            );
        }
        Ok(written)
    }

    fn seek(&self, _vfs: &Vfs, fd: &Descriptor, pos: i64, whence: Whence) -> Result<i64> {
        let mut position = fd.pos.lock();
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => *position,
            // Attribute sizes are not tracked by the core.
            Whence::End => return Err(Errno::EINVAL),
        };
        let target = base.checked_add(pos).ok_or(Errno::EOVERFLOW)?;
        if target < 0 {
            return Err(Errno::EINVAL);
        }
        *position = target;
        Ok(target)
    }

    fn free(&self, vfs: &Vfs, fd: &Descriptor) {
        if let Some(node) = fd.node.as_ref() {
            vfs.dec_node_ref(node, false, false);
        }
    }
}

// --- attribute directories, index directories, queries ---

pub(crate) struct AttrDirOps;
pub(crate) static ATTR_DIR_OPS: AttrDirOps = AttrDirOps;

impl FdOps for AttrDirOps {
    fn read_dir(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<Option<DirEntry>> {
        fd.dir_cookie()?.0.lock().read_entry()
    }

    fn rewind_dir(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<()> {
        fd.dir_cookie()?.0.lock().rewind()
    }

    fn free(&self, vfs: &Vfs, fd: &Descriptor) {
        if let Some(node) = fd.node.as_ref() {
            vfs.dec_node_ref(node, false, false);
        }
    }
}

pub(crate) struct IndexDirOps;
pub(crate) static INDEX_DIR_OPS: IndexDirOps = IndexDirOps;

impl FdOps for IndexDirOps {
    fn read_dir(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<Option<DirEntry>> {
        fd.dir_cookie()?.0.lock().read_entry()
    }

    fn rewind_dir(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<()> {
        fd.dir_cookie()?.0.lock().rewind()
    }
}

pub(crate) struct QueryOps;
pub(crate) static QUERY_OPS: QueryOps = QueryOps;

impl FdOps for QueryOps {
    fn read_dir(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<Option<DirEntry>> {
        fd.dir_cookie()?.0.lock().read_entry()
    }

    fn rewind_dir(&self, _vfs: &Vfs, fd: &Descriptor) -> Result<()> {
        fd.dir_cookie()?.0.lock().rewind()
    }
}

/// Takes one plain reference on the descriptor object.
pub(crate) fn acquire_descriptor(descriptor: &Arc<Descriptor>) {
    descriptor.ref_count.fetch_add(1, Ordering::AcqRel);
}

/// Installs a shared duplicate of `descriptor` in `table` at `index`, as
/// part of inheriting a table across a fork.
pub(crate) fn dup_descriptor_into_slot(
    descriptor: &Arc<Descriptor>,
    table: &mut crate::context::FdTable,
    index: usize,
) {
    descriptor.ref_count.fetch_add(1, Ordering::AcqRel);
    descriptor.open_count.fetch_add(1, Ordering::AcqRel);
    table.fds[index] = Some(descriptor.clone());
    table.used += 1;
}

// --- table operations ---

impl Vfs {
    /// Inserts `descriptor` into the smallest free slot at or above
    /// `first_index`. The slot takes over the caller's reference.
    pub(crate) fn new_fd_at(
        &self,
        context: &IoContext,
        descriptor: Arc<Descriptor>,
        first_index: usize,
    ) -> Result<i32> {
        let mut table = context.table.write();
        if first_index >= table.size() {
            return Err(Errno::EINVAL);
        }

        let slot = (first_index..table.size()).find(|&index| table.fds[index].is_none());
        let Some(slot) = slot else {
            return Err(Errno::EMFILE);
        };

        descriptor.open_count.fetch_add(1, Ordering::AcqRel);
        table.fds[slot] = Some(descriptor);
        table.used += 1;
        Ok(slot as i32)
    }

    /// Inserts `descriptor` into the smallest free slot.
    pub(crate) fn new_fd(&self, context: &IoContext, descriptor: Arc<Descriptor>) -> Result<i32> {
        self.new_fd_at(context, descriptor, 0)
    }

    /// Acquires a reference to the descriptor at `fd`. Disconnected
    /// descriptors cannot be acquired.
    pub(crate) fn get_fd(&self, context: &IoContext, fd: i32) -> Result<Arc<Descriptor>> {
        let table = context.table.read();
        let descriptor = usize::try_from(fd)
            .ok()
            .and_then(|index| table.fds.get(index))
            .and_then(Option::as_ref)
            .ok_or(Errno::EBADF)?;
        if descriptor.is_disconnected() {
            return Err(Errno::EBADF);
        }
        descriptor.ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(descriptor.clone())
    }

    /// Releases one reference. The last reference frees the descriptor; a
    /// disconnected descriptor is closed as soon as only the table slots
    /// still know it.
    pub(crate) fn put_fd(&self, descriptor: &Arc<Descriptor>) {
        let previous = descriptor.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);

        if previous == 1 {
            if !descriptor.defunct.swap(true, Ordering::AcqRel) {
                descriptor.ops.free(self, descriptor);
            }
        } else if descriptor.is_disconnected()
            && previous - 1 == descriptor.open_count.load(Ordering::Acquire)
            && !descriptor.defunct.swap(true, Ordering::AcqRel)
        {
            // Nobody is actively using the disconnected descriptor anymore:
            // close the underlying object now. The slot stays occupied
            // until an explicit close.
            descriptor.ops.close(self, descriptor);
            descriptor.ops.free(self, descriptor);
        }
    }

    /// Decrements the open count, invoking the close hook on the last
    /// close.
    pub(crate) fn close_fd(&self, context: &IoContext, descriptor: &Arc<Descriptor>) {
        // POSIX advisory locks die with any close by the owning process.
        if descriptor.is_file() {
            if let Some(node) = descriptor.node.as_ref() {
                let owner = LockOwner::Posix {
                    context: context.id(),
                    team: context.team(),
                };
                let _ = crate::advisory::release_advisory_lock(node, &owner, None);
            }
        }

        if descriptor.open_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(node) = descriptor.node.as_ref() {
                let mut guard = node.lock();
                if guard.mandatory_locked_by == Some(descriptor.fd_id()) {
                    guard.mandatory_locked_by = None;
                }
            }

            if !descriptor.defunct.load(Ordering::Acquire) {
                descriptor.ops.close(self, descriptor);
            }
        }
    }

    /// Empties the slot at `fd`, dropping its reference and any select
    /// subscriptions. Returns the evicted descriptor.
    pub(crate) fn remove_fd(&self, context: &IoContext, fd: i32) -> Option<Arc<Descriptor>> {
        let index = usize::try_from(fd).ok()?;
        let mut table = context.table.write();
        if index >= table.size() {
            return None;
        }

        let descriptor = table.fds[index].take()?;
        table.set_close_on_exec(index, false);
        table.set_close_on_fork(index, false);
        table.used -= 1;
        let infos = std::mem::take(&mut table.select_infos[index]);
        drop(table);

        self.deselect_infos(&descriptor, infos);
        Some(descriptor)
    }

    fn deselect_infos(&self, descriptor: &Arc<Descriptor>, infos: Vec<SelectInfo>) {
        for info in infos {
            for event in info.events.iter() {
                let _ = descriptor.ops.deselect(self, descriptor, event, &info.handle);
            }
            info.handle.notify(SelectEvents::INVALID);
        }
    }

    /// `dup`: a new slot sharing the open file description.
    pub fn dup(&self, context: &IoContext, fd: i32) -> Result<i32> {
        let descriptor = self.get_fd(context, fd)?;
        match self.new_fd(context, descriptor.clone()) {
            Ok(slot) => Ok(slot),
            Err(error) => {
                self.put_fd(&descriptor);
                Err(error)
            }
        }
    }

    /// `dup2`: atomically evicts whatever occupies `new_fd` and installs a
    /// duplicate of `old_fd` there. Duplicating onto itself is a no-op.
    pub fn dup2(&self, context: &IoContext, old_fd: i32, new_fd: i32) -> Result<i32> {
        self.dup2_with_flags(context, old_fd, new_fd, false, false)
    }

    /// `dup2` with close-on-exec / close-on-fork applied to the new slot.
    pub fn dup2_with_flags(
        &self,
        context: &IoContext,
        old_fd: i32,
        new_fd: i32,
        close_on_exec: bool,
        close_on_fork: bool,
    ) -> Result<i32> {
        if old_fd < 0 || new_fd < 0 {
            return Err(Errno::EBADF);
        }
        let (old_index, new_index) = (old_fd as usize, new_fd as usize);

        let mut table = context.table.write();
        if old_index >= table.size() || new_index >= table.size() {
            return Err(Errno::EBADF);
        }
        let Some(descriptor) = table.fds[old_index].clone() else {
            return Err(Errno::EBADF);
        };
        if descriptor.is_disconnected() {
            return Err(Errno::EBADF);
        }

        let mut evicted = None;
        let mut evicted_infos = Vec::new();
        if old_index != new_index {
            evicted = table.fds[new_index].take();
            evicted_infos = std::mem::take(&mut table.select_infos[new_index]);

            descriptor.ref_count.fetch_add(1, Ordering::AcqRel);
            descriptor.open_count.fetch_add(1, Ordering::AcqRel);
            table.fds[new_index] = Some(descriptor);
            if evicted.is_none() {
                table.used += 1;
            }
        }
        table.set_close_on_exec(new_index, close_on_exec);
        table.set_close_on_fork(new_index, close_on_fork);
        drop(table);

        if let Some(evicted) = evicted {
            self.deselect_infos(&evicted, evicted_infos);
            self.close_fd(context, &evicted);
            self.put_fd(&evicted);
        }
        Ok(new_fd)
    }

    /// Closes the slot at `fd`.
    pub fn close(&self, context: &IoContext, fd: i32) -> Result<()> {
        let descriptor = self.remove_fd(context, fd).ok_or(Errno::EBADF)?;
        self.close_fd(context, &descriptor);
        self.put_fd(&descriptor);
        Ok(())
    }

    /// Closes (or flags close-on-exec on) every slot in `[min, max]`,
    /// clamped to the current table size.
    pub fn close_range(
        &self,
        context: &IoContext,
        min: i32,
        max: i32,
        set_close_on_exec: bool,
    ) -> Result<()> {
        if min < 0 || max < min {
            return Err(Errno::EINVAL);
        }

        let size = context.table.read().size();
        let min = min as usize;
        let max = (max as usize).min(size.saturating_sub(1));

        for index in min..=max {
            if set_close_on_exec {
                let mut table = context.table.write();
                if table.fds[index].is_some() {
                    table.set_close_on_exec(index, true);
                }
            } else if let Some(descriptor) = self.remove_fd(context, index as i32) {
                self.close_fd(context, &descriptor);
                self.put_fd(&descriptor);
            }
        }
        Ok(())
    }

    /// Closes every descriptor whose close-on-exec bit is set, as part of
    /// an `exec`.
    pub fn exec_io_context(&self, context: &IoContext) {
        let size = context.table.read().size();
        for index in 0..size {
            let close = {
                let table = context.table.read();
                table.fds[index].is_some() && table.close_on_exec(index)
            };
            if close {
                if let Some(descriptor) = self.remove_fd(context, index as i32) {
                    self.close_fd(context, &descriptor);
                    self.put_fd(&descriptor);
                }
            }
        }
    }

    /// Resizes the descriptor table. Shrinking fails with `EBUSY` when any
    /// slot that would be dropped is in use.
    pub fn resize_fd_table(&self, context: &IoContext, new_size: usize) -> Result<()> {
        if new_size == 0 || new_size > MAX_FD_TABLE_SIZE {
            return Err(Errno::EINVAL);
        }

        let mut table = context.table.write();
        if new_size < table.size() && table.fds[new_size..].iter().any(Option::is_some) {
            return Err(Errno::EBUSY);
        }
        table.resize(new_size);
        Ok(())
    }

    /// Registers `handle` for the given events on `fd`.
    pub fn select_fd(
        &self,
        context: &IoContext,
        fd: i32,
        events: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;

        {
            let mut table = context.table.write();
            let index = fd as usize;
            if index >= table.size() {
                self.put_fd(&descriptor);
                return Err(Errno::EBADF);
            }
            table.select_infos[index].push(SelectInfo {
                handle: handle.clone(),
                events,
            });
        }

        for event in events.iter() {
            let _ = descriptor.ops.select(self, &descriptor, event, handle);
        }

        self.put_fd(&descriptor);
        Ok(())
    }

    /// Withdraws a previous [`Vfs::select_fd`] registration.
    pub fn deselect_fd(
        &self,
        context: &IoContext,
        fd: i32,
        events: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        let descriptor = self.get_fd(context, fd)?;

        {
            let mut table = context.table.write();
            let index = fd as usize;
            if index < table.size() {
                table.select_infos[index].retain(|info| !Arc::ptr_eq(&info.handle, handle));
            }
        }

        for event in events.iter() {
            let _ = descriptor.ops.deselect(self, &descriptor, event, handle);
        }

        self.put_fd(&descriptor);
        Ok(())
    }
}
