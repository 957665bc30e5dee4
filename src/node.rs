//! The in-memory node (vnode) and its status bit-set.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::advisory::AdvisoryLocking;
use crate::fs::NodeOps;
use crate::ids::{DeviceId, NodeId};
use crate::mount::Mount;
use crate::stat::FileType;

bitflags! {
    /// Node status bits.
    ///
    /// `BUSY`, `REMOVED`, `UNPUBLISHED`, `UNUSED` and `HOT` may be flipped
    /// under the per-node lock with the node table read-locked. `COVERED`
    /// and `COVERING` mirror the covering links and require the node table
    /// write-locked; reading any bit is lock-free.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeFlags: u32 {
        /// Mid-creation or mid-destruction; lookups wait.
        const BUSY = 1 << 0;
        /// Unlinked; the node is destroyed once unreferenced.
        const REMOVED = 1 << 1;
        /// Reserved by its driver but not yet visible to lookups.
        const UNPUBLISHED = 1 << 2;
        /// Reference count is zero; the node sits on the unused LRU.
        const UNUSED = 1 << 3;
        /// In the hot array of the unused LRU.
        const HOT = 1 << 4;
        /// A mount's root is layered over this directory.
        const COVERED = 1 << 5;
        /// This node is a mount's root layered over another directory.
        const COVERING = 1 << 6;
    }
}

/// Mutable per-node fields, guarded by the node's short lock.
#[derive(Default)]
pub(crate) struct VnodeExtra {
    /// Down-link of the covering stack: set on a mount's root, pointing at
    /// the directory it is layered over. Owns a lifecycle reference.
    pub(crate) covers: Option<Arc<Vnode>>,
    /// Up-link of the covering stack; weak to keep the pair acyclic.
    pub(crate) covered_by: Weak<Vnode>,
    /// Lazily created advisory-locking record.
    pub(crate) advisory: Option<Arc<AdvisoryLocking>>,
    /// Descriptor holding the node in exclusive use, if any.
    pub(crate) mandatory_locked_by: Option<crate::ids::FdId>,
}

/// One live filesystem object.
///
/// Identity is the `(device, id)` pair and never changes. The lifecycle
/// reference count is explicit and distinct from the `Arc` count: the node
/// table and covering links hold `Arc`s for storage, while `ref_count`
/// decides when the node is surrendered to its driver.
pub struct Vnode {
    device: DeviceId,
    id: NodeId,
    mount: Arc<Mount>,
    pub(crate) ref_count: AtomicI32,
    flags: AtomicU32,
    mode: AtomicU32,
    ops: Mutex<Option<Arc<dyn NodeOps>>>,
    /// Opaque page-cache token; zero when absent. The core only stores it.
    cache: AtomicU64,
    extra: Mutex<VnodeExtra>,
}

impl Vnode {
    pub(crate) fn new(mount: Arc<Mount>, device: DeviceId, id: NodeId) -> Vnode {
        Vnode {
            device,
            id,
            mount,
            ref_count: AtomicI32::new(1),
            flags: AtomicU32::new(VnodeFlags::BUSY.bits()),
            mode: AtomicU32::new(0),
            ops: Mutex::new(None),
            cache: AtomicU64::new(0),
            extra: Mutex::new(VnodeExtra::default()),
        }
    }

    /// The volume this node lives on.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The node's id within its volume.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The mount this node belongs to.
    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// The node's operation vector. Panics when called on a node that has
    /// not been supplied by its driver yet; such nodes are busy and never
    /// reachable from the outside.
    pub fn ops(&self) -> Arc<dyn NodeOps> {
        self.ops.lock().clone().expect("vnode has no ops")
    }

    /// Sets or replaces the operation vector. Only legal while the node is
    /// busy, i.e. invisible to everyone but the thread completing it.
    pub(crate) fn set_ops(&self, ops: Arc<dyn NodeOps>) {
        debug_assert!(self.is_busy());
        *self.ops.lock() = Some(ops);
    }

    pub(crate) fn current_ops(&self) -> Option<Arc<dyn NodeOps>> {
        self.ops.lock().clone()
    }

    pub(crate) fn has_ops(&self) -> bool {
        self.ops.lock().is_some()
    }

    /// Raw mode bits; only `S_IFMT` is meaningful to the core.
    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::Acquire)
    }

    pub(crate) fn set_mode(&self, mode: u32) {
        self.mode.store(mode, Ordering::Release);
    }

    /// The node's file type, if the driver supplied valid mode bits.
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode())
    }

    /// Whether the node is a directory.
    pub fn is_directory(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    /// Whether the node is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(FileType::Symlink)
    }

    /// Whether the node is a named pipe.
    pub fn is_fifo(&self) -> bool {
        self.file_type() == Some(FileType::Fifo)
    }

    /// Current lifecycle reference count.
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// The stored page-cache token (zero when absent).
    pub fn cache_token(&self) -> u64 {
        self.cache.load(Ordering::Acquire)
    }

    /// Stores an opaque page-cache token on the node.
    pub fn set_cache_token(&self, token: u64) {
        self.cache.store(token, Ordering::Release);
    }

    // --- status bits ---

    pub(crate) fn flags(&self) -> VnodeFlags {
        VnodeFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    fn set_flag(&self, flag: VnodeFlags, set: bool) {
        if set {
            self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
        }
    }

    /// Whether the node is in a transitional state lookups must wait out.
    pub fn is_busy(&self) -> bool {
        self.flags().contains(VnodeFlags::BUSY)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.set_flag(VnodeFlags::BUSY, busy);
    }

    /// Whether the node has been unlinked.
    pub fn is_removed(&self) -> bool {
        self.flags().contains(VnodeFlags::REMOVED)
    }

    pub(crate) fn set_removed(&self, removed: bool) {
        self.set_flag(VnodeFlags::REMOVED, removed);
    }

    /// Whether the node was reserved but never published.
    pub fn is_unpublished(&self) -> bool {
        self.flags().contains(VnodeFlags::UNPUBLISHED)
    }

    pub(crate) fn set_unpublished(&self, unpublished: bool) {
        self.set_flag(VnodeFlags::UNPUBLISHED, unpublished);
    }

    pub(crate) fn is_unused(&self) -> bool {
        self.flags().contains(VnodeFlags::UNUSED)
    }

    pub(crate) fn set_unused(&self, unused: bool) {
        self.set_flag(VnodeFlags::UNUSED, unused);
    }

    pub(crate) fn is_hot(&self) -> bool {
        self.flags().contains(VnodeFlags::HOT)
    }

    pub(crate) fn set_hot(&self, hot: bool) {
        self.set_flag(VnodeFlags::HOT, hot);
    }

    /// Whether a mount's root is layered over this node.
    pub fn is_covered(&self) -> bool {
        self.flags().contains(VnodeFlags::COVERED)
    }

    pub(crate) fn set_covered(&self, covered: bool) {
        self.set_flag(VnodeFlags::COVERED, covered);
    }

    /// Whether this node is a mount's root layered over another directory.
    pub fn is_covering(&self) -> bool {
        self.flags().contains(VnodeFlags::COVERING)
    }

    pub(crate) fn set_covering(&self, covering: bool) {
        self.set_flag(VnodeFlags::COVERING, covering);
    }

    /// Locks the node's mutable fields. Held only for short sections; may
    /// be taken with the node table read-locked.
    pub(crate) fn lock(&self) -> MutexGuard<'_, VnodeExtra> {
        self.extra.lock()
    }
}

impl std::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vnode")
            .field("device", &self.device)
            .field("id", &self.id)
            .field("ref_count", &self.ref_count())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}
