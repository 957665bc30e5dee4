//! Per-process I/O state.
//!
//! An [`IoContext`] owns the descriptor table with its close-on-exec and
//! close-on-fork bitmaps and the select-info chains running parallel to
//! the slots, plus the process's root and current directory. The table is
//! guarded by one reader-writer lock; resizing preserves in-use slots.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::fd::{Descriptor, SelectInfo};
use crate::ids::{ContextId, TeamId};
use crate::node::Vnode;

/// Default number of descriptor slots in a fresh context.
pub const DEFAULT_FD_TABLE_SIZE: usize = 256;
/// Largest descriptor table a context may be resized to.
pub const MAX_FD_TABLE_SIZE: usize = 8192;
/// Default cap on node-monitor listeners per context.
pub const DEFAULT_MAX_MONITORS: usize = 4096;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The descriptor table proper, everything guarded by the context lock.
pub(crate) struct FdTable {
    pub(crate) fds: Vec<Option<Arc<Descriptor>>>,
    pub(crate) select_infos: Vec<Vec<SelectInfo>>,
    close_on_exec: Vec<u8>,
    close_on_fork: Vec<u8>,
    pub(crate) used: usize,
}

impl FdTable {
    fn new(size: usize) -> FdTable {
        FdTable {
            fds: vec![None; size],
            select_infos: vec![Vec::new(); size],
            close_on_exec: vec![0; size.div_ceil(8)],
            close_on_fork: vec![0; size.div_ceil(8)],
            used: 0,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.fds.len()
    }

    pub(crate) fn close_on_exec(&self, fd: usize) -> bool {
        self.close_on_exec[fd / 8] & (1 << (fd & 7)) != 0
    }

    pub(crate) fn set_close_on_exec(&mut self, fd: usize, set: bool) {
        if set {
            self.close_on_exec[fd / 8] |= 1 << (fd & 7);
        } else {
            self.close_on_exec[fd / 8] &= !(1 << (fd & 7));
        }
    }

    pub(crate) fn close_on_fork(&self, fd: usize) -> bool {
        self.close_on_fork[fd / 8] & (1 << (fd & 7)) != 0
    }

    pub(crate) fn set_close_on_fork(&mut self, fd: usize, set: bool) {
        if set {
            self.close_on_fork[fd / 8] |= 1 << (fd & 7);
        } else {
            self.close_on_fork[fd / 8] &= !(1 << (fd & 7));
        }
    }

    /// Grows or shrinks to `new_size` slots. The caller has verified that
    /// no dropped slot is in use.
    pub(crate) fn resize(&mut self, new_size: usize) {
        self.fds.resize(new_size, None);
        self.select_infos.resize(new_size, Vec::new());
        self.close_on_exec.resize(new_size.div_ceil(8), 0);
        self.close_on_fork.resize(new_size.div_ceil(8), 0);
    }
}

/// Per-process I/O state: descriptor table, root and working directory.
pub struct IoContext {
    id: ContextId,
    team: TeamId,
    pub(crate) table: RwLock<FdTable>,
    /// The context's root; `..` never escapes it. Guarded separately so
    /// resolution does not contend with table traffic.
    pub(crate) root: Mutex<Option<Arc<Vnode>>>,
    pub(crate) cwd: Mutex<Option<Arc<Vnode>>>,
    pub(crate) max_monitors: usize,
}

impl IoContext {
    pub(crate) fn new(team: TeamId, table_size: usize) -> IoContext {
        IoContext {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            team,
            table: RwLock::new(FdTable::new(table_size)),
            root: Mutex::new(None),
            cwd: Mutex::new(None),
            max_monitors: DEFAULT_MAX_MONITORS,
        }
    }

    /// The context's unique id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The owning team.
    pub fn team(&self) -> TeamId {
        self.team
    }

    /// Current size of the descriptor table.
    pub fn table_size(&self) -> usize {
        self.table.read().size()
    }

    /// Number of slots currently in use.
    pub fn used_fds(&self) -> usize {
        self.table.read().used
    }

    /// Whether the close-on-exec bit is set for `fd`.
    pub fn fd_close_on_exec(&self, fd: i32) -> bool {
        let table = self.table.read();
        fd >= 0 && (fd as usize) < table.size() && table.close_on_exec(fd as usize)
    }

    /// Whether the close-on-fork bit is set for `fd`.
    pub fn fd_close_on_fork(&self, fd: i32) -> bool {
        let table = self.table.read();
        fd >= 0 && (fd as usize) < table.size() && table.close_on_fork(fd as usize)
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("id", &self.id)
            .field("team", &self.team)
            .field("used_fds", &self.used_fds())
            .finish_non_exhaustive()
    }
}
