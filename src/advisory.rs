//! Advisory file locking.
//!
//! Two flavors share one per-node lock list: POSIX range locks owned by an
//! `(I/O context, team)` pair, and whole-file `flock()` locks owned by the
//! descriptor itself. Ranges are closed intervals `[start, end]`. Waiting
//! acquirers park on the per-node condition variable and re-run the
//! collision scan from the top whenever any lock is released. No deadlock
//! detection is performed.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::errno::{Errno, Result};
use crate::ids::{ContextId, FdId, TeamId};
use crate::node::Vnode;

/// Who owns an advisory lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOwner {
    /// POSIX semantics: the lock belongs to a process; every descriptor of
    /// that process may modify it.
    Posix {
        /// The owning I/O context.
        context: ContextId,
        /// The owning team.
        team: TeamId,
    },
    /// BSD `flock()` semantics: the lock travels with the descriptor.
    Descriptor(FdId),
}

impl LockOwner {
    /// The team to report in `F_GETLK`, if the owner has one.
    pub fn team(&self) -> Option<TeamId> {
        match self {
            LockOwner::Posix { team, .. } => Some(*team),
            LockOwner::Descriptor(_) => None,
        }
    }
}

/// A normalized advisory lock record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileLock {
    /// First byte of the locked range.
    pub start: i64,
    /// Last byte of the locked range (inclusive).
    pub end: i64,
    /// Shared (read) lock; exclusive otherwise.
    pub shared: bool,
    /// The lock's owner.
    pub owner: LockOwner,
}

impl FileLock {
    fn intersects(&self, start: i64, end: i64) -> bool {
        self.start <= end && self.end >= start
    }
}

struct LockingState {
    locks: Vec<FileLock>,
    /// Set when the record has been detached from its node; holders must
    /// re-fetch instead of mutating a dead record.
    detached: bool,
}

/// The lazily allocated per-node locking record.
pub(crate) struct AdvisoryLocking {
    state: Mutex<LockingState>,
    waiters: Condvar,
}

impl AdvisoryLocking {
    fn new() -> Arc<AdvisoryLocking> {
        Arc::new(AdvisoryLocking {
            state: Mutex::new(LockingState {
                locks: Vec::new(),
                detached: false,
            }),
            waiters: Condvar::new(),
        })
    }
}

/// Fetches the node's locking record, if any.
fn get_locking(node: &Vnode) -> Option<Arc<AdvisoryLocking>> {
    node.lock().advisory.clone()
}

/// Fetches the node's locking record, creating it on demand.
fn get_or_create_locking(node: &Vnode) -> Arc<AdvisoryLocking> {
    let mut guard = node.lock();
    match &guard.advisory {
        Some(locking) => locking.clone(),
        None => {
            let locking = AdvisoryLocking::new();
            guard.advisory = Some(locking.clone());
            locking
        }
    }
}

/// Detaches and drops the record when its list is empty.
fn release_locking_if_empty(node: &Vnode, locking: &Arc<AdvisoryLocking>) {
    let mut guard = node.lock();
    let Some(current) = guard.advisory.clone() else {
        return;
    };
    if !Arc::ptr_eq(&current, locking) {
        return;
    }
    let mut state = locking.state.lock();
    if state.locks.is_empty() {
        state.detached = true;
        guard.advisory = None;
    }
}

/// Whether `candidate` blocks acquisition of a lock with the given shape.
fn collides(candidate: &FileLock, owner: &LockOwner, start: i64, end: i64, shared: bool) -> bool {
    candidate.owner != *owner
        && candidate.intersects(start, end)
        && !(shared && candidate.shared)
}

/// Tests whether a lock of the given shape could be acquired on `node`,
/// returning the first conflicting lock otherwise.
pub(crate) fn test_advisory_lock(
    node: &Vnode,
    owner: &LockOwner,
    start: i64,
    end: i64,
    shared: bool,
) -> Option<FileLock> {
    let locking = get_locking(node)?;
    let state = locking.state.lock();
    state
        .locks
        .iter()
        .find(|lock| collides(lock, owner, start, end, shared))
        .copied()
}

/// Acquires an advisory lock on `node`.
///
/// With `wait` unset, a collision fails with `EWOULDBLOCK` for POSIX owners
/// and `EACCES` for descriptor (flock) owners; otherwise the caller blocks
/// until the collision scan passes.
pub(crate) fn acquire_advisory_lock(
    node: &Vnode,
    owner: LockOwner,
    start: i64,
    end: i64,
    shared: bool,
    wait: bool,
) -> Result<()> {
    loop {
        eprintln!("DBG acquire: get_or_create_locking");
        let locking = get_or_create_locking(node);
        eprintln!("DBG acquire: locking state lock");
        let mut state = locking.state.lock();
        eprintln!("DBG acquire: locked state");
        if state.detached {
            continue;
        }

        loop {
            let collision = state
                .locks
                .iter()
                .any(|lock| collides(lock, &owner, start, end, shared));
            if !collision {
                state.locks.push(FileLock {
                    start,
                    end,
                    shared,
                    owner,
                });
                eprintln!("DBG acquire: acquired, returning");
                return Ok(());
            }

            if !wait {
                eprintln!("DBG acquire: no wait, returning err");
                return Err(match owner {
                    LockOwner::Posix { .. } => Errno::EWOULDBLOCK,
                    LockOwner::Descriptor(_) => Errno::EACCES,
                });
            }

            eprintln!("DBG acquire: about to wait on condvar");
            locking.waiters.wait(&mut state);
            eprintln!("DBG acquire: woke from condvar");
            if state.detached {
                // The record died while we slept; start over on a fresh one.
                break;
            }
        }
    }
}

/// Releases advisory locks on `node`.
///
/// For a POSIX owner, `range` limits the release to the given interval and
/// applies split semantics: partially covered locks are narrowed, a lock
/// spanning the interval is divided in two. Without a range, every lock of
/// the owner goes away (descriptor locks always release whole).
pub(crate) fn release_advisory_lock(
    node: &Vnode,
    owner: &LockOwner,
    range: Option<(i64, i64)>,
) -> Result<()> {
    eprintln!("DBG release: get_locking");
    let Some(locking) = get_locking(node) else {
        eprintln!("DBG release: no locking record, returning");
        return Ok(());
    };

    eprintln!("DBG release: locking state lock");
    let mut state = locking.state.lock();
    eprintln!("DBG release: locked state");
    if state.detached {
        return Ok(());
    }

    let mut split_off: Vec<FileLock> = Vec::new();
    state.locks.retain_mut(|lock| {
        if lock.owner != *owner {
            return true;
        }
        let Some((start, end)) = range else {
            return false;
        };
        if !lock.intersects(start, end) {
            return true;
        }

        let starts_before = lock.start < start;
        let ends_beyond = lock.end > end;
        match (starts_before, ends_beyond) {
            (false, false) => false,
            (true, false) => {
                lock.end = start - 1;
                true
            }
            (false, true) => {
                lock.start = end + 1;
                true
            }
            (true, true) => {
                // The unlocked interval punches a hole in the middle.
                split_off.push(FileLock {
                    start: end + 1,
                    end: lock.end,
                    shared: lock.shared,
                    owner: lock.owner,
                });
                lock.end = start - 1;
                true
            }
        }
    });
    state.locks.append(&mut split_off);

    let empty = state.locks.is_empty();
    eprintln!("DBG release: notify_all");
    locking.waiters.notify_all();
    drop(state);
    eprintln!("DBG release: dropped state, returning");

    if empty {
        release_locking_if_empty(node, &locking);
    }
    Ok(())
}

/// Whether the node still carries any advisory locks.
pub(crate) fn has_advisory_locks(node: &Vnode) -> bool {
    match get_locking(node) {
        Some(locking) => !locking.state.lock().locks.is_empty(),
        None => false,
    }
}

/// Normalizes raw `struct flock`-style parameters into an absolute closed
/// range, resolving `SEEK_CUR`/`SEEK_END` against the descriptor position
/// and the node size. A zero length means "to end of file" and becomes the
/// maximum representable end.
pub(crate) fn normalize_lock_range(
    mut start: i64,
    mut len: i64,
    base: i64,
) -> Result<(i64, i64)> {
    start += base;

    if start < 0 {
        start = 0;
    }
    if len == 0 {
        len = i64::MAX;
    }

    // Keep offset plus length representable.
    if start > 0 && i64::MAX - start < len {
        len = i64::MAX - start;
    }

    if len < 0 {
        // A negative length reverses the region.
        start += len;
        len = -len;
        if start < 0 {
            len += start;
            start = 0;
        }
        if len <= 0 {
            return Err(Errno::EINVAL);
        }
    }

    Ok((start, start - 1 + len))
}
