//! Identity newtypes for volumes and nodes.
//!
//! The node table keys everything on the `(DeviceId, NodeId)` pair; keeping
//! both as distinct types prevents the classic dev/ino argument swap.

use std::fmt;

/// Identifies a mounted volume. Assigned monotonically at mount time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub i32);

/// Identifies a node within one volume. Chosen by the filesystem driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub i64);

/// Identifies a process ("team") for lock ownership and event reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeamId(pub i32);

/// Identifies one I/O context. Assigned monotonically at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

/// Identifies one descriptor object (not a slot index), for flock-style
/// lock ownership and mandatory-lock bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FdId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<i32> for DeviceId {
    fn from(value: i32) -> Self {
        DeviceId(value)
    }
}

impl From<i64> for NodeId {
    fn from(value: i64) -> Self {
        NodeId(value)
    }
}
