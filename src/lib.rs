//! Virtual file system core.
//!
//! This crate is the in-memory heart of a VFS: the reference-counted node
//! graph and its lifecycle, the path resolution engine, per-process
//! descriptor tables, advisory locks, a generational directory-entry
//! cache, a ring-buffered pipe engine, and a node-event notification
//! service. Concrete filesystems plug in underneath through the
//! [`FileSystem`]/[`Volume`]/[`NodeOps`] driver traits; block I/O, page
//! caching and on-disk layout stay on their side of that seam.
//!
//! All global state lives in a [`Vfs`] value; per-process state lives in
//! [`IoContext`] values. Every entry point takes both explicitly.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

/// Longest accepted path, terminator included.
pub const MAX_PATH: usize = 1024;
/// Longest accepted single path component, terminator included.
pub const MAX_FILE_NAME: usize = 256;
/// Ceiling on nested symbolic-link traversal.
pub const MAX_SYMLINKS: u32 = 16;

mod advisory;
mod context;
mod entry_cache;
mod errno;
mod fd;
mod fifo;
mod fs;
mod ids;
mod monitor;
mod mount;
mod node;
mod node_table;
mod open_flags;
mod resolver;
mod select;
mod stat;
mod unused;
mod vfs;

pub use crate::advisory::FileLock;
pub use crate::advisory::LockOwner;
pub use crate::context::DEFAULT_FD_TABLE_SIZE;
pub use crate::context::DEFAULT_MAX_MONITORS;
pub use crate::context::IoContext;
pub use crate::context::MAX_FD_TABLE_SIZE;
pub use crate::errno::Errno;
pub use crate::errno::Result;
pub use crate::fd::Descriptor;
pub use crate::fd::Whence;
pub use crate::fifo::ATOMIC_WRITE_SIZE as FIFO_ATOMIC_WRITE_SIZE;
pub use crate::fifo::BUFFER_CAPACITY as FIFO_BUFFER_CAPACITY;
pub use crate::fs::BoxedCookie;
pub use crate::fs::Cookie;
pub use crate::fs::DirCookie;
pub use crate::fs::FileSystem;
pub use crate::fs::LoadedNode;
pub use crate::fs::MountContext;
pub use crate::fs::MountedVolume;
pub use crate::fs::NodeOps;
pub use crate::fs::PublishFlags;
pub use crate::fs::Volume;
pub use crate::ids::ContextId;
pub use crate::ids::DeviceId;
pub use crate::ids::FdId;
pub use crate::ids::NodeId;
pub use crate::ids::TeamId;
pub use crate::monitor::AttrCause;
pub use crate::monitor::EventListener;
pub use crate::monitor::NodeEvent;
pub use crate::monitor::NodeMonitorService;
pub use crate::monitor::PortToken;
pub use crate::monitor::WatchFlags;
pub use crate::monitor::notify_query_entry_created;
pub use crate::monitor::notify_query_entry_removed;
pub use crate::mount::Mount;
pub use crate::mount::MountFlags;
pub use crate::mount::UnmountFlags;
pub use crate::node::Vnode;
pub use crate::node::VnodeFlags;
pub use crate::open_flags::OpenAccMode;
pub use crate::open_flags::OpenFlags;
pub use crate::resolver::normalize_path;
pub use crate::select::SelectEvents;
pub use crate::select::SelectHandle;
pub use crate::stat::DirEntry;
pub use crate::stat::FileType;
pub use crate::stat::FsInfo;
pub use crate::stat::FsInfoFields;
pub use crate::stat::NodeStat;
pub use crate::stat::StatFields;
pub use crate::unused::ResourceLevel;
pub use crate::vfs::F_DUPFD_CLOFORK;
pub use crate::vfs::FD_CLOEXEC;
pub use crate::vfs::FD_CLOFORK;
pub use crate::vfs::FcntlArg;
pub use crate::vfs::Flock;
pub use crate::vfs::NodeGuard;
pub use crate::vfs::Vfs;
pub use crate::vfs::VfsOptions;
