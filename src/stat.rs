//! Node metadata as exchanged with filesystem drivers.

use std::time::SystemTime;

use bitflags::bitflags;

use crate::ids::{DeviceId, NodeId};

/// Kind of a file system object, as encoded in the `S_IFMT` bits of a mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Regular file.
    RegularFile,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Named pipe.
    Fifo,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Unix domain socket.
    Socket,
}

impl FileType {
    /// Decodes the type from the `S_IFMT` bits of a raw mode.
    pub fn from_mode(mode: u32) -> Option<FileType> {
        Some(match mode & libc::S_IFMT {
            libc::S_IFREG => FileType::RegularFile,
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFIFO => FileType::Fifo,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFSOCK => FileType::Socket,
            _ => return None,
        })
    }

    /// The `S_IFMT` bits for this type.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::RegularFile => libc::S_IFREG,
            FileType::Directory => libc::S_IFDIR,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Fifo => libc::S_IFIFO,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
            FileType::Socket => libc::S_IFSOCK,
        }
    }
}

/// Metadata of one node, the shape `read_stat`/`write_stat` exchange.
#[derive(Clone, Debug)]
pub struct NodeStat {
    /// Volume the node lives on. Filled in by the core.
    pub device: DeviceId,
    /// Node id on that volume. Filled in by the core.
    pub node: NodeId,
    /// File type and permission bits.
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Size in bytes.
    pub size: i64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last data modification time.
    pub mtime: SystemTime,
    /// Last status change time.
    pub ctime: SystemTime,
    /// Creation time.
    pub crtime: SystemTime,
}

impl NodeStat {
    /// A zeroed stat for a node of the given type, used as a template by
    /// simple drivers.
    pub fn for_mode(device: DeviceId, node: NodeId, mode: u32) -> NodeStat {
        let now = SystemTime::now();
        NodeStat {
            device,
            node,
            mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }
}

bitflags! {
    /// Which fields of a [`NodeStat`] a `write_stat` call intends to change,
    /// and which fields a stat-changed notification reports as modified.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatFields: u32 {
        /// Permission bits.
        const MODE = 1 << 0;
        /// Owning user.
        const UID = 1 << 1;
        /// Owning group.
        const GID = 1 << 2;
        /// File size.
        const SIZE = 1 << 3;
        /// Access time.
        const ATIME = 1 << 4;
        /// Modification time.
        const MTIME = 1 << 5;
        /// Creation time.
        const CRTIME = 1 << 6;
        /// Status change time.
        const CTIME = 1 << 7;
    }
}

/// One entry returned while iterating a directory (or attribute/index/query
/// cookie).
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// Volume of the entry's node.
    pub device: DeviceId,
    /// The entry's node id.
    pub node: NodeId,
    /// Entry name, without any path separators.
    pub name: String,
}

/// Information describing a mounted volume, as reported by `read_fs_info`.
#[derive(Clone, Debug, Default)]
pub struct FsInfo {
    /// Free-form volume name.
    pub volume_name: String,
    /// Capacity in blocks; zero for purely virtual volumes.
    pub total_blocks: u64,
    /// Free blocks.
    pub free_blocks: u64,
    /// Block size in bytes.
    pub block_size: u32,
    /// Driver flags (read-only etc.), driver-defined.
    pub flags: u32,
}

bitflags! {
    /// Fields of [`FsInfo`] affected by a `write_fs_info` call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FsInfoFields: u32 {
        /// The volume name.
        const NAME = 1 << 0;
    }
}
