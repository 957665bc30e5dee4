//! Error codes returned by the core and by filesystem drivers.
//!
//! Every fallible operation returns a raw POSIX errno wrapped in [`Errno`].
//! Drivers pass their own errnos through unchanged; the core only ever
//! produces the constants re-exported here.

use std::fmt;

/// A raw OS error code (`errno`).
///
/// Thin wrapper around `libc::c_int` so that error values stay comparable
/// and cheap to copy while still getting a readable `Debug` output.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub libc::c_int);

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Errno>;

impl Errno {
    /// No such file, directory, mount, descriptor or listener.
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    /// A path component exceeds `MAX_FILE_NAME` or a path exceeds `MAX_PATH`.
    pub const ENAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);
    /// Symbolic link recursion limit exceeded.
    pub const ELOOP: Errno = Errno(libc::ELOOP);
    /// The operation requires a directory.
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    /// The operation is not valid on a directory.
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    /// Node or mount is transitionally unavailable.
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    /// Invalid or disconnected file descriptor.
    pub const EBADF: Errno = Errno(libc::EBADF);
    /// Structurally malformed argument.
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    /// A non-blocking call would have suspended.
    pub const EWOULDBLOCK: Errno = Errno(libc::EWOULDBLOCK);
    /// Write to a FIFO without readers.
    pub const EPIPE: Errno = Errno(libc::EPIPE);
    /// Allocation failure.
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    /// The descriptor table is full.
    pub const EMFILE: Errno = Errno(libc::EMFILE);
    /// A transfer does not fit the supplied buffer.
    pub const EOVERFLOW: Errno = Errno(libc::EOVERFLOW);
    /// Hard link or rename across different mounts.
    pub const EXDEV: Errno = Errno(libc::EXDEV);
    /// The volume is read-only or the driver lacks a write-side hook.
    pub const EROFS: Errno = Errno(libc::EROFS);
    /// Caller lacks the required permission.
    pub const EACCES: Errno = Errno(libc::EACCES);
    /// The operation is not permitted on this object.
    pub const EPERM: Errno = Errno(libc::EPERM);
    /// The driver lacks the requested hook.
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    /// `ioctl` on a descriptor that accepts no such control operation.
    pub const ENOTTY: Errno = Errno(libc::ENOTTY);
    /// Writer-side open of a FIFO without readers in non-blocking mode.
    pub const ENXIO: Errno = Errno(libc::ENXIO);
    /// The target already exists.
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    /// Directory still has entries.
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    /// Wait was interrupted.
    pub const EINTR: Errno = Errno(libc::EINTR);
    /// Range or value out of representable bounds.
    pub const ERANGE: Errno = Errno(libc::ERANGE);
    /// A copy to or from a caller-supplied buffer failed.
    pub const EFAULT: Errno = Errno(libc::EFAULT);
    /// Locking conflict (flock-style non-blocking acquisition).
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    /// Seek on a non-seekable object.
    pub const ESPIPE: Errno = Errno(libc::ESPIPE);

    /// The raw errno value.
    pub const fn code(self) -> libc::c_int {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            libc::ENOENT => "ENOENT",
            libc::ENAMETOOLONG => "ENAMETOOLONG",
            libc::ELOOP => "ELOOP",
            libc::ENOTDIR => "ENOTDIR",
            libc::EISDIR => "EISDIR",
            libc::EBUSY => "EBUSY",
            libc::EBADF => "EBADF",
            libc::EINVAL => "EINVAL",
            libc::EWOULDBLOCK => "EWOULDBLOCK",
            libc::EPIPE => "EPIPE",
            libc::ENOMEM => "ENOMEM",
            libc::EMFILE => "EMFILE",
            libc::EOVERFLOW => "EOVERFLOW",
            libc::EXDEV => "EXDEV",
            libc::EROFS => "EROFS",
            libc::EACCES => "EACCES",
            libc::EPERM => "EPERM",
            libc::ENOSYS => "ENOSYS",
            libc::ENOTTY => "ENOTTY",
            libc::ENXIO => "ENXIO",
            libc::EEXIST => "EEXIST",
            libc::ENOTEMPTY => "ENOTEMPTY",
            libc::EINTR => "EINTR",
            libc::ERANGE => "ERANGE",
            libc::EFAULT => "EFAULT",
            libc::ESPIPE => "ESPIPE",
            _ => return None,
        })
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<Errno> for std::io::Error {
    fn from(errno: Errno) -> Self {
        std::io::Error::from_raw_os_error(errno.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_uses_symbolic_names() {
        assert_eq!(format!("{:?}", Errno::ENOENT), "ENOENT");
        assert_eq!(format!("{:?}", Errno(123456)), "Errno(123456)");
    }

    #[test]
    fn eagain_and_ewouldblock_compare_equal() {
        // POSIX allows them to alias; the core relies on it on Linux.
        assert_eq!(Errno::EAGAIN, Errno::EWOULDBLOCK);
    }
}
