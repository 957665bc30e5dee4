//! Open mode handling for descriptors.

use std::fmt;
use std::fmt::Formatter;
use std::fmt::LowerHex;
use std::fmt::UpperHex;

/// How the file should be opened: read-only, write-only, or read-write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum OpenAccMode {
    /// Open file for reading only.
    O_RDONLY = libc::O_RDONLY,
    /// Open file for writing only.
    O_WRONLY = libc::O_WRONLY,
    /// Open file for reading and writing.
    O_RDWR = libc::O_RDWR,
}

/// Open flags as carried by a descriptor.
///
/// The numeric values are the raw `O_*` constants, so drivers can match on
/// them directly. One extra, core-private bit is squeezed in:
/// [`OpenFlags::DISCONNECTED`], set when the descriptor has been cut off
/// from its mount (forced unmount) and may no longer be acquired.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    /// Marks a descriptor that can no longer be acquired; it is closed as
    /// soon as its last outstanding reference is released.
    pub const DISCONNECTED: i32 = 1 << 30;

    /// File access mode.
    pub fn acc_mode(self) -> OpenAccMode {
        match self.0 & libc::O_ACCMODE {
            libc::O_RDONLY => OpenAccMode::O_RDONLY,
            libc::O_WRONLY => OpenAccMode::O_WRONLY,
            libc::O_RDWR => OpenAccMode::O_RDWR,
            _ => {
                // Impossible combination of flags.
                // Do not panic because the field is public.
                OpenAccMode::O_RDONLY
            }
        }
    }

    /// Whether reads are permitted.
    pub fn readable(self) -> bool {
        matches!(self.acc_mode(), OpenAccMode::O_RDONLY | OpenAccMode::O_RDWR)
    }

    /// Whether writes are permitted.
    pub fn writable(self) -> bool {
        matches!(self.acc_mode(), OpenAccMode::O_WRONLY | OpenAccMode::O_RDWR)
    }

    /// Whether `O_NONBLOCK` is set.
    pub fn non_blocking(self) -> bool {
        self.0 & libc::O_NONBLOCK != 0
    }

    /// Whether `O_APPEND` is set.
    pub fn append(self) -> bool {
        self.0 & libc::O_APPEND != 0
    }

    /// Whether the descriptor has been disconnected from its mount.
    pub fn disconnected(self) -> bool {
        self.0 & Self::DISCONNECTED != 0
    }

    /// The status flags `F_SETFL` may change.
    pub fn settable_mask() -> i32 {
        libc::O_APPEND | libc::O_NONBLOCK
    }
}

impl LowerHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl UpperHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        UpperHex::fmt(&self.0, f)
    }
}
