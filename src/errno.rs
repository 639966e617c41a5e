//! POSIX error taxonomy shared by every brick operation (spec.md §6, §7).
//!
//! Grounded on `fuser`'s own `src/ll/errno.rs`, which keeps a flat table of
//! `libc` error constants under a single wrapper type; we only need the
//! subset spec.md §6 names explicitly, plus transparent pass-through of
//! whatever a subvolume or the host returned.

use std::fmt;

/// A POSIX error code, stored as the positive `errno` value.
///
/// The mount bridge negates it before handing it back to the kernel (the
/// same convention `fuser::Request`'s reply types use internally).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const ENOTSUP: Errno = Errno(libc::ENOTSUP);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const ENOBUFS: Errno = Errno(libc::ENOBUFS);
    /// Repurposed per spec.md §6: "no subvolumes available" in the mirror brick.
    pub const ECHILD: Errno = Errno(libc::ECHILD);
    pub const EREMOTEIO: Errno = Errno(libc::EREMOTEIO);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ERANGE: Errno = Errno(libc::ERANGE);
    pub const ENODATA: Errno = Errno(libc::ENODATA);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);

    /// The subset of codes spec.md §7 calls "transient connection" errors:
    /// connection refused, not connected, interrupted, unreachable, timed
    /// out, address-in-use, network-down.
    pub fn is_transient(self) -> bool {
        matches!(
            self.0,
            libc::ECONNREFUSED
                | libc::ENOTCONN
                | libc::EINTR
                | libc::EHOSTUNREACH
                | libc::ETIMEDOUT
                | libc::EADDRINUSE
                | libc::ENETDOWN
        )
    }

    /// The negated form handed back through the mount bridge.
    pub fn negated(self) -> i32 {
        -self.0
    }
}

impl From<std::io::Error> for Errno {
    fn from(e: std::io::Error) -> Self {
        Errno(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl std::error::Error for Errno {}

/// Result type returned by every [`crate::brick::Brick`] operation.
pub type KfsResult<T> = Result<T, Errno>;
