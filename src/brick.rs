//! The brick operation vtable (spec.md §3, §4.1).
//!
//! Modeled directly on `fuser::Filesystem` (`src/lib.rs` in the teacher):
//! every method has a default body, so a brick only overrides what it
//! actually supports. Unlike the kernel-facing `Filesystem` trait, every
//! operation here is addressed by logical path rather than inode — the
//! brick engine is path-based per spec.md, and it's the mount bridge's job
//! (§12) to translate the kernel's inode-addressed calls into paths.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;

use crate::context::Context;
use crate::errno::{Errno, KfsResult};
use crate::types::{DirEntryCollector, FileAttr, StatFs};

/// A brick stacked into the composition tree, with the name it was
/// constructed under (used in log messages and in the registry's DAG
/// memoization).
///
/// The registry's memoization lets one built section be referenced as a
/// subvolume of more than one parent (spec.md §3's "directed acyclic
/// graph"), so every clone of a given `BrickInstance` shares the same
/// `halted` flag: whichever parent tears its tree down first actually
/// halts the shared node, and every other parent's cascade through it is a
/// no-op. Without this, a diamond-shaped tree would halt a shared
/// subvolume once per parent instead of exactly once overall.
#[derive(Clone)]
pub struct BrickInstance {
    pub brick: Arc<dyn Brick>,
    pub name: String,
    halted: Arc<AtomicBool>,
}

impl BrickInstance {
    pub fn new(brick: Arc<dyn Brick>, name: String) -> Self {
        BrickInstance {
            brick,
            name,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Halts the underlying brick the first time this is called on any
    /// clone of this instance; subsequent calls (from another parent
    /// sharing the same subvolume) are no-ops.
    pub fn halt_once(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            self.brick.halt();
        }
    }
}

pub trait Brick: Send + Sync {
    fn getattr(&self, _ctx: &Context, path: &Path) -> KfsResult<FileAttr> {
        warn!("[not implemented] getattr {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, _ctx: &Context, path: &Path, _size: u32) -> KfsResult<Vec<u8>> {
        warn!("[not implemented] readlink {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn mknod(&self, _ctx: &Context, path: &Path, _mode: u32, _rdev: u32) -> KfsResult<FileAttr> {
        warn!("[not implemented] mknod {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn mkdir(&self, _ctx: &Context, path: &Path, _mode: u32) -> KfsResult<FileAttr> {
        warn!("[not implemented] mkdir {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, _ctx: &Context, path: &Path) -> KfsResult<()> {
        warn!("[not implemented] unlink {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, _ctx: &Context, path: &Path) -> KfsResult<()> {
        warn!("[not implemented] rmdir {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn symlink(&self, _ctx: &Context, path: &Path, _target: &Path) -> KfsResult<FileAttr> {
        warn!("[not implemented] symlink {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn rename(&self, _ctx: &Context, from: &Path, _to: &Path) -> KfsResult<()> {
        warn!("[not implemented] rename {}", from.display());
        Err(Errno::ENOSYS)
    }

    fn link(&self, _ctx: &Context, path: &Path, _newpath: &Path) -> KfsResult<FileAttr> {
        warn!("[not implemented] link {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn chmod(&self, _ctx: &Context, path: &Path, _mode: u32) -> KfsResult<()> {
        warn!("[not implemented] chmod {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn chown(
        &self,
        _ctx: &Context,
        path: &Path,
        _uid: Option<u32>,
        _gid: Option<u32>,
    ) -> KfsResult<()> {
        warn!("[not implemented] chown {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn truncate(&self, _ctx: &Context, path: &Path, _size: u64) -> KfsResult<()> {
        warn!("[not implemented] truncate {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn open(&self, _ctx: &Context, _path: &Path, _flags: i32) -> KfsResult<u64> {
        Ok(0)
    }

    fn read(&self, _ctx: &Context, path: &Path, _fh: u64, _offset: i64, _size: u32) -> KfsResult<Vec<u8>> {
        warn!("[not implemented] read {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn write(&self, _ctx: &Context, path: &Path, _fh: u64, _offset: i64, _data: &[u8]) -> KfsResult<u32> {
        warn!("[not implemented] write {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn statfs(&self, _ctx: &Context, _path: &Path) -> KfsResult<StatFs> {
        Ok(StatFs::default())
    }

    fn flush(&self, _ctx: &Context, path: &Path, _fh: u64) -> KfsResult<()> {
        warn!("[not implemented] flush {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn release(&self, _ctx: &Context, _path: &Path, _fh: u64) -> KfsResult<()> {
        Ok(())
    }

    fn fsync(&self, _ctx: &Context, path: &Path, _fh: u64, _datasync: bool) -> KfsResult<()> {
        warn!("[not implemented] fsync {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn setxattr(
        &self,
        _ctx: &Context,
        path: &Path,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
    ) -> KfsResult<()> {
        warn!("[not implemented] setxattr {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn getxattr(&self, _ctx: &Context, path: &Path, _name: &OsStr) -> KfsResult<Vec<u8>> {
        warn!("[not implemented] getxattr {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn listxattr(&self, _ctx: &Context, path: &Path) -> KfsResult<Vec<Vec<u8>>> {
        warn!("[not implemented] listxattr {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn removexattr(&self, _ctx: &Context, path: &Path, _name: &OsStr) -> KfsResult<()> {
        warn!("[not implemented] removexattr {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn opendir(&self, _ctx: &Context, _path: &Path, _flags: i32) -> KfsResult<u64> {
        Ok(0)
    }

    fn readdir(
        &self,
        _ctx: &Context,
        path: &Path,
        _fh: u64,
        _offset: u64,
        _collector: &mut dyn DirEntryCollector,
    ) -> KfsResult<()> {
        warn!("[not implemented] readdir {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn releasedir(&self, _ctx: &Context, _path: &Path, _fh: u64) -> KfsResult<()> {
        Ok(())
    }

    fn fsyncdir(&self, _ctx: &Context, path: &Path, _fh: u64, _datasync: bool) -> KfsResult<()> {
        warn!("[not implemented] fsyncdir {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn access(&self, _ctx: &Context, path: &Path, _mask: i32) -> KfsResult<()> {
        warn!("[not implemented] access {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn create(&self, _ctx: &Context, path: &Path, _mode: u32, _flags: i32) -> KfsResult<(u64, FileAttr)> {
        warn!("[not implemented] create {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn ftruncate(&self, _ctx: &Context, path: &Path, _fh: u64, _size: u64) -> KfsResult<()> {
        warn!("[not implemented] ftruncate {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn fgetattr(&self, _ctx: &Context, path: &Path, _fh: u64) -> KfsResult<FileAttr> {
        warn!("[not implemented] fgetattr {}", path.display());
        Err(Errno::ENOSYS)
    }

    #[allow(clippy::too_many_arguments)]
    fn lock(
        &self,
        _ctx: &Context,
        path: &Path,
        _fh: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        _pid: u32,
        _sleep: bool,
    ) -> KfsResult<()> {
        warn!("[not implemented] lock {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn utimens(
        &self,
        _ctx: &Context,
        path: &Path,
        _atime: Option<SystemTime>,
        _mtime: Option<SystemTime>,
    ) -> KfsResult<()> {
        warn!("[not implemented] utimens {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn bmap(&self, _ctx: &Context, path: &Path, _blocksize: u64, _idx: u64) -> KfsResult<u64> {
        warn!("[not implemented] bmap {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn ioctl(
        &self,
        _ctx: &Context,
        path: &Path,
        _fh: u64,
        _cmd: u32,
        _in_data: &[u8],
        _out_size: u32,
    ) -> KfsResult<Vec<u8>> {
        warn!("[not implemented] ioctl {}", path.display());
        Err(Errno::ENOSYS)
    }

    fn poll(&self, _ctx: &Context, path: &Path, _fh: u64) -> KfsResult<u32> {
        warn!("[not implemented] poll {}", path.display());
        Err(Errno::ENOSYS)
    }

    /// Lifecycle hook, called top-down when the brick tree is torn down
    /// (clean unmount) or unwound (a sibling failed to `init`). Default is
    /// a no-op; bricks holding real resources (the TCP brick's socket)
    /// override it.
    fn halt(&self) {}
}
