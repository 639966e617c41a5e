//! Write-through attribute/directory cache (spec.md §4.2, §6, §8, §9).
//!
//! The cache brick never touches a host filesystem directly: it always
//! operates on its `cache` subvolume through the ordinary `Brick` vtable,
//! the same way any other brick would. Cached stat data rides along as an
//! xattr (`kfs.brick.cache.stat`, the 52-byte record from [`crate::stat`])
//! on a same-path "shell" node in the cache subvolume; a directory is
//! additionally marked complete with `kfs.brick.cache.readdir` once a full
//! `readdir` pass against the origin has been mirrored.
//!
//! Known hazard (spec.md §9): completeness is only tracked *within* a
//! single `readdir` call. A caller that issues multiple non-sequential
//! `readdir` calls (skipping part of the origin's entries) can still reach
//! "enumeration completed without any stop" on a later call and have the
//! directory wrongly marked complete. This brick does not attempt to fix
//! that; see the `readdir_marks_complete_even_with_skipped_offset` test,
//! which documents the wrong behavior rather than hiding it.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;
use parking_lot::Mutex;

use crate::brick::{Brick, BrickInstance};
use crate::context::Context;
use crate::errno::{Errno, KfsResult};
use crate::error::KfsError;
use crate::stat::StatRecord;
use crate::types::{DirEntry, DirEntryCollector, FileAttr, FileKind, StatFs};

const STAT_XATTR: &str = "kfs.brick.cache.stat";
const READDIR_XATTR: &str = "kfs.brick.cache.readdir";
const PLACEHOLDER_MODE: u32 = 0o600;
const PLACEHOLDER_DIR_MODE: u32 = 0o700;

#[derive(Clone, Copy)]
enum DirTag {
    Cache,
    Origin,
}

struct CacheDirHandle {
    tag: DirTag,
    fh: u64,
}

pub struct CacheBrick {
    origin: BrickInstance,
    cache: BrickInstance,
    dir_handles: Mutex<HashMap<u64, CacheDirHandle>>,
    next_handle: AtomicU64,
}

/// Wraps the caller's real collector so every entry the origin yields is
/// also mirrored into the cache subvolume as a shell node of the same node
/// type (spec.md §9's "placeholder of the same node type", symlinks
/// populated via `readlink` per spec.md §8).
struct CacheReaddirInterceptor<'a> {
    origin: &'a dyn Brick,
    cache: &'a dyn Brick,
    ctx: &'a Context,
    dir_path: &'a Path,
    inner: &'a mut dyn DirEntryCollector,
    stopped: bool,
}

impl<'a> DirEntryCollector for CacheReaddirInterceptor<'a> {
    fn emit(&mut self, entry: DirEntry) -> bool {
        let child_path = self.dir_path.join(&entry.name);
        if self.cache.getattr(self.ctx, &child_path).is_err() {
            let result = match entry.kind {
                FileKind::Directory => self
                    .cache
                    .mkdir(self.ctx, &child_path, PLACEHOLDER_DIR_MODE)
                    .map(|_| ()),
                FileKind::Symlink => self
                    .origin
                    .readlink(self.ctx, &child_path, 4096)
                    .and_then(|target| {
                        self.cache
                            .symlink(self.ctx, &child_path, Path::new(OsStr::from_bytes(&target)))
                            .map(|_| ())
                    }),
                _ => self
                    .cache
                    .mknod(self.ctx, &child_path, PLACEHOLDER_MODE, 0)
                    .map(|_| ()),
            };
            if let Err(e) = result {
                warn!("cache: failed to mirror directory entry {:?}: {e}", child_path);
            }
        }
        let stop = self.inner.emit(entry);
        if stop {
            self.stopped = true;
        }
        stop
    }
}

impl CacheBrick {
    fn write_cached_stat(&self, ctx: &Context, path: &Path, attr: &FileAttr) {
        let record = StatRecord::from_attr(attr);
        use zerocopy::IntoBytes;
        let bytes = record.as_bytes();
        if let Err(e) = self.cache.brick.setxattr(ctx, path, OsStr::new(STAT_XATTR), bytes, 0) {
            if e != Errno::ENOTSUP && e != Errno::ENOSYS {
                warn!("cache: failed to write cached stat for {:?}: {e}", path);
            }
        }
    }

    fn try_cached_stat(&self, ctx: &Context, path: &Path) -> Option<FileAttr> {
        let bytes = self.cache.brick.getxattr(ctx, path, OsStr::new(STAT_XATTR)).ok()?;
        let record = StatRecord::parse(&bytes)?;
        Some(record.to_attr(0))
    }

    fn create_cache_shell(&self, ctx: &Context, path: &Path, attr: &FileAttr) {
        let result = match attr.kind {
            FileKind::Directory => self.cache.brick.mkdir(ctx, path, PLACEHOLDER_DIR_MODE).map(|_| ()),
            FileKind::Symlink => self
                .origin
                .brick
                .readlink(ctx, path, 4096)
                .and_then(|target| {
                    self.cache
                        .brick
                        .symlink(ctx, path, Path::new(OsStr::from_bytes(&target)))
                        .map(|_| ())
                }),
            _ => self.cache.brick.mknod(ctx, path, PLACEHOLDER_MODE, 0).map(|_| ()),
        };
        if let Err(e) = result {
            if e != Errno::ENOTSUP && e != Errno::ENOSYS {
                warn!("cache: failed to create shell node for {:?}: {e}", path);
            }
        }
    }

    fn populate(&self, ctx: &Context, path: &Path, attr: &FileAttr) {
        if self.cache.brick.getattr(ctx, path).is_err() {
            self.create_cache_shell(ctx, path, attr);
        }
        self.write_cached_stat(ctx, path, attr);
    }

    /// Used by the creation group (`mknod`, `mkdir`, `symlink`, `link`,
    /// `create`): spec.md says plainly "a cache-side failure is logged and
    /// the caller sees success" for this group, with no exception for
    /// ENOENT.
    fn mirror_best_effort<F>(&self, path: &Path, f: F)
    where
        F: FnOnce() -> KfsResult<()>,
    {
        if let Err(e) = f() {
            warn!("cache: mirrored operation failed for {:?}: {e}", path);
        }
    }

    /// Used by `unlink`/`rmdir`/`rename`: spec.md only calls for logging a
    /// failure "other than 'no such entry'" for this group, since the
    /// cache-side shell may simply never have existed.
    fn mirror_best_effort_ignore_enoent<F>(&self, path: &Path, f: F)
    where
        F: FnOnce() -> KfsResult<()>,
    {
        if let Err(e) = f() {
            if e != Errno::ENOENT {
                warn!("cache: mirrored operation failed for {:?}: {e}", path);
            }
        }
    }
}

impl Brick for CacheBrick {
    fn getattr(&self, ctx: &Context, path: &Path) -> KfsResult<FileAttr> {
        if let Some(attr) = self.try_cached_stat(ctx, path) {
            return Ok(attr);
        }
        let attr = self.origin.brick.getattr(ctx, path)?;
        self.populate(ctx, path, &attr);
        Ok(attr)
    }

    fn readlink(&self, ctx: &Context, path: &Path, size: u32) -> KfsResult<Vec<u8>> {
        match self.cache.brick.readlink(ctx, path, size) {
            Ok(target) => return Ok(target),
            Err(Errno::EINVAL) => {
                let _ = self.cache.brick.unlink(ctx, path);
            }
            Err(_) => {}
        }
        let target = self.origin.brick.readlink(ctx, path, size)?;
        if (target.len() as u32) < size {
            let target_path: &Path = Path::new(OsStr::from_bytes(&target));
            if let Err(e) = self.cache.brick.symlink(ctx, path, target_path) {
                if e != Errno::ENOTSUP && e != Errno::ENOSYS {
                    warn!("cache: failed to mirror symlink {:?}: {e}", path);
                }
            }
        }
        Ok(target)
    }

    fn mknod(&self, ctx: &Context, path: &Path, mode: u32, rdev: u32) -> KfsResult<FileAttr> {
        let attr = self.origin.brick.mknod(ctx, path, mode, rdev)?;
        self.mirror_best_effort(path, || self.cache.brick.mknod(ctx, path, PLACEHOLDER_MODE, rdev).map(|_| ()));
        Ok(attr)
    }

    fn mkdir(&self, ctx: &Context, path: &Path, mode: u32) -> KfsResult<FileAttr> {
        let attr = self.origin.brick.mkdir(ctx, path, mode)?;
        self.mirror_best_effort(path, || self.cache.brick.mkdir(ctx, path, PLACEHOLDER_DIR_MODE).map(|_| ()));
        Ok(attr)
    }

    fn unlink(&self, ctx: &Context, path: &Path) -> KfsResult<()> {
        self.origin.brick.unlink(ctx, path)?;
        self.mirror_best_effort_ignore_enoent(path, || self.cache.brick.unlink(ctx, path));
        Ok(())
    }

    fn rmdir(&self, ctx: &Context, path: &Path) -> KfsResult<()> {
        self.origin.brick.rmdir(ctx, path)?;
        self.mirror_best_effort_ignore_enoent(path, || self.cache.brick.rmdir(ctx, path));
        Ok(())
    }

    fn symlink(&self, ctx: &Context, path: &Path, target: &Path) -> KfsResult<FileAttr> {
        let attr = self.origin.brick.symlink(ctx, path, target)?;
        self.mirror_best_effort(path, || self.cache.brick.symlink(ctx, path, target).map(|_| ()));
        Ok(attr)
    }

    fn rename(&self, ctx: &Context, from: &Path, to: &Path) -> KfsResult<()> {
        self.origin.brick.rename(ctx, from, to)?;
        self.mirror_best_effort_ignore_enoent(from, || self.cache.brick.rename(ctx, from, to));
        Ok(())
    }

    fn link(&self, ctx: &Context, path: &Path, newpath: &Path) -> KfsResult<FileAttr> {
        let attr = self.origin.brick.link(ctx, path, newpath)?;
        self.mirror_best_effort(newpath, || self.cache.brick.link(ctx, path, newpath).map(|_| ()));
        Ok(attr)
    }

    fn chmod(&self, ctx: &Context, path: &Path, mode: u32) -> KfsResult<()> {
        self.origin.brick.chmod(ctx, path, mode)?;
        if let Ok(mut attr) = self.getattr(ctx, path) {
            attr.perm = (mode & 0o7777) as u16;
            self.write_cached_stat(ctx, path, &attr);
        }
        Ok(())
    }

    fn chown(&self, ctx: &Context, path: &Path, uid: Option<u32>, gid: Option<u32>) -> KfsResult<()> {
        self.origin.brick.chown(ctx, path, uid, gid)?;
        if let Ok(mut attr) = self.getattr(ctx, path) {
            if let Some(uid) = uid {
                attr.uid = uid;
            }
            if let Some(gid) = gid {
                attr.gid = gid;
            }
            self.write_cached_stat(ctx, path, &attr);
        }
        Ok(())
    }

    fn truncate(&self, ctx: &Context, path: &Path, size: u64) -> KfsResult<()> {
        self.origin.brick.truncate(ctx, path, size)?;
        match self.cache.brick.truncate(ctx, path, size) {
            Ok(()) => {
                if let Ok(mut attr) = self.getattr(ctx, path) {
                    attr.size = size;
                    self.write_cached_stat(ctx, path, &attr);
                }
            }
            Err(_) => {
                let _ = self.cache.brick.unlink(ctx, path);
            }
        }
        Ok(())
    }

    fn utimens(
        &self,
        ctx: &Context,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> KfsResult<()> {
        self.origin.brick.utimens(ctx, path, atime, mtime)?;
        if let Ok(mut attr) = self.getattr(ctx, path) {
            if let Some(atime) = atime {
                attr.atime = atime;
            }
            if let Some(mtime) = mtime {
                attr.mtime = mtime;
            }
            self.write_cached_stat(ctx, path, &attr);
        }
        Ok(())
    }

    fn open(&self, ctx: &Context, path: &Path, flags: i32) -> KfsResult<u64> {
        self.origin.brick.open(ctx, path, flags)
    }

    fn read(&self, ctx: &Context, path: &Path, fh: u64, offset: i64, size: u32) -> KfsResult<Vec<u8>> {
        self.origin.brick.read(ctx, path, fh, offset, size)
    }

    fn write(&self, ctx: &Context, path: &Path, fh: u64, offset: i64, data: &[u8]) -> KfsResult<u32> {
        self.origin.brick.write(ctx, path, fh, offset, data)
    }

    fn statfs(&self, ctx: &Context, path: &Path) -> KfsResult<StatFs> {
        self.origin.brick.statfs(ctx, path)
    }

    fn flush(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        self.origin.brick.flush(ctx, path, fh)
    }

    fn release(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        self.origin.brick.release(ctx, path, fh)
    }

    fn fsync(&self, ctx: &Context, path: &Path, fh: u64, datasync: bool) -> KfsResult<()> {
        self.origin.brick.fsync(ctx, path, fh, datasync)
    }

    fn setxattr(&self, ctx: &Context, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> KfsResult<()> {
        self.origin.brick.setxattr(ctx, path, name, value, flags)
    }

    fn getxattr(&self, ctx: &Context, path: &Path, name: &OsStr) -> KfsResult<Vec<u8>> {
        self.origin.brick.getxattr(ctx, path, name)
    }

    fn listxattr(&self, ctx: &Context, path: &Path) -> KfsResult<Vec<Vec<u8>>> {
        self.origin.brick.listxattr(ctx, path)
    }

    fn removexattr(&self, ctx: &Context, path: &Path, name: &OsStr) -> KfsResult<()> {
        self.origin.brick.removexattr(ctx, path, name)
    }

    fn opendir(&self, ctx: &Context, path: &Path, flags: i32) -> KfsResult<u64> {
        let marker_present = self
            .cache
            .brick
            .getxattr(ctx, path, OsStr::new(READDIR_XATTR))
            .is_ok();
        let (tag, fh) = if marker_present {
            (DirTag::Cache, self.cache.brick.opendir(ctx, path, flags)?)
        } else {
            (DirTag::Origin, self.origin.brick.opendir(ctx, path, flags)?)
        };
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.dir_handles.lock().insert(handle, CacheDirHandle { tag, fh });
        Ok(handle)
    }

    fn readdir(
        &self,
        ctx: &Context,
        path: &Path,
        fh: u64,
        offset: u64,
        collector: &mut dyn DirEntryCollector,
    ) -> KfsResult<()> {
        let (tag, inner_fh) = {
            let handles = self.dir_handles.lock();
            let handle = handles.get(&fh).ok_or(Errno::EINVAL)?;
            (handle.tag, handle.fh)
        };
        match tag {
            DirTag::Cache => self.cache.brick.readdir(ctx, path, inner_fh, offset, collector),
            DirTag::Origin => {
                let mut interceptor = CacheReaddirInterceptor {
                    origin: self.origin.brick.as_ref(),
                    cache: self.cache.brick.as_ref(),
                    ctx,
                    dir_path: path,
                    inner: collector,
                    stopped: false,
                };
                let result = self.origin.brick.readdir(ctx, path, inner_fh, offset, &mut interceptor);
                let reached_end = result.is_ok() && !interceptor.stopped;
                if reached_end {
                    if let Err(e) =
                        self.cache
                            .brick
                            .setxattr(ctx, path, OsStr::new(READDIR_XATTR), b"1", 0)
                    {
                        if e != Errno::ENOTSUP && e != Errno::ENOSYS {
                            warn!("cache: failed to mark {:?} complete: {e}", path);
                        }
                    }
                }
                result
            }
        }
    }

    fn releasedir(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        if let Some(handle) = self.dir_handles.lock().remove(&fh) {
            match handle.tag {
                DirTag::Cache => self.cache.brick.releasedir(ctx, path, handle.fh),
                DirTag::Origin => self.origin.brick.releasedir(ctx, path, handle.fh),
            }
        } else {
            Ok(())
        }
    }

    fn fsyncdir(&self, ctx: &Context, path: &Path, fh: u64, datasync: bool) -> KfsResult<()> {
        self.origin.brick.fsyncdir(ctx, path, fh, datasync)
    }

    fn access(&self, ctx: &Context, path: &Path, mask: i32) -> KfsResult<()> {
        self.origin.brick.access(ctx, path, mask)
    }

    fn create(&self, ctx: &Context, path: &Path, mode: u32, flags: i32) -> KfsResult<(u64, FileAttr)> {
        let (fh, attr) = self.origin.brick.create(ctx, path, mode, flags)?;
        self.mirror_best_effort(path, || self.cache.brick.mknod(ctx, path, PLACEHOLDER_MODE, 0).map(|_| ()));
        Ok((fh, attr))
    }

    fn ftruncate(&self, ctx: &Context, path: &Path, fh: u64, size: u64) -> KfsResult<()> {
        self.origin.brick.ftruncate(ctx, path, fh, size)
    }

    fn fgetattr(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<FileAttr> {
        self.origin.brick.fgetattr(ctx, path, fh)
    }

    fn lock(
        &self,
        ctx: &Context,
        path: &Path,
        fh: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
    ) -> KfsResult<()> {
        self.origin.brick.lock(ctx, path, fh, start, end, typ, pid, sleep)
    }

    fn bmap(&self, ctx: &Context, path: &Path, blocksize: u64, idx: u64) -> KfsResult<u64> {
        self.origin.brick.bmap(ctx, path, blocksize, idx)
    }

    fn ioctl(
        &self,
        ctx: &Context,
        path: &Path,
        fh: u64,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
    ) -> KfsResult<Vec<u8>> {
        self.origin.brick.ioctl(ctx, path, fh, cmd, in_data, out_size)
    }

    fn poll(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<u32> {
        self.origin.brick.poll(ctx, path, fh)
    }

    fn halt(&self) {
        self.cache.halt_once();
        self.origin.halt_once();
    }
}

pub fn init(
    _section: &ini::Properties,
    name: &str,
    mut subvolumes: Vec<BrickInstance>,
) -> Result<Arc<dyn Brick>, KfsError> {
    if subvolumes.len() != 2 {
        return Err(KfsError::Config(format!(
            "'cache' brick '{name}' requires exactly 2 subvolumes (origin, cache), got {}",
            subvolumes.len()
        )));
    }
    let cache = subvolumes.remove(1);
    let origin = subvolumes.remove(0);
    Ok(Arc::new(CacheBrick {
        origin,
        cache,
        dir_handles: Mutex::new(HashMap::new()),
        next_handle: AtomicU64::new(1),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bricks::posix;

    fn posix_over(dir: &Path) -> BrickInstance {
        let mut conf = ini::Ini::new();
        conf.with_section(Some("p")).set("path", dir.to_str().unwrap());
        let props = conf.section(Some("p")).unwrap().clone();
        BrickInstance::new(posix::init(&props, "p", vec![]).unwrap(), "p".to_string())
    }

    fn cache_over(origin: &Path, cache: &Path) -> Arc<dyn Brick> {
        let subvols = vec![posix_over(origin), posix_over(cache)];
        let props = ini::Ini::new().general_section().clone();
        init(&props, "cache", subvols).unwrap()
    }

    #[test]
    fn getattr_populates_and_then_serves_from_cache() {
        let origin = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(origin.path().join("f"), b"hello").unwrap();
        let brick = cache_over(origin.path(), cache.path());
        let ctx = Context::new(0, 0, 0);

        let attr1 = brick.getattr(&ctx, Path::new("/f")).unwrap();
        assert_eq!(attr1.size, 5);
        assert!(cache.path().join("f").exists());

        // Remove the origin file; a correctly-populated cache should still
        // answer getattr from the xattr it wrote on the first call.
        std::fs::remove_file(origin.path().join("f")).unwrap();
        let attr2 = brick.getattr(&ctx, Path::new("/f")).unwrap();
        assert_eq!(attr2.size, 5);
    }

    #[test]
    fn truncate_failure_on_cache_side_does_not_fail_the_call() {
        let origin = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(origin.path().join("f"), b"hello world").unwrap();
        let brick = cache_over(origin.path(), cache.path());
        let ctx = Context::new(0, 0, 0);
        brick.getattr(&ctx, Path::new("/f")).unwrap();
        // No cache-side file exists to truncate (cache.mknod shell wasn't
        // separately created with real byte content), the cache truncate
        // is still best-effort and origin's success is what's returned.
        assert!(brick.truncate(&ctx, Path::new("/f"), 1).is_ok());
        assert_eq!(std::fs::metadata(origin.path().join("f")).unwrap().len(), 1);
    }

    #[test]
    fn readdir_marks_complete_even_with_skipped_offset() {
        // Known hazard documented in spec.md §9: a caller that starts its
        // (only) readdir call at a nonzero offset still sees the call run
        // to completion, so the directory gets marked complete even though
        // earlier entries were never visited by this brick.
        let origin = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::write(origin.path().join("a"), b"").unwrap();
        std::fs::write(origin.path().join("b"), b"").unwrap();
        let brick = cache_over(origin.path(), cache.path());
        let ctx = Context::new(0, 0, 0);

        let fh = brick.opendir(&ctx, Path::new("/"), 0).unwrap();
        struct Sink;
        impl DirEntryCollector for Sink {
            fn emit(&mut self, _entry: DirEntry) -> bool {
                false
            }
        }
        let mut sink = Sink;
        // Skip past whatever the first entry would have been.
        brick.readdir(&ctx, Path::new("/"), fh, 1, &mut sink).unwrap();
        brick.releasedir(&ctx, Path::new("/"), fh).unwrap();

        let marker = xattr::get(cache.path(), READDIR_XATTR).unwrap();
        assert!(marker.is_some(), "marker set despite skipping an entry");
    }
}
