//! Single-subvolume forwarder (spec.md §2). Serves as the template new
//! brick kinds are copied from, the same role `examples/null.rs` plays in
//! the teacher's own example set.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::brick::{Brick, BrickInstance};
use crate::context::Context;
use crate::errno::KfsResult;
use crate::error::KfsError;
use crate::types::{DirEntryCollector, FileAttr, StatFs};

pub struct PassthroughBrick {
    sub: BrickInstance,
}

impl Brick for PassthroughBrick {
    fn getattr(&self, ctx: &Context, path: &Path) -> KfsResult<FileAttr> {
        self.sub.brick.getattr(ctx, path)
    }

    fn readlink(&self, ctx: &Context, path: &Path, size: u32) -> KfsResult<Vec<u8>> {
        self.sub.brick.readlink(ctx, path, size)
    }

    fn mknod(&self, ctx: &Context, path: &Path, mode: u32, rdev: u32) -> KfsResult<FileAttr> {
        self.sub.brick.mknod(ctx, path, mode, rdev)
    }

    fn mkdir(&self, ctx: &Context, path: &Path, mode: u32) -> KfsResult<FileAttr> {
        self.sub.brick.mkdir(ctx, path, mode)
    }

    fn unlink(&self, ctx: &Context, path: &Path) -> KfsResult<()> {
        self.sub.brick.unlink(ctx, path)
    }

    fn rmdir(&self, ctx: &Context, path: &Path) -> KfsResult<()> {
        self.sub.brick.rmdir(ctx, path)
    }

    fn symlink(&self, ctx: &Context, path: &Path, target: &Path) -> KfsResult<FileAttr> {
        self.sub.brick.symlink(ctx, path, target)
    }

    fn rename(&self, ctx: &Context, from: &Path, to: &Path) -> KfsResult<()> {
        self.sub.brick.rename(ctx, from, to)
    }

    fn link(&self, ctx: &Context, path: &Path, newpath: &Path) -> KfsResult<FileAttr> {
        self.sub.brick.link(ctx, path, newpath)
    }

    fn chmod(&self, ctx: &Context, path: &Path, mode: u32) -> KfsResult<()> {
        self.sub.brick.chmod(ctx, path, mode)
    }

    fn chown(&self, ctx: &Context, path: &Path, uid: Option<u32>, gid: Option<u32>) -> KfsResult<()> {
        self.sub.brick.chown(ctx, path, uid, gid)
    }

    fn truncate(&self, ctx: &Context, path: &Path, size: u64) -> KfsResult<()> {
        self.sub.brick.truncate(ctx, path, size)
    }

    fn open(&self, ctx: &Context, path: &Path, flags: i32) -> KfsResult<u64> {
        self.sub.brick.open(ctx, path, flags)
    }

    fn read(&self, ctx: &Context, path: &Path, fh: u64, offset: i64, size: u32) -> KfsResult<Vec<u8>> {
        self.sub.brick.read(ctx, path, fh, offset, size)
    }

    fn write(&self, ctx: &Context, path: &Path, fh: u64, offset: i64, data: &[u8]) -> KfsResult<u32> {
        self.sub.brick.write(ctx, path, fh, offset, data)
    }

    fn statfs(&self, ctx: &Context, path: &Path) -> KfsResult<StatFs> {
        self.sub.brick.statfs(ctx, path)
    }

    fn flush(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        self.sub.brick.flush(ctx, path, fh)
    }

    fn release(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        self.sub.brick.release(ctx, path, fh)
    }

    fn fsync(&self, ctx: &Context, path: &Path, fh: u64, datasync: bool) -> KfsResult<()> {
        self.sub.brick.fsync(ctx, path, fh, datasync)
    }

    fn setxattr(&self, ctx: &Context, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> KfsResult<()> {
        self.sub.brick.setxattr(ctx, path, name, value, flags)
    }

    fn getxattr(&self, ctx: &Context, path: &Path, name: &OsStr) -> KfsResult<Vec<u8>> {
        self.sub.brick.getxattr(ctx, path, name)
    }

    fn listxattr(&self, ctx: &Context, path: &Path) -> KfsResult<Vec<Vec<u8>>> {
        self.sub.brick.listxattr(ctx, path)
    }

    fn removexattr(&self, ctx: &Context, path: &Path, name: &OsStr) -> KfsResult<()> {
        self.sub.brick.removexattr(ctx, path, name)
    }

    fn opendir(&self, ctx: &Context, path: &Path, flags: i32) -> KfsResult<u64> {
        self.sub.brick.opendir(ctx, path, flags)
    }

    fn readdir(
        &self,
        ctx: &Context,
        path: &Path,
        fh: u64,
        offset: u64,
        collector: &mut dyn DirEntryCollector,
    ) -> KfsResult<()> {
        self.sub.brick.readdir(ctx, path, fh, offset, collector)
    }

    fn releasedir(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        self.sub.brick.releasedir(ctx, path, fh)
    }

    fn fsyncdir(&self, ctx: &Context, path: &Path, fh: u64, datasync: bool) -> KfsResult<()> {
        self.sub.brick.fsyncdir(ctx, path, fh, datasync)
    }

    fn access(&self, ctx: &Context, path: &Path, mask: i32) -> KfsResult<()> {
        self.sub.brick.access(ctx, path, mask)
    }

    fn create(&self, ctx: &Context, path: &Path, mode: u32, flags: i32) -> KfsResult<(u64, FileAttr)> {
        self.sub.brick.create(ctx, path, mode, flags)
    }

    fn ftruncate(&self, ctx: &Context, path: &Path, fh: u64, size: u64) -> KfsResult<()> {
        self.sub.brick.ftruncate(ctx, path, fh, size)
    }

    fn fgetattr(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<FileAttr> {
        self.sub.brick.fgetattr(ctx, path, fh)
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
        self.sub.brick.lock(ctx, path, fh, start, end, typ, pid, sleep)
    }

    fn utimens(
        &self,
        ctx: &Context,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> KfsResult<()> {
        self.sub.brick.utimens(ctx, path, atime, mtime)
    }

    fn bmap(&self, ctx: &Context, path: &Path, blocksize: u64, idx: u64) -> KfsResult<u64> {
        self.sub.brick.bmap(ctx, path, blocksize, idx)
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
        self.sub.brick.ioctl(ctx, path, fh, cmd, in_data, out_size)
    }

    fn poll(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<u32> {
        self.sub.brick.poll(ctx, path, fh)
    }

    fn halt(&self) {
        self.sub.halt_once();
    }
}

pub fn init(
    _section: &ini::Properties,
    _name: &str,
    mut subvolumes: Vec<BrickInstance>,
) -> Result<Arc<dyn Brick>, KfsError> {
    if subvolumes.len() != 1 {
        return Err(KfsError::Config(format!(
            "'pass' brick requires exactly 1 subvolume, got {}",
            subvolumes.len()
        )));
    }
    Ok(Arc::new(PassthroughBrick {
        sub: subvolumes.remove(0),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bricks::posix;
    use std::sync::Arc;

    #[test]
    fn requires_exactly_one_subvolume() {
        let section = ini::Ini::new();
        let props = section.general_section().clone();
        let err = init(&props, "p", vec![]).unwrap_err();
        assert!(matches!(err, KfsError::Config(_)));
    }

    #[test]
    fn forwards_getattr_to_subvolume() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        let mut conf = ini::Ini::new();
        conf.with_section(Some("posix"))
            .set("path", dir.path().to_str().unwrap());
        let posix_props = conf.section(Some("posix")).unwrap().clone();
        let posix_brick = posix::init(&posix_props, "posix", vec![]).unwrap();
        let sub = BrickInstance::new(posix_brick, "posix".to_string());
        let pass_props = ini::Ini::new().general_section().clone();
        let pass: Arc<dyn Brick> = init(&pass_props, "p", vec![sub]).unwrap();
        let ctx = Context::new(0, 0, 0);
        let attr = pass.getattr(&ctx, Path::new("/a")).unwrap();
        assert_eq!(attr.size, 2);
    }
}
