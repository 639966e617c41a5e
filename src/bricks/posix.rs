//! Terminal leaf over a real directory tree (spec.md §4.4). Every
//! operation maps onto the matching `std`/`libc` call, translating
//! `std::io::Error`/raw `errno` into our `Errno` the way `examples/xmp.rs`'s
//! `errhandle` helpers translate `io::ErrorKind` for its FUSE replies.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::brick::{Brick, BrickInstance};
use crate::context::Context;
use crate::errno::{Errno, KfsResult};
use crate::error::KfsError;
use crate::types::{DirEntry, DirEntryCollector, FileAttr, FileKind, StatFs};
use crate::util::{expand_tilde, io_error_to_errno};

pub struct PosixBrick {
    root: PathBuf,
    files: Mutex<HashMap<u64, fs::File>>,
    dirs: Mutex<HashMap<u64, Vec<DirEntry>>>,
    next_handle: AtomicU64,
}

fn to_cstring(path: &Path) -> KfsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn meta_to_attr(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        ino: meta.ino(),
        size: meta.size(),
        blocks: meta.blocks(),
        atime: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.atime().max(0) as u64),
        mtime: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.mtime().max(0) as u64),
        ctime: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.ctime().max(0) as u64),
        kind: FileKind::from_mode(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
    }
}

impl PosixBrick {
    fn resolve(&self, path: &Path) -> PathBuf {
        let rel = path.strip_prefix("/").unwrap_or(path);
        if rel.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Brick for PosixBrick {
    fn getattr(&self, _ctx: &Context, path: &Path) -> KfsResult<FileAttr> {
        let meta = fs::symlink_metadata(self.resolve(path)).map_err(io_error_to_errno)?;
        Ok(meta_to_attr(&meta))
    }

    fn readlink(&self, _ctx: &Context, path: &Path, size: u32) -> KfsResult<Vec<u8>> {
        let target = fs::read_link(self.resolve(path)).map_err(io_error_to_errno)?;
        let mut bytes = target.into_os_string().into_vec();
        bytes.truncate(size as usize);
        Ok(bytes)
    }

    fn mknod(&self, ctx: &Context, path: &Path, mode: u32, rdev: u32) -> KfsResult<FileAttr> {
        let real = self.resolve(path);
        let c_path = to_cstring(&real)?;
        let ret = unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
        if ret != 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        self.getattr(ctx, path)
    }

    fn mkdir(&self, ctx: &Context, path: &Path, mode: u32) -> KfsResult<FileAttr> {
        let real = self.resolve(path);
        fs::DirBuilder::new()
            .mode(mode)
            .create(&real)
            .map_err(io_error_to_errno)?;
        self.getattr(ctx, path)
    }

    fn unlink(&self, _ctx: &Context, path: &Path) -> KfsResult<()> {
        fs::remove_file(self.resolve(path)).map_err(io_error_to_errno)
    }

    fn rmdir(&self, _ctx: &Context, path: &Path) -> KfsResult<()> {
        fs::remove_dir(self.resolve(path)).map_err(io_error_to_errno)
    }

    fn symlink(&self, ctx: &Context, path: &Path, target: &Path) -> KfsResult<FileAttr> {
        std::os::unix::fs::symlink(target, self.resolve(path)).map_err(io_error_to_errno)?;
        self.getattr(ctx, path)
    }

    fn rename(&self, _ctx: &Context, from: &Path, to: &Path) -> KfsResult<()> {
        fs::rename(self.resolve(from), self.resolve(to)).map_err(io_error_to_errno)
    }

    fn link(&self, ctx: &Context, path: &Path, newpath: &Path) -> KfsResult<FileAttr> {
        fs::hard_link(self.resolve(path), self.resolve(newpath)).map_err(io_error_to_errno)?;
        self.getattr(ctx, newpath)
    }

    fn chmod(&self, _ctx: &Context, path: &Path, mode: u32) -> KfsResult<()> {
        fs::set_permissions(self.resolve(path), fs::Permissions::from_mode(mode))
            .map_err(io_error_to_errno)
    }

    fn chown(&self, _ctx: &Context, path: &Path, uid: Option<u32>, gid: Option<u32>) -> KfsResult<()> {
        let real = self.resolve(path);
        let c_path = to_cstring(&real)?;
        let uid = uid.unwrap_or(u32::MAX) as libc::uid_t;
        let gid = gid.unwrap_or(u32::MAX) as libc::gid_t;
        let ret = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
        if ret != 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn truncate(&self, _ctx: &Context, path: &Path, size: u64) -> KfsResult<()> {
        let real = self.resolve(path);
        let c_path = to_cstring(&real)?;
        let ret = unsafe { libc::truncate(c_path.as_ptr(), size as libc::off_t) };
        if ret != 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn open(&self, _ctx: &Context, path: &Path, flags: i32) -> KfsResult<u64> {
        let real = self.resolve(path);
        let c_path = to_cstring(&real)?;
        let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
        if fd < 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        let file = unsafe { fs::File::from_raw_fd(fd) };
        let handle = self.next_handle();
        self.files.lock().insert(handle, file);
        Ok(handle)
    }

    fn read(&self, _ctx: &Context, _path: &Path, fh: u64, offset: i64, size: u32) -> KfsResult<Vec<u8>> {
        let files = self.files.lock();
        let file = files.get(&fh).ok_or(Errno::EINVAL)?;
        let mut buf = vec![0u8; size as usize];
        let n = file.read_at(&mut buf, offset as u64).map_err(io_error_to_errno)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&self, _ctx: &Context, _path: &Path, fh: u64, offset: i64, data: &[u8]) -> KfsResult<u32> {
        let files = self.files.lock();
        let file = files.get(&fh).ok_or(Errno::EINVAL)?;
        let n = file.write_at(data, offset as u64).map_err(io_error_to_errno)?;
        Ok(n as u32)
    }

    fn statfs(&self, _ctx: &Context, path: &Path) -> KfsResult<StatFs> {
        let real = self.resolve(path);
        let c_path = to_cstring(&real)?;
        let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) };
        if ret != 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        Ok(StatFs {
            blocks: buf.f_blocks as u64,
            bfree: buf.f_bfree as u64,
            bavail: buf.f_bavail as u64,
            files: buf.f_files as u64,
            ffree: buf.f_ffree as u64,
            bsize: buf.f_bsize as u32,
            namelen: buf.f_namemax as u32,
            frsize: buf.f_frsize as u32,
        })
    }

    fn flush(&self, _ctx: &Context, _path: &Path, _fh: u64) -> KfsResult<()> {
        Ok(())
    }

    fn release(&self, _ctx: &Context, _path: &Path, fh: u64) -> KfsResult<()> {
        self.files.lock().remove(&fh);
        Ok(())
    }

    fn fsync(&self, _ctx: &Context, _path: &Path, fh: u64, datasync: bool) -> KfsResult<()> {
        let files = self.files.lock();
        let file = files.get(&fh).ok_or(Errno::EINVAL)?;
        if datasync {
            file.sync_data().map_err(io_error_to_errno)
        } else {
            file.sync_all().map_err(io_error_to_errno)
        }
    }

    fn setxattr(&self, _ctx: &Context, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> KfsResult<()> {
        let real = self.resolve(path);
        if flags == libc::XATTR_REPLACE {
            xattr::set(&real, name, value).map_err(io_error_to_errno)
        } else if flags == libc::XATTR_CREATE && xattr::get(&real, name).ok().flatten().is_some() {
            Err(Errno::EEXIST)
        } else {
            xattr::set(&real, name, value).map_err(io_error_to_errno)
        }
    }

    fn getxattr(&self, _ctx: &Context, path: &Path, name: &OsStr) -> KfsResult<Vec<u8>> {
        match xattr::get(self.resolve(path), name).map_err(io_error_to_errno)? {
            Some(value) => Ok(value),
            None => Err(Errno::ENODATA),
        }
    }

    fn listxattr(&self, _ctx: &Context, path: &Path) -> KfsResult<Vec<Vec<u8>>> {
        let names = xattr::list(self.resolve(path)).map_err(io_error_to_errno)?;
        Ok(names.map(|n| n.as_bytes().to_vec()).collect())
    }

    fn removexattr(&self, _ctx: &Context, path: &Path, name: &OsStr) -> KfsResult<()> {
        xattr::remove(self.resolve(path), name).map_err(io_error_to_errno)
    }

    fn opendir(&self, _ctx: &Context, path: &Path, _flags: i32) -> KfsResult<u64> {
        let real = self.resolve(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&real).map_err(io_error_to_errno)? {
            let entry = entry.map_err(io_error_to_errno)?;
            let kind = entry
                .file_type()
                .map(|ft| {
                    if ft.is_dir() {
                        FileKind::Directory
                    } else if ft.is_symlink() {
                        FileKind::Symlink
                    } else {
                        FileKind::RegularFile
                    }
                })
                .unwrap_or(FileKind::RegularFile);
            entries.push(DirEntry {
                name: entry.file_name(),
                kind,
                offset: 0,
            });
        }
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.offset = i as i64 + 1;
        }
        let handle = self.next_handle();
        self.dirs.lock().insert(handle, entries);
        Ok(handle)
    }

    fn readdir(
        &self,
        _ctx: &Context,
        path: &Path,
        fh: u64,
        offset: u64,
        collector: &mut dyn DirEntryCollector,
    ) -> KfsResult<()> {
        let dirs = self.dirs.lock();
        let entries = dirs.get(&fh).ok_or(Errno::EINVAL)?;
        for entry in entries.iter().skip(offset as usize) {
            if collector.emit(entry.clone()) {
                return Ok(());
            }
        }
        let _ = path;
        Ok(())
    }

    fn releasedir(&self, _ctx: &Context, _path: &Path, fh: u64) -> KfsResult<()> {
        self.dirs.lock().remove(&fh);
        Ok(())
    }

    fn fsyncdir(&self, _ctx: &Context, _path: &Path, _fh: u64, _datasync: bool) -> KfsResult<()> {
        Ok(())
    }

    fn access(&self, _ctx: &Context, path: &Path, mask: i32) -> KfsResult<()> {
        let real = self.resolve(path);
        let c_path = to_cstring(&real)?;
        let ret = unsafe { libc::access(c_path.as_ptr(), mask) };
        if ret != 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn create(&self, ctx: &Context, path: &Path, mode: u32, flags: i32) -> KfsResult<(u64, FileAttr)> {
        let real = self.resolve(path);
        let c_path = to_cstring(&real)?;
        let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CREAT, mode as libc::mode_t) };
        if fd < 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        let file = unsafe { fs::File::from_raw_fd(fd) };
        let handle = self.next_handle();
        self.files.lock().insert(handle, file);
        let attr = self.getattr(ctx, path)?;
        Ok((handle, attr))
    }

    fn ftruncate(&self, _ctx: &Context, _path: &Path, fh: u64, size: u64) -> KfsResult<()> {
        let files = self.files.lock();
        let file = files.get(&fh).ok_or(Errno::EINVAL)?;
        file.set_len(size).map_err(io_error_to_errno)
    }

    fn fgetattr(&self, _ctx: &Context, _path: &Path, fh: u64) -> KfsResult<FileAttr> {
        let files = self.files.lock();
        let file = files.get(&fh).ok_or(Errno::EINVAL)?;
        let meta = file.metadata().map_err(io_error_to_errno)?;
        Ok(meta_to_attr(&meta))
    }

    fn lock(
        &self,
        _ctx: &Context,
        _path: &Path,
        fh: u64,
        start: u64,
        end: u64,
        typ: i32,
        _pid: u32,
        sleep: bool,
    ) -> KfsResult<()> {
        let files = self.files.lock();
        let file = files.get(&fh).ok_or(Errno::EINVAL)?;
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = typ as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = (end.saturating_sub(start)) as libc::off_t;
        let cmd = if sleep { libc::F_SETLKW } else { libc::F_SETLK };
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut fl) };
        if ret != 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn utimens(
        &self,
        _ctx: &Context,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> KfsResult<()> {
        let real = self.resolve(path);
        let c_path = to_cstring(&real)?;
        let to_timespec = |t: Option<SystemTime>| -> libc::timespec {
            match t {
                None => libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
                Some(time) => {
                    let dur = time
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .unwrap_or_default();
                    libc::timespec {
                        tv_sec: dur.as_secs() as libc::time_t,
                        tv_nsec: dur.subsec_nanos() as libc::c_long,
                    }
                }
            }
        };
        let times = [to_timespec(atime), to_timespec(mtime)];
        let ret = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if ret != 0 {
            return Err(Errno::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn halt(&self) {}
}

pub fn init(
    section: &ini::Properties,
    name: &str,
    subvolumes: Vec<BrickInstance>,
) -> Result<Arc<dyn Brick>, KfsError> {
    if !subvolumes.is_empty() {
        return Err(KfsError::Config(format!(
            "'posix' brick '{name}' is a terminal leaf, takes 0 subvolumes, got {}",
            subvolumes.len()
        )));
    }
    let raw_path = section
        .get("path")
        .ok_or_else(|| KfsError::Config(format!("posix brick '{name}' is missing a 'path' key")))?;
    let root = expand_tilde(raw_path);
    if !root.is_dir() {
        return Err(KfsError::Config(format!(
            "posix brick '{name}' path '{}' is not a directory",
            root.display()
        )));
    }
    Ok(Arc::new(PosixBrick {
        root,
        files: Mutex::new(HashMap::new()),
        dirs: Mutex::new(HashMap::new()),
        next_handle: AtomicU64::new(1),
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn brick_over(dir: &Path) -> Arc<dyn Brick> {
        let mut conf = ini::Ini::new();
        conf.with_section(Some("posix")).set("path", dir.to_str().unwrap());
        let props = conf.section(Some("posix")).unwrap().clone();
        init(&props, "posix", vec![]).unwrap()
    }

    #[test]
    fn getattr_reports_real_file_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"hello").unwrap();
        let brick = brick_over(dir.path());
        let ctx = Context::new(0, 0, 0);
        let attr = brick.getattr(&ctx, Path::new("/f")).unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileKind::RegularFile);
    }

    #[test]
    fn mkdir_then_rmdir_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let brick = brick_over(dir.path());
        let ctx = Context::new(0, 0, 0);
        brick.mkdir(&ctx, Path::new("/sub"), 0o755).unwrap();
        assert!(dir.path().join("sub").is_dir());
        brick.rmdir(&ctx, Path::new("/sub")).unwrap();
        assert!(!dir.path().join("sub").exists());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let brick = brick_over(dir.path());
        let ctx = Context::new(0, 0, 0);
        let fh = brick.open(&ctx, Path::new("/f"), libc::O_RDWR).unwrap();
        let n = brick.write(&ctx, Path::new("/f"), fh, 0, b"hello world").unwrap();
        assert_eq!(n, 11);
        let data = brick.read(&ctx, Path::new("/f"), fh, 0, 11).unwrap();
        assert_eq!(data, b"hello world");
        brick.release(&ctx, Path::new("/f"), fh).unwrap();
    }

    #[test]
    fn readdir_lists_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        let brick = brick_over(dir.path());
        let ctx = Context::new(0, 0, 0);
        let fh = brick.opendir(&ctx, Path::new("/"), 0).unwrap();
        struct Collect(Vec<String>);
        impl DirEntryCollector for Collect {
            fn emit(&mut self, entry: DirEntry) -> bool {
                self.0.push(entry.name.to_string_lossy().into_owned());
                false
            }
        }
        let mut collector = Collect(Vec::new());
        brick.readdir(&ctx, Path::new("/"), fh, 0, &mut collector).unwrap();
        let mut names = collector.0;
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn getattr_on_missing_file_is_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let brick = brick_over(dir.path());
        let ctx = Context::new(0, 0, 0);
        let err = brick.getattr(&ctx, Path::new("/missing")).unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }
}
