//! Mount bridge: adapts the path-addressed `Brick` vtable to `fuser`'s
//! inode-addressed kernel calls (spec.md §4.4, §9, §12).
//!
//! Grounded on the `inode_to_physical_path`/`mounted_path_to_inode` pattern
//! in `examples/xmp.rs`, generalized from "physical path on one underlying
//! tree" to "logical path resolved by whatever brick stack is mounted".
//! `examples/xmp.rs` uses async `dashmap::DashMap`; this bridge runs
//! synchronously against the classic `fuser::Filesystem` trait, so the
//! inode table is a plain `HashMap` behind a `parking_lot::RwLock`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr as FuseAttr, FileType as FuseKind, Filesystem, ReplyAttr, ReplyBmap, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use log::warn;
use parking_lot::RwLock;

use crate::brick::Brick;
use crate::context::Context;
use crate::errno::Errno;
use crate::types::{DirEntry, DirEntryCollector, FileAttr, FileKind};

const ATTR_TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

struct InodeTable {
    path_to_ino: HashMap<PathBuf, u64>,
    ino_to_path: HashMap<u64, PathBuf>,
    lookup_count: HashMap<u64, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        path_to_ino.insert(PathBuf::from("/"), ROOT_INO);
        ino_to_path.insert(ROOT_INO, PathBuf::from("/"));
        InodeTable {
            path_to_ino,
            ino_to_path,
            lookup_count: HashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        }
    }
}

/// Implements `fuser::Filesystem` over an assembled brick tree.
///
/// Holds the inode table behind a lock rather than behind `&mut self`
/// because `fuser`'s trait methods take `&self`... actually they take
/// `&mut self`; we still use interior locking since the bricks themselves
/// are only reachable through `&self` (`Arc<dyn Brick>` is `Send + Sync`,
/// not `&mut`-friendly) and several operations need to read and write the
/// table within one call (e.g. `lookup` inserting a fresh inode).
pub struct RootFilesystem {
    root: Arc<dyn Brick>,
    inodes: RwLock<InodeTable>,
}

struct FuserReplyCollector<'a> {
    reply: &'a mut ReplyDirectory,
}

impl<'a> DirEntryCollector for FuserReplyCollector<'a> {
    fn emit(&mut self, entry: DirEntry) -> bool {
        self.reply.add(0, entry.offset, to_fuse_kind(entry.kind), &entry.name)
    }
}

fn to_fuse_kind(kind: FileKind) -> FuseKind {
    match kind {
        FileKind::NamedPipe => FuseKind::NamedPipe,
        FileKind::CharDevice => FuseKind::CharDevice,
        FileKind::BlockDevice => FuseKind::BlockDevice,
        FileKind::Directory => FuseKind::Directory,
        FileKind::RegularFile => FuseKind::RegularFile,
        FileKind::Symlink => FuseKind::Symlink,
        FileKind::Socket => FuseKind::Socket,
    }
}

fn to_fuse_attr(ino: u64, attr: &FileAttr) -> FuseAttr {
    FuseAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuse_kind(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn request_ctx(req: &Request<'_>) -> Context {
    Context::new(req.uid(), req.gid(), req.pid())
}

impl RootFilesystem {
    pub fn new(root: Arc<dyn Brick>) -> Self {
        RootFilesystem {
            root,
            inodes: RwLock::new(InodeTable::new()),
        }
    }

    fn path_for(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.read().ino_to_path.get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let parent_path = self.path_for(parent)?;
        Some(crate::util::join_name(&parent_path, name))
    }

    /// Registers `path` with a stable inode, bumping its lookup refcount.
    fn intern(&self, path: &Path) -> u64 {
        let mut table = self.inodes.write();
        if let Some(&ino) = table.path_to_ino.get(path) {
            *table.lookup_count.entry(ino).or_insert(0) += 1;
            return ino;
        }
        let ino = table.next_ino.fetch_add(1, Ordering::Relaxed);
        table.path_to_ino.insert(path.to_path_buf(), ino);
        table.ino_to_path.insert(ino, path.to_path_buf());
        table.lookup_count.insert(ino, 1);
        ino
    }

    fn rename_entry(&self, from: &Path, to: &Path) {
        let mut table = self.inodes.write();
        if let Some(ino) = table.path_to_ino.remove(from) {
            table.path_to_ino.insert(to.to_path_buf(), ino);
            table.ino_to_path.insert(ino, to.to_path_buf());
        }
    }

    fn forget_path(&self, path: &Path) {
        let mut table = self.inodes.write();
        if let Some(ino) = table.path_to_ino.remove(path) {
            table.ino_to_path.remove(&ino);
            table.lookup_count.remove(&ino);
        }
    }
}

impl Filesystem for RootFilesystem {
    fn destroy(&mut self) {
        self.root.halt();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.getattr(&request_ctx(req), &path) {
            Ok(attr) => {
                let ino = self.intern(&path);
                reply.entry(&ATTR_TTL, &to_fuse_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        let mut table = self.inodes.write();
        if let Some(count) = table.lookup_count.get_mut(&ino) {
            *count = count.saturating_sub(nlookup);
            if *count == 0 {
                if let Some(path) = table.ino_to_path.remove(&ino) {
                    table.path_to_ino.remove(&path);
                }
                table.lookup_count.remove(&ino);
            }
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.getattr(&request_ctx(req), &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_fuse_attr(ino, &attr)),
            Err(e) => reply.error(e.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        let ctx = request_ctx(req);

        // Decomposed into the engine's separate chmod/chown/truncate/utimens
        // calls per spec.md's read-modify-write note on setattr.
        if let Some(mode) = mode {
            if let Err(e) = self.root.chmod(&ctx, &path, mode) {
                reply.error(e.0);
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = self.root.chown(&ctx, &path, uid, gid) {
                reply.error(e.0);
                return;
            }
        }
        if let Some(size) = size {
            if let Err(e) = self.root.truncate(&ctx, &path, size) {
                reply.error(e.0);
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let now = std::time::SystemTime::now();
            let resolve = |t: Option<TimeOrNow>| match t {
                Some(TimeOrNow::SpecificTime(t)) => Some(t),
                Some(TimeOrNow::Now) => Some(now),
                None => None,
            };
            if let Err(e) = self.root.utimens(&ctx, &path, resolve(atime), resolve(mtime)) {
                reply.error(e.0);
                return;
            }
        }
        match self.root.getattr(&ctx, &path) {
            Ok(attr) => {
                let ino = self.intern(&path);
                reply.attr(&ATTR_TTL, &to_fuse_attr(ino, &attr));
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.readlink(&request_ctx(req), &path, 4096) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.0),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.mknod(&request_ctx(req), &path, mode, rdev) {
            Ok(attr) => {
                let ino = self.intern(&path);
                reply.entry(&ATTR_TTL, &to_fuse_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.mkdir(&request_ctx(req), &path, mode) {
            Ok(attr) => {
                let ino = self.intern(&path);
                reply.entry(&ATTR_TTL, &to_fuse_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.unlink(&request_ctx(req), &path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.rmdir(&request_ctx(req), &path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.symlink(&request_ctx(req), &path, target) {
            Ok(attr) => {
                let ino = self.intern(&path);
                reply.entry(&ATTR_TTL, &to_fuse_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (self.child_path(parent, name), self.child_path(newparent, newname))
        else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.rename(&request_ctx(req), &from, &to) {
            Ok(()) => {
                self.rename_entry(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(path), Some(newpath)) = (self.path_for(ino), self.child_path(newparent, newname))
        else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.link(&request_ctx(req), &path, &newpath) {
            Ok(attr) => {
                let new_ino = self.intern(&newpath);
                reply.entry(&ATTR_TTL, &to_fuse_attr(new_ino, &attr), 0);
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.open(&request_ctx(req), &path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.0),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.read(&request_ctx(req), &path, fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.0),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.write(&request_ctx(req), &path, fh, offset, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.0),
        }
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.flush(&request_ctx(req), &path, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.0),
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.ok();
            return;
        };
        if let Err(e) = self.root.release(&request_ctx(req), &path, fh) {
            warn!("release {} failed: {e}", path.display());
        }
        reply.ok();
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.fsync(&request_ctx(req), &path, fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.0),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.opendir(&request_ctx(req), &path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.0),
        }
    }

    fn readdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        let mut collector = FuserReplyCollector { reply: &mut reply };
        match self.root.readdir(&request_ctx(req), &path, fh, offset as u64, &mut collector) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.0),
        }
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_for(ino) else {
            reply.ok();
            return;
        };
        if let Err(e) = self.root.releasedir(&request_ctx(req), &path, fh) {
            warn!("releasedir {} failed: {e}", path.display());
        }
        reply.ok();
    }

    fn fsyncdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.fsyncdir(&request_ctx(req), &path, fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.0),
        }
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.path_for(ino).unwrap_or_else(|| PathBuf::from("/"));
        match self.root.statfs(&request_ctx(req), &path) {
            Ok(s) => reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize),
            Err(e) => reply.error(e.0),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.setxattr(&request_ctx(req), &path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.0),
        }
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.getxattr(&request_ctx(req), &path, name) {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() > size as usize {
                    reply.error(Errno::ERANGE.0);
                } else {
                    reply.data(&data);
                }
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.listxattr(&request_ctx(req), &path) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in &names {
                    buf.extend_from_slice(name);
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32);
                } else if buf.len() > size as usize {
                    reply.error(Errno::ERANGE.0);
                } else {
                    reply.data(&buf);
                }
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.removexattr(&request_ctx(req), &path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.0),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.access(&request_ctx(req), &path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.0),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.create(&request_ctx(req), &path, mode, flags) {
            Ok((fh, attr)) => {
                let ino = self.intern(&path);
                reply.created(&ATTR_TTL, &to_fuse_attr(ino, &attr), 0, fh, 0);
            }
            Err(e) => reply.error(e.0),
        }
    }

    fn getlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self
            .root
            .lock(&request_ctx(req), &path, fh, start, end, typ, pid, false)
        {
            Ok(()) => reply.locked(start, end, typ, pid),
            Err(e) => reply.error(e.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self
            .root
            .lock(&request_ctx(req), &path, fh, start, end, typ, pid, sleep)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.0),
        }
    }

    fn bmap(&mut self, req: &Request<'_>, ino: u64, blocksize: u32, idx: u64, reply: ReplyBmap) {
        let Some(path) = self.path_for(ino) else {
            reply.error(Errno::ENOENT.0);
            return;
        };
        match self.root.bmap(&request_ctx(req), &path, blocksize as u64, idx) {
            Ok(block) => reply.bmap(block),
            Err(e) => reply.error(e.0),
        }
    }
}
