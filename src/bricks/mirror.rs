//! N-way replicator (spec.md §4.3, §5, §8).
//!
//! Each subvolume is either Active or Ejected; the transition is one-way.
//! Additive operations (`mknod`, `mkdir`, `symlink`, `link`, attribute
//! changes with a rollback baseline) roll back via their inverse on the
//! first failure. Destructive operations (`unlink`, `rmdir`, `truncate`)
//! abort on the very first failure but eject-and-continue on any later
//! one, so the overall call still reports success. `write` and `setxattr`
//! take a backup before mutating and restore it on partial failure. The
//! reader/writer lock around the active set is only ever held while
//! reading or mutating the set itself, never across a subvolume call.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Mutex as StdMutex;

use crate::brick::{Brick, BrickInstance};
use crate::context::Context;
use crate::errno::{Errno, KfsResult};
use crate::error::KfsError;
use crate::types::{DirEntryCollector, FileAttr, StatFs};

struct ActiveSet {
    bits: Vec<bool>,
    count: usize,
}

#[derive(Clone)]
struct MirrorFileHandle {
    subvol_ids: Vec<usize>,
    subvol_fhs: Vec<u64>,
}

#[derive(Clone, Copy)]
struct MirrorDirHandle {
    subvol_idx: usize,
    fh: u64,
}

enum LockOutcome {
    Acquired,
    AlreadyHeld,
}

pub struct MirrorBrick {
    subvols: Vec<BrickInstance>,
    active: RwLock<ActiveSet>,
    file_handles: parking_lot::Mutex<HashMap<u64, MirrorFileHandle>>,
    dir_handles: parking_lot::Mutex<HashMap<u64, MirrorDirHandle>>,
    next_handle: AtomicU64,
    /// In-process, path-granular advisory locking used internally by
    /// `write`/`setxattr` to get a stable backup snapshot. This is
    /// deliberately coarser than the byte-range locking spec.md describes
    /// ("this brick's own lock") — see DESIGN.md's Open Question note: the
    /// mirror brick's own public `lock` operation is unimplemented (always
    /// `ENOTSUP`, per spec.md's design note), so the internal helper can't
    /// delegate to it and instead keeps its own lightweight table.
    locks: StdMutex<HashSet<std::path::PathBuf>>,
}

impl MirrorBrick {
    fn eject(&self, idx: usize) {
        let mut active = self.active.write();
        if active.bits[idx] {
            active.bits[idx] = false;
            active.count -= 1;
        }
    }

    fn is_active(&self, idx: usize) -> bool {
        self.active.read().bits[idx]
    }

    fn active_snapshot(&self) -> Vec<usize> {
        let active = self.active.read();
        (0..active.bits.len()).filter(|&i| active.bits[i]).collect()
    }

    fn alloc_file_handle(&self, subvol_ids: Vec<usize>, subvol_fhs: Vec<u64>) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.file_handles
            .lock()
            .insert(id, MirrorFileHandle { subvol_ids, subvol_fhs });
        id
    }

    fn ensure_lock(&self, path: &Path) -> LockOutcome {
        let mut set = self.locks.lock().unwrap();
        if set.insert(path.to_path_buf()) {
            LockOutcome::Acquired
        } else {
            LockOutcome::AlreadyHeld
        }
    }

    fn release_lock(&self, path: &Path) {
        self.locks.lock().unwrap().remove(path);
    }

    fn rollback_unwind(&self, succeeded: &[usize], mut undo: impl FnMut(usize) -> KfsResult<()>) {
        for &idx in succeeded.iter().rev() {
            if let Err(e) = undo(idx) {
                warn!("mirror: rollback failed on subvolume {idx}, ejecting: {e}");
                self.eject(idx);
            }
        }
    }

    /// Shared shape for `chmod`/`chown`/`utimens`: read a rollback baseline
    /// via this brick's own `getattr`, apply `change` to every active
    /// subvolume, and on the first failure restore `restore` on whichever
    /// subvolumes already succeeded. When no baseline could be obtained,
    /// failures are ejected individually and the pass continues.
    fn run_attr_op(
        &self,
        ctx: &Context,
        path: &Path,
        change: impl Fn(&dyn Brick, &Context, &Path) -> KfsResult<()>,
        restore: impl Fn(&dyn Brick, &Context, &Path, &FileAttr) -> KfsResult<()>,
    ) -> KfsResult<()> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        let rollback_attr = self.getattr(ctx, path).ok();
        if let Some(attr) = &rollback_attr {
            let mut succeeded = Vec::new();
            for &idx in &snapshot {
                let brick = self.subvols[idx].brick.as_ref();
                match change(brick, ctx, path) {
                    Ok(()) => succeeded.push(idx),
                    Err(e) => {
                        for &done in succeeded.iter().rev() {
                            let b = self.subvols[done].brick.as_ref();
                            if let Err(re) = restore(b, ctx, path, attr) {
                                warn!("mirror: attribute rollback failed on subvolume {done}, ejecting: {re}");
                                self.eject(done);
                            }
                        }
                        return Err(e);
                    }
                }
            }
            Ok(())
        } else {
            for &idx in &snapshot {
                let brick = self.subvols[idx].brick.as_ref();
                if let Err(e) = change(brick, ctx, path) {
                    warn!(
                        "mirror: subvolume {idx} failed attribute change with no rollback baseline, ejecting: {e}"
                    );
                    self.eject(idx);
                }
            }
            Ok(())
        }
    }

    fn destructive_op(
        &self,
        snapshot: &[usize],
        mut f: impl FnMut(usize) -> KfsResult<()>,
    ) -> KfsResult<()> {
        for (i, &idx) in snapshot.iter().enumerate() {
            if let Err(e) = f(idx) {
                if i == 0 {
                    return Err(e);
                }
                warn!("mirror: subvolume {idx} failed, ejecting: {e}");
                self.eject(idx);
            }
        }
        Ok(())
    }

    fn per_handle_forward(
        &self,
        handle: &MirrorFileHandle,
        mut f: impl FnMut(usize, u64) -> KfsResult<()>,
    ) -> KfsResult<()> {
        let mut any_success = false;
        let mut last_err = None;
        for (&idx, &sub_fh) in handle.subvol_ids.iter().zip(handle.subvol_fhs.iter()) {
            if !self.is_active(idx) {
                continue;
            }
            match f(idx, sub_fh) {
                Ok(()) => any_success = true,
                Err(e) => {
                    if any_success {
                        warn!("mirror: subvolume {idx} failed after a prior success, ejecting: {e}");
                        self.eject(idx);
                    } else {
                        last_err = Some(e);
                    }
                }
            }
        }
        if any_success {
            Ok(())
        } else if let Some(e) = last_err {
            Err(e)
        } else {
            Ok(())
        }
    }
}

impl Brick for MirrorBrick {
    fn getattr(&self, ctx: &Context, path: &Path) -> KfsResult<FileAttr> {
        let idx = self.active_snapshot().into_iter().next().ok_or(Errno::ECHILD)?;
        self.subvols[idx].brick.getattr(ctx, path)
    }

    fn readlink(&self, ctx: &Context, path: &Path, size: u32) -> KfsResult<Vec<u8>> {
        let idx = self.active_snapshot().into_iter().next().ok_or(Errno::ECHILD)?;
        self.subvols[idx].brick.readlink(ctx, path, size)
    }

    fn mknod(&self, ctx: &Context, path: &Path, mode: u32, rdev: u32) -> KfsResult<FileAttr> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        let mut succeeded = Vec::new();
        let mut last_attr = None;
        for &idx in &snapshot {
            match self.subvols[idx].brick.mknod(ctx, path, mode, rdev) {
                Ok(attr) => {
                    succeeded.push(idx);
                    last_attr = Some(attr);
                }
                Err(e) => {
                    self.rollback_unwind(&succeeded, |i| self.subvols[i].brick.unlink(ctx, path));
                    return Err(e);
                }
            }
        }
        Ok(last_attr.unwrap())
    }

    fn mkdir(&self, ctx: &Context, path: &Path, mode: u32) -> KfsResult<FileAttr> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        let mut succeeded = Vec::new();
        let mut last_attr = None;
        for &idx in &snapshot {
            match self.subvols[idx].brick.mkdir(ctx, path, mode) {
                Ok(attr) => {
                    succeeded.push(idx);
                    last_attr = Some(attr);
                }
                Err(e) => {
                    self.rollback_unwind(&succeeded, |i| self.subvols[i].brick.rmdir(ctx, path));
                    return Err(e);
                }
            }
        }
        Ok(last_attr.unwrap())
    }

    fn unlink(&self, ctx: &Context, path: &Path) -> KfsResult<()> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        self.destructive_op(&snapshot, |idx| self.subvols[idx].brick.unlink(ctx, path))
    }

    fn rmdir(&self, ctx: &Context, path: &Path) -> KfsResult<()> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        self.destructive_op(&snapshot, |idx| self.subvols[idx].brick.rmdir(ctx, path))
    }

    fn symlink(&self, ctx: &Context, path: &Path, target: &Path) -> KfsResult<FileAttr> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        let mut succeeded = Vec::new();
        let mut last_attr = None;
        for &idx in &snapshot {
            match self.subvols[idx].brick.symlink(ctx, path, target) {
                Ok(attr) => {
                    succeeded.push(idx);
                    last_attr = Some(attr);
                }
                Err(e) => {
                    self.rollback_unwind(&succeeded, |i| self.subvols[i].brick.unlink(ctx, path));
                    return Err(e);
                }
            }
        }
        Ok(last_attr.unwrap())
    }

    fn rename(&self, ctx: &Context, from: &Path, to: &Path) -> KfsResult<()> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        let mut succeeded = Vec::new();
        for &idx in &snapshot {
            match self.subvols[idx].brick.rename(ctx, from, to) {
                Ok(()) => succeeded.push(idx),
                Err(e) => {
                    self.rollback_unwind(&succeeded, |i| self.subvols[i].brick.rename(ctx, to, from));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn link(&self, ctx: &Context, path: &Path, newpath: &Path) -> KfsResult<FileAttr> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        let mut succeeded = Vec::new();
        let mut last_attr = None;
        for &idx in &snapshot {
            match self.subvols[idx].brick.link(ctx, path, newpath) {
                Ok(attr) => {
                    succeeded.push(idx);
                    last_attr = Some(attr);
                }
                Err(e) => {
                    self.rollback_unwind(&succeeded, |i| self.subvols[i].brick.unlink(ctx, newpath));
                    return Err(e);
                }
            }
        }
        Ok(last_attr.unwrap())
    }

    fn chmod(&self, ctx: &Context, path: &Path, mode: u32) -> KfsResult<()> {
        self.run_attr_op(
            ctx,
            path,
            |b, c, p| b.chmod(c, p, mode),
            |b, c, p, attr| b.chmod(c, p, attr.perm as u32),
        )
    }

    fn chown(&self, ctx: &Context, path: &Path, uid: Option<u32>, gid: Option<u32>) -> KfsResult<()> {
        self.run_attr_op(
            ctx,
            path,
            |b, c, p| b.chown(c, p, uid, gid),
            |b, c, p, attr| b.chown(c, p, Some(attr.uid), Some(attr.gid)),
        )
    }

    fn truncate(&self, ctx: &Context, path: &Path, size: u64) -> KfsResult<()> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        self.destructive_op(&snapshot, |idx| self.subvols[idx].brick.truncate(ctx, path, size))
    }

    fn utimens(
        &self,
        ctx: &Context,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> KfsResult<()> {
        self.run_attr_op(
            ctx,
            path,
            |b, c, p| b.utimens(c, p, atime, mtime),
            |b, c, p, attr| b.utimens(c, p, Some(attr.atime), Some(attr.mtime)),
        )
    }

    fn open(&self, ctx: &Context, path: &Path, flags: i32) -> KfsResult<u64> {
        let write_intent = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        if !write_intent {
            let idx = snapshot[0];
            let fh = self.subvols[idx].brick.open(ctx, path, flags)?;
            return Ok(self.alloc_file_handle(vec![idx], vec![fh]));
        }
        let mut ids = Vec::new();
        let mut fhs = Vec::new();
        for &idx in &snapshot {
            match self.subvols[idx].brick.open(ctx, path, flags) {
                Ok(fh) => {
                    ids.push(idx);
                    fhs.push(fh);
                }
                Err(e) => {
                    for (&done_idx, &done_fh) in ids.iter().zip(fhs.iter()).rev() {
                        if let Err(re) = self.subvols[done_idx].brick.release(ctx, path, done_fh) {
                            warn!("mirror: release during open rollback failed on subvolume {done_idx}, ejecting: {re}");
                            self.eject(done_idx);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(self.alloc_file_handle(ids, fhs))
    }

    fn read(&self, ctx: &Context, path: &Path, fh: u64, offset: i64, size: u32) -> KfsResult<Vec<u8>> {
        let handle = self.file_handles.lock().get(&fh).cloned().ok_or(Errno::EINVAL)?;
        for (&idx, &sub_fh) in handle.subvol_ids.iter().zip(handle.subvol_fhs.iter()) {
            if self.is_active(idx) {
                return self.subvols[idx].brick.read(ctx, path, sub_fh, offset, size);
            }
        }
        Err(Errno::ECHILD)
    }

    fn write(&self, ctx: &Context, path: &Path, fh: u64, offset: i64, data: &[u8]) -> KfsResult<u32> {
        let handle = self.file_handles.lock().get(&fh).cloned().ok_or(Errno::EINVAL)?;
        if handle.subvol_ids.is_empty() {
            return Err(Errno::ECHILD);
        }
        let acquired_here = matches!(self.ensure_lock(path), LockOutcome::Acquired);
        let backup = if data.is_empty() {
            Some(Vec::new())
        } else {
            self.read(ctx, path, fh, offset, data.len() as u32).ok()
        };

        let mut succeeded: Vec<(usize, u64)> = Vec::new();
        let mut last_ok: Option<u32> = None;

        for (&idx, &sub_fh) in handle.subvol_ids.iter().zip(handle.subvol_fhs.iter()) {
            if !self.is_active(idx) {
                continue;
            }
            match self.subvols[idx].brick.write(ctx, path, sub_fh, offset, data) {
                Ok(n) => {
                    succeeded.push((idx, sub_fh));
                    last_ok = Some(n);
                }
                Err(e) => {
                    if !succeeded.is_empty() && backup.is_none() {
                        warn!(
                            "mirror: write on subvolume {idx} failed with no backup available, \
                             ejecting and continuing without rollback: {e}"
                        );
                        self.eject(idx);
                        continue;
                    }
                    if let Some(buf) = &backup {
                        for &(done_idx, done_fh) in succeeded.iter().rev() {
                            if let Err(re) =
                                self.subvols[done_idx].brick.write(ctx, path, done_fh, offset, buf)
                            {
                                warn!("mirror: write rollback failed on subvolume {done_idx}, ejecting: {re}");
                                self.eject(done_idx);
                            }
                        }
                    }
                    if acquired_here {
                        self.release_lock(path);
                    }
                    return Err(e);
                }
            }
        }
        if acquired_here {
            self.release_lock(path);
        }
        last_ok.ok_or(Errno::ECHILD)
    }

    fn statfs(&self, ctx: &Context, path: &Path) -> KfsResult<StatFs> {
        let idx = self.active_snapshot().into_iter().next().ok_or(Errno::ECHILD)?;
        self.subvols[idx].brick.statfs(ctx, path)
    }

    fn flush(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        let handle = self.file_handles.lock().get(&fh).cloned().ok_or(Errno::EINVAL)?;
        self.per_handle_forward(&handle, |idx, sub_fh| self.subvols[idx].brick.flush(ctx, path, sub_fh))
    }

    fn release(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        if let Some(handle) = self.file_handles.lock().remove(&fh) {
            for (&idx, &sub_fh) in handle.subvol_ids.iter().zip(handle.subvol_fhs.iter()) {
                let was_active = self.is_active(idx);
                let result = self.subvols[idx].brick.release(ctx, path, sub_fh);
                if was_active {
                    if let Err(e) = result {
                        warn!("mirror: release failed on subvolume {idx}, ejecting: {e}");
                        self.eject(idx);
                    }
                }
            }
        }
        Ok(())
    }

    fn fsync(&self, ctx: &Context, path: &Path, fh: u64, datasync: bool) -> KfsResult<()> {
        let handle = self.file_handles.lock().get(&fh).cloned().ok_or(Errno::EINVAL)?;
        self.per_handle_forward(&handle, |idx, sub_fh| {
            self.subvols[idx].brick.fsync(ctx, path, sub_fh, datasync)
        })
    }

    fn setxattr(&self, ctx: &Context, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> KfsResult<()> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        let acquired_here = matches!(self.ensure_lock(path), LockOutcome::Acquired);
        let backup = self.getxattr(ctx, path, name).ok();
        let mut succeeded = Vec::new();
        let mut failure = None;
        for &idx in &snapshot {
            match self.subvols[idx].brick.setxattr(ctx, path, name, value, flags) {
                Ok(()) => succeeded.push(idx),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            if let Some(buf) = &backup {
                for &idx in succeeded.iter().rev() {
                    if let Err(re) = self.subvols[idx]
                        .brick
                        .setxattr(ctx, path, name, buf, libc::XATTR_REPLACE)
                    {
                        warn!("mirror: setxattr rollback failed on subvolume {idx}, ejecting: {re}");
                        self.eject(idx);
                    }
                }
            }
            if acquired_here {
                self.release_lock(path);
            }
            return Err(e);
        }
        if acquired_here {
            self.release_lock(path);
        }
        Ok(())
    }

    fn getxattr(&self, ctx: &Context, path: &Path, name: &OsStr) -> KfsResult<Vec<u8>> {
        let idx = self.active_snapshot().into_iter().next().ok_or(Errno::ECHILD)?;
        self.subvols[idx].brick.getxattr(ctx, path, name)
    }

    fn listxattr(&self, ctx: &Context, path: &Path) -> KfsResult<Vec<Vec<u8>>> {
        let idx = self.active_snapshot().into_iter().next().ok_or(Errno::ECHILD)?;
        self.subvols[idx].brick.listxattr(ctx, path)
    }

    fn removexattr(&self, ctx: &Context, path: &Path, name: &OsStr) -> KfsResult<()> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        self.destructive_op(&snapshot, |idx| self.subvols[idx].brick.removexattr(ctx, path, name))
    }

    fn opendir(&self, ctx: &Context, path: &Path, flags: i32) -> KfsResult<u64> {
        let idx = self.active_snapshot().into_iter().next().ok_or(Errno::ECHILD)?;
        let fh = self.subvols[idx].brick.opendir(ctx, path, flags)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.dir_handles.lock().insert(handle, MirrorDirHandle { subvol_idx: idx, fh });
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
        let handle = self.dir_handles.lock().get(&fh).copied().ok_or(Errno::EINVAL)?;
        self.subvols[handle.subvol_idx]
            .brick
            .readdir(ctx, path, handle.fh, offset, collector)
    }

    fn releasedir(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
        if let Some(handle) = self.dir_handles.lock().remove(&fh) {
            self.subvols[handle.subvol_idx].brick.releasedir(ctx, path, handle.fh)
        } else {
            Ok(())
        }
    }

    fn fsyncdir(&self, ctx: &Context, path: &Path, fh: u64, datasync: bool) -> KfsResult<()> {
        let handle = self.dir_handles.lock().get(&fh).copied().ok_or(Errno::EINVAL)?;
        self.subvols[handle.subvol_idx]
            .brick
            .fsyncdir(ctx, path, handle.fh, datasync)
    }

    fn access(&self, ctx: &Context, path: &Path, mask: i32) -> KfsResult<()> {
        let idx = self.active_snapshot().into_iter().next().ok_or(Errno::ECHILD)?;
        self.subvols[idx].brick.access(ctx, path, mask)
    }

    fn create(&self, ctx: &Context, path: &Path, mode: u32, flags: i32) -> KfsResult<(u64, FileAttr)> {
        let snapshot = self.active_snapshot();
        if snapshot.is_empty() {
            return Err(Errno::ECHILD);
        }
        let mut ids = Vec::new();
        let mut fhs = Vec::new();
        let mut last_attr = None;
        for &idx in &snapshot {
            match self.subvols[idx].brick.create(ctx, path, mode, flags) {
                Ok((fh, attr)) => {
                    ids.push(idx);
                    fhs.push(fh);
                    last_attr = Some(attr);
                }
                Err(e) => {
                    for (&done_idx, &done_fh) in ids.iter().zip(fhs.iter()).rev() {
                        if let Err(re) = self.subvols[done_idx].brick.release(ctx, path, done_fh) {
                            warn!("mirror: release during create rollback failed on subvolume {done_idx}, ejecting: {re}");
                            self.eject(done_idx);
                        }
                        let _ = self.subvols[done_idx].brick.unlink(ctx, path);
                    }
                    return Err(e);
                }
            }
        }
        let handle = self.alloc_file_handle(ids, fhs);
        Ok((handle, last_attr.unwrap()))
    }

    fn ftruncate(&self, ctx: &Context, path: &Path, fh: u64, size: u64) -> KfsResult<()> {
        let handle = self.file_handles.lock().get(&fh).cloned().ok_or(Errno::EINVAL)?;
        self.per_handle_forward(&handle, |idx, sub_fh| {
            self.subvols[idx].brick.ftruncate(ctx, path, sub_fh, size)
        })
    }

    fn fgetattr(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<FileAttr> {
        let handle = self.file_handles.lock().get(&fh).cloned().ok_or(Errno::EINVAL)?;
        for (&idx, &sub_fh) in handle.subvol_ids.iter().zip(handle.subvol_fhs.iter()) {
            if self.is_active(idx) {
                return self.subvols[idx].brick.fgetattr(ctx, path, sub_fh);
            }
        }
        Err(Errno::ECHILD)
    }

    fn lock(
        &self,
        _ctx: &Context,
        _path: &Path,
        _fh: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        _pid: u32,
        _sleep: bool,
    ) -> KfsResult<()> {
        // Unimplemented by design: see the Open Question note on `locks`.
        Err(Errno::ENOTSUP)
    }

    fn bmap(&self, ctx: &Context, path: &Path, blocksize: u64, idx: u64) -> KfsResult<u64> {
        let subvol_idx = self.active_snapshot().into_iter().next().ok_or(Errno::ECHILD)?;
        self.subvols[subvol_idx].brick.bmap(ctx, path, blocksize, idx)
    }

    fn halt(&self) {
        for inst in self.subvols.iter().rev() {
            inst.halt_once();
        }
    }
}

pub fn init(
    _section: &ini::Properties,
    name: &str,
    subvolumes: Vec<BrickInstance>,
) -> Result<Arc<dyn Brick>, KfsError> {
    if subvolumes.is_empty() {
        return Err(KfsError::Config(format!(
            "'mirror' brick '{name}' requires at least 1 subvolume"
        )));
    }
    let count = subvolumes.len();
    Ok(Arc::new(MirrorBrick {
        subvols: subvolumes,
        active: RwLock::new(ActiveSet {
            bits: vec![true; count],
            count,
        }),
        file_handles: parking_lot::Mutex::new(HashMap::new()),
        dir_handles: parking_lot::Mutex::new(HashMap::new()),
        next_handle: AtomicU64::new(1),
        locks: StdMutex::new(HashSet::new()),
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

    // Built directly (not through `init`) so tests can reach the concrete
    // type's private fields (`active_snapshot`) without downcasting through
    // `dyn Brick`.
    fn mirror_over(dirs: &[&Path]) -> MirrorBrick {
        let subvols: Vec<_> = dirs.iter().map(|d| posix_over(d)).collect();
        let count = subvols.len();
        MirrorBrick {
            subvols,
            active: RwLock::new(ActiveSet {
                bits: vec![true; count],
                count,
            }),
            file_handles: parking_lot::Mutex::new(HashMap::new()),
            dir_handles: parking_lot::Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            locks: StdMutex::new(HashSet::new()),
        }
    }

    #[test]
    fn mknod_replicates_to_every_subvolume() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mirror = mirror_over(&[a.path(), b.path()]);
        let ctx = Context::new(0, 0, 0);
        mirror
            .mknod(&ctx, Path::new("/f"), libc::S_IFREG | 0o644, 0)
            .unwrap();
        assert!(a.path().join("f").exists());
        assert!(b.path().join("f").exists());
    }

    #[test]
    fn mknod_rolls_back_on_partial_failure() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mirror = mirror_over(&[a.path(), b.path()]);
        // Remove b's root after construction so its mknod fails with ENOENT
        // after a's has already succeeded — independent of DAC permissions,
        // which root bypasses.
        std::fs::remove_dir(b.path()).unwrap();

        let ctx = Context::new(0, 0, 0);
        let err = mirror
            .mknod(&ctx, Path::new("/f"), libc::S_IFREG | 0o644, 0)
            .unwrap_err();
        assert_eq!(err, Errno::ENOENT);
        assert!(!a.path().join("f").exists(), "rollback should have removed a's copy");
    }

    #[test]
    fn unlink_aborts_on_first_failure_without_ejecting() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(b.path().join("f"), b"x").unwrap();
        // a has no such file: first subvolume's unlink fails.
        let mirror = mirror_over(&[a.path(), b.path()]);
        let ctx = Context::new(0, 0, 0);
        let err = mirror.unlink(&ctx, Path::new("/f")).unwrap_err();
        assert_eq!(err, Errno::ENOENT);
        assert!(b.path().join("f").exists(), "b's copy must survive an aborted unlink");
        assert_eq!(mirror.active_snapshot().len(), 2, "first-failure abort must not eject");
    }

    /// Wraps a subvolume so its `write` always fails, whatever the
    /// underlying brick would have done — used to force the mirror's
    /// partial-write rollback path deterministically, without depending on
    /// OS-level permission semantics around already-open file descriptors.
    struct FlakyWriter {
        inner: Arc<dyn Brick>,
    }

    impl Brick for FlakyWriter {
        fn getattr(&self, ctx: &Context, path: &Path) -> KfsResult<FileAttr> {
            self.inner.getattr(ctx, path)
        }
        fn open(&self, ctx: &Context, path: &Path, flags: i32) -> KfsResult<u64> {
            self.inner.open(ctx, path, flags)
        }
        fn read(&self, ctx: &Context, path: &Path, fh: u64, offset: i64, size: u32) -> KfsResult<Vec<u8>> {
            self.inner.read(ctx, path, fh, offset, size)
        }
        fn write(&self, _ctx: &Context, _path: &Path, _fh: u64, _offset: i64, _data: &[u8]) -> KfsResult<u32> {
            Err(Errno::EIO)
        }
        fn release(&self, ctx: &Context, path: &Path, fh: u64) -> KfsResult<()> {
            self.inner.release(ctx, path, fh)
        }
    }

    #[test]
    fn write_rolls_back_from_backup_on_partial_failure() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("f"), b"0123456789").unwrap();
        std::fs::write(b.path().join("f"), b"0123456789").unwrap();

        let a_inst = posix_over(a.path());
        let b_inst = posix_over(b.path());
        let flaky_b = BrickInstance::new(Arc::new(FlakyWriter { inner: b_inst.brick }), b_inst.name);
        let subvols = vec![a_inst, flaky_b];
        let count = subvols.len();
        let mirror = MirrorBrick {
            subvols,
            active: RwLock::new(ActiveSet { bits: vec![true; count], count }),
            file_handles: parking_lot::Mutex::new(HashMap::new()),
            dir_handles: parking_lot::Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            locks: StdMutex::new(HashSet::new()),
        };

        let ctx = Context::new(0, 0, 0);
        let fh = mirror.open(&ctx, Path::new("/f"), libc::O_RDWR).unwrap();

        let result = mirror.write(&ctx, Path::new("/f"), fh, 0, b"XXXXX");
        assert!(result.is_err());
        let content = std::fs::read(a.path().join("f")).unwrap();
        assert_eq!(&content, b"0123456789", "a must be rolled back to its backup");
    }
}
