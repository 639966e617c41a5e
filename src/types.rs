//! In-memory attribute and directory-entry types shared by every brick.
//!
//! `FileAttr` mirrors `fuser::FileAttr` field-for-field (`src/lib.rs` in the
//! teacher) since the mount bridge has to translate one into the other on
//! every reply.

use std::ffi::OsString;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    NamedPipe,
    CharDevice,
    BlockDevice,
    Directory,
    RegularFile,
    Symlink,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> FileKind {
        match mode & libc::S_IFMT {
            libc::S_IFIFO => FileKind::NamedPipe,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFSOCK => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }

    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::NamedPipe => libc::S_IFIFO,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::Directory => libc::S_IFDIR,
            FileKind::RegularFile => libc::S_IFREG,
            FileKind::Symlink => libc::S_IFLNK,
            FileKind::Socket => libc::S_IFSOCK,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// A single directory entry yielded during `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
    /// Opaque cookie identifying the entry *following* this one, so a
    /// subsequent `readdir` call can resume from here.
    pub offset: i64,
}

/// Sink a brick's `readdir` implementation feeds entries into.
///
/// Mirrors `fuser::ReplyDirectory::add`'s contract: returning `true` means
/// the caller's buffer is full and the brick should stop emitting entries.
pub trait DirEntryCollector {
    fn emit(&mut self, entry: DirEntry) -> bool;
}
