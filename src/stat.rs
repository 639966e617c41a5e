//! The 52-byte cached stat record (spec.md §3, §6, §8).
//!
//! Thirteen big-endian `u32` fields, serialized with `zerocopy` the same way
//! the teacher serializes its own kernel ABI structs (`src/ll/fuse_abi.rs`)
//! instead of hand-rolling `to_be_bytes` chains.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::types::{FileAttr, FileKind};

pub const STAT_RECORD_LEN: usize = 52;

#[derive(FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout, Debug, Clone, Copy)]
#[repr(C)]
pub struct StatRecord {
    pub device: U32,
    pub inode: U32,
    pub mode: U32,
    pub nlink: U32,
    pub uid: U32,
    pub gid: U32,
    pub rdev: U32,
    pub size: U32,
    pub blksize: U32,
    pub blocks: U32,
    pub atime: U32,
    pub mtime: U32,
    pub ctime: U32,
}

fn secs(t: SystemTime) -> u32 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn from_secs(s: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(s as u64)
}

impl StatRecord {
    pub fn from_attr(attr: &FileAttr) -> StatRecord {
        StatRecord {
            device: U32::new(0),
            inode: U32::new(attr.ino as u32),
            mode: U32::new(attr.kind.mode_bits() | attr.perm as u32),
            nlink: U32::new(attr.nlink),
            uid: U32::new(attr.uid),
            gid: U32::new(attr.gid),
            rdev: U32::new(attr.rdev),
            size: U32::new(attr.size as u32),
            blksize: U32::new(attr.blksize),
            blocks: U32::new(attr.blocks as u32),
            atime: U32::new(secs(attr.atime)),
            mtime: U32::new(secs(attr.mtime)),
            ctime: U32::new(secs(attr.ctime)),
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<StatRecord> {
        StatRecord::read_from_bytes(bytes).ok()
    }

    pub fn to_attr(&self, ino: u64) -> FileAttr {
        let mode = self.mode.get();
        FileAttr {
            ino,
            size: self.size.get() as u64,
            blocks: self.blocks.get() as u64,
            atime: from_secs(self.atime.get()),
            mtime: from_secs(self.mtime.get()),
            ctime: from_secs(self.ctime.get()),
            kind: FileKind::from_mode(mode),
            perm: (mode & 0o7777) as u16,
            nlink: self.nlink.get(),
            uid: self.uid.get(),
            gid: self.gid.get(),
            rdev: self.rdev.get(),
            blksize: self.blksize.get(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::FileKind;

    fn sample_attr() -> FileAttr {
        FileAttr {
            ino: 42,
            size: 1234,
            blocks: 8,
            atime: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            mtime: UNIX_EPOCH + Duration::from_secs(1_700_000_001),
            ctime: UNIX_EPOCH + Duration::from_secs(1_700_000_002),
            kind: FileKind::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            blksize: 4096,
        }
    }

    #[test]
    fn round_trips_through_52_bytes() {
        let attr = sample_attr();
        let record = StatRecord::from_attr(&attr);
        let bytes = record.as_bytes();
        assert_eq!(bytes.len(), STAT_RECORD_LEN);

        let parsed = StatRecord::parse(bytes).expect("valid 52-byte record");
        let back = parsed.to_attr(attr.ino);
        assert_eq!(back.size, attr.size);
        assert_eq!(back.perm, attr.perm);
        assert_eq!(back.kind, attr.kind);
        assert_eq!(back.uid, attr.uid);
        assert_eq!(back.gid, attr.gid);
        assert_eq!(secs(back.mtime), secs(attr.mtime));
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(StatRecord::parse(&[0u8; 10]).is_none());
    }

    #[test]
    fn encodes_big_endian() {
        let mut attr = sample_attr();
        attr.ino = 0x0102_0304;
        let record = StatRecord::from_attr(&attr);
        let bytes = record.as_bytes();
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
    }
}
