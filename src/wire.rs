//! TCP client brick wire protocol (spec.md §6). A 5-byte banner handshake,
//! then `u32 size BE | u16 op_id BE | payload` requests and
//! `u32 return_code BE | u32 body_size BE | body` replies, capped at 1 MiB.

use std::io::{self, Read, Write};

pub const BANNER: [u8; 5] = *b"KFS\x01\x00";
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpId {
    Getattr = 1,
    Readlink = 2,
    Mknod = 3,
    Mkdir = 4,
    Unlink = 5,
    Rmdir = 6,
    Symlink = 7,
    Rename = 8,
    Link = 9,
    Chmod = 10,
    Chown = 11,
    Truncate = 12,
    Open = 13,
    Read = 14,
    Write = 15,
    Statfs = 16,
    Flush = 17,
    Release = 18,
    Fsync = 19,
    Setxattr = 20,
    Getxattr = 21,
    Listxattr = 22,
    Removexattr = 23,
    Opendir = 24,
    Readdir = 25,
    Releasedir = 26,
    Fsyncdir = 27,
    Access = 28,
    Create = 29,
    Ftruncate = 30,
    Fgetattr = 31,
    Lock = 32,
    Utimens = 33,
    Bmap = 34,
    Ioctl = 35,
    Poll = 36,
    Quit = 0xffff,
}

pub fn send_banner(stream: &mut impl Write) -> io::Result<()> {
    stream.write_all(&BANNER)
}

pub fn recv_banner(stream: &mut impl Read) -> io::Result<()> {
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf)?;
    if buf != BANNER {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad banner"));
    }
    Ok(())
}

pub fn write_request(stream: &mut impl Write, op: OpId, payload: &[u8]) -> io::Result<()> {
    if payload.len() as u32 > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "payload too large"));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(&(op as u16).to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Returns `(return_code, body)`. A negative `return_code` mirrors a
/// negated `Errno`; zero means success.
pub fn read_reply(stream: &mut impl Read) -> io::Result<(i32, Vec<u8>)> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header)?;
    let return_code = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let body_size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if body_size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "reply too large"));
    }
    let mut body = vec![0u8; body_size as usize];
    stream.read_exact(&mut body)?;
    Ok((return_code, body))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_round_trips_through_a_cursor() {
        let mut buf = Vec::new();
        write_request(&mut buf, OpId::Read, b"payload").unwrap();
        let size = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let op = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        assert_eq!(size, 7);
        assert_eq!(op, OpId::Read as u16);
        assert_eq!(&buf[6..], b"payload");
    }

    #[test]
    fn reply_round_trips() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(buf);
        let (code, body) = read_reply(&mut cursor).unwrap();
        assert_eq!(code, 0);
        assert_eq!(body, b"abc");
    }
}
