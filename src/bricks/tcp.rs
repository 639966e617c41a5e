//! TCP client brick (spec.md §4.4, §6, §7). A real, connectable
//! implementation of the wire protocol, kept deliberately thin per the
//! Non-goal "the TCP client brick is referenced only for its external wire
//! protocol, not reimplemented here": no pooling, no pipelining, no TLS,
//! and only the handful of operations needed to prove the framing end to
//! end are wired through `call`; everything else is the trait default.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::brick::{Brick, BrickInstance};
use crate::context::Context;
use crate::errno::{Errno, KfsResult};
use crate::error::KfsError;
use crate::stat::StatRecord;
use crate::types::FileAttr;
use crate::wire::{self, OpId};

const DEFAULT_RETRY_BUDGET: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

pub struct TcpBrick {
    addr: String,
    conn: Mutex<Option<Connection>>,
    retry_budget: u32,
    retry_delay: Duration,
}

impl TcpBrick {
    fn connect(&self) -> std::io::Result<Connection> {
        let stream = TcpStream::connect(&self.addr)?;
        let mut writer = BufWriter::new(stream.try_clone()?);
        let mut reader = BufReader::new(stream);
        wire::send_banner(&mut writer)?;
        wire::recv_banner(&mut reader)?;
        Ok(Connection { reader, writer })
    }

    fn ensure_connected<'a>(&self, guard: &'a mut Option<Connection>) -> KfsResult<&'a mut Connection> {
        if guard.is_none() {
            *guard = Some(self.connect().map_err(Errno::from)?);
        }
        Ok(guard.as_mut().unwrap())
    }

    /// Sends one request and returns its reply body, retrying transient
    /// connection failures up to `retry_budget` times with `retry_delay`
    /// between attempts (spec.md §7).
    fn call(&self, op: OpId, payload: &[u8]) -> KfsResult<Vec<u8>> {
        let mut attempts = 0;
        loop {
            let mut guard = self.conn.lock();
            let result = (|| -> KfsResult<Vec<u8>> {
                let conn = self.ensure_connected(&mut *guard)?;
                wire::write_request(&mut conn.writer, op, payload).map_err(Errno::from)?;
                let (code, body) = wire::read_reply(&mut conn.reader).map_err(Errno::from)?;
                if code != 0 {
                    return Err(Errno(-code));
                }
                Ok(body)
            })();

            match result {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempts < self.retry_budget => {
                    *guard = None;
                    drop(guard);
                    attempts += 1;
                    thread::sleep(self.retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Brick for TcpBrick {
    fn getattr(&self, _ctx: &Context, path: &Path) -> KfsResult<FileAttr> {
        let payload = path_bytes(path);
        let body = self.call(OpId::Getattr, &payload)?;
        let record = StatRecord::parse(&body).ok_or(Errno::EIO)?;
        Ok(record.to_attr(0))
    }

    fn read(&self, _ctx: &Context, path: &Path, _fh: u64, offset: i64, size: u32) -> KfsResult<Vec<u8>> {
        let mut payload = path_bytes(path);
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(&size.to_be_bytes());
        self.call(OpId::Read, &payload)
    }

    fn write(&self, _ctx: &Context, path: &Path, _fh: u64, offset: i64, data: &[u8]) -> KfsResult<u32> {
        let mut payload = path_bytes(path);
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(data);
        let body = self.call(OpId::Write, &payload)?;
        let n = body.get(0..4).ok_or(Errno::EIO)?;
        Ok(u32::from_be_bytes(n.try_into().unwrap()))
    }

    fn halt(&self) {
        let mut guard = self.conn.lock();
        if let Some(conn) = guard.as_mut() {
            let _ = wire::write_request(&mut conn.writer, OpId::Quit, &[]);
        }
        *guard = None;
    }
}

fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    let mut buf = (path.as_os_str().len() as u32).to_be_bytes().to_vec();
    buf.extend_from_slice(path.as_os_str().as_bytes());
    buf
}

pub fn init(
    section: &ini::Properties,
    name: &str,
    subvolumes: Vec<BrickInstance>,
) -> Result<Arc<dyn Brick>, KfsError> {
    if !subvolumes.is_empty() {
        return Err(KfsError::Config(format!(
            "'tcp' brick '{name}' is a terminal leaf, takes 0 subvolumes, got {}",
            subvolumes.len()
        )));
    }
    let host = section
        .get("host")
        .ok_or_else(|| KfsError::Config(format!("tcp brick '{name}' is missing a 'host' key")))?;
    let port: u16 = section
        .get("port")
        .ok_or_else(|| KfsError::Config(format!("tcp brick '{name}' is missing a 'port' key")))?
        .parse()
        .map_err(|_| KfsError::Config(format!("tcp brick '{name}' has a non-numeric 'port'")))?;
    Ok(Arc::new(TcpBrick {
        addr: format!("{host}:{port}"),
        conn: Mutex::new(None),
        retry_budget: DEFAULT_RETRY_BUDGET,
        retry_delay: DEFAULT_RETRY_DELAY,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_bytes_prefixes_length() {
        let bytes = path_bytes(Path::new("/a/b"));
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - 4);
    }

    #[test]
    fn init_rejects_missing_host() {
        let conf = ini::Ini::new();
        let props = conf.general_section().clone();
        let err = init(&props, "t", vec![]).unwrap_err();
        assert!(matches!(err, KfsError::Config(_)));
    }
}
