//! Ambient error handling for the composition runtime (SPEC_FULL.md §4).
//!
//! Kept deliberately small and hand-rolled in the same unadorned style the
//! teacher uses for its own public API (plain `io::Result`, no `anyhow` or
//! `thiserror` anywhere in its dependency tree).

use std::fmt;

use crate::errno::Errno;

#[derive(Debug)]
pub enum KfsError {
    Io(std::io::Error),
    Config(String),
    UnsupportedKind(String),
    Brick { name: String, errno: Errno },
}

impl fmt::Display for KfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KfsError::Io(e) => write!(f, "i/o error: {e}"),
            KfsError::Config(msg) => write!(f, "configuration error: {msg}"),
            KfsError::UnsupportedKind(kind) => write!(f, "unknown brick kind '{kind}'"),
            KfsError::Brick { name, errno } => write!(f, "brick '{name}' failed: {errno}"),
        }
    }
}

impl std::error::Error for KfsError {}

impl From<std::io::Error> for KfsError {
    fn from(e: std::io::Error) -> Self {
        KfsError::Io(e)
    }
}

impl From<ini::Error> for KfsError {
    fn from(e: ini::Error) -> Self {
        KfsError::Config(e.to_string())
    }
}
