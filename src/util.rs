//! Small helpers shared across bricks and the config loader.

use std::path::{Path, PathBuf};

use crate::errno::Errno;

/// Expands a leading `~` against `$HOME`, the way spec.md §6 describes for
/// the config-file path (and which the POSIX brick's `path` key also
/// honors, since it takes the same kind of user-supplied path string).
pub fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(raw)
}

pub fn io_error_to_errno(e: std::io::Error) -> Errno {
    Errno::from(e)
}

/// Joins a brick-relative path with a directory-entry name, the way every
/// creation-style FUSE call (`mkdir(parent, name)`, `unlink(parent, name)`)
/// is flattened into a single logical path before reaching a `Brick`.
pub fn join_name(parent: &Path, name: &std::ffi::OsStr) -> PathBuf {
    parent.join(name)
}
