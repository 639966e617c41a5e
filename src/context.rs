//! Per-call caller identity (spec.md §3).

/// Threaded into every [`crate::brick::Brick`] operation.
///
/// The original design also threads a pointer to the receiving brick's own
/// state through this record, since its C-flavored composition runtime has
/// no other way to recover "which instance is this". In Rust each brick
/// already owns its state via `&self`/`Arc<Self>`, so `Context` only needs
/// to carry who's calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl Context {
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self { uid, gid, pid }
    }
}
