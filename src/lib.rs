//! Composable userspace filesystem bricks stacked over a FUSE mount.
//!
//! A `Brick` is a path-addressed filesystem operation vtable (see
//! [`brick::Brick`]); bricks stack into a tree (passthrough, cache, mirror
//! wrapping POSIX or TCP-client leaves) assembled from an INI config file
//! (see [`config::load_root`]) and mounted through [`mount::RootFilesystem`].

pub mod brick;
pub mod bricks;
pub mod config;
pub mod context;
pub mod errno;
pub mod error;
pub mod mount;
pub mod registry;
pub mod stat;
pub mod types;
pub mod util;
pub mod wire;

pub use brick::{Brick, BrickInstance};
pub use context::Context;
pub use errno::{Errno, KfsResult};
pub use error::KfsError;
pub use mount::RootFilesystem;
pub use registry::{default_registry, BrickRegistry};
