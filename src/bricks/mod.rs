pub mod cache;
pub mod mirror;
pub mod passthrough;
pub mod posix;
pub mod tcp;
