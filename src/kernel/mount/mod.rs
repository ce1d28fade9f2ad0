//! Filesystem isolation and mount management
//!
//! Assembles and tears down sandbox roots, and reads the mount table to prove
//! teardown left nothing behind.

pub mod mountinfo;
pub mod rootfs;

pub use mountinfo::{mounts_under, MountEntry};
pub use rootfs::RootFs;
