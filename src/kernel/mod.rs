//! Thin wrappers around Linux kernel primitives.
//!
//! Dependency direction: mount -> cgroup -> fdpass

pub mod cgroup;
pub mod fdpass;
pub mod mount;
