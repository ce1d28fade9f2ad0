//! Cgroup v1 resource governance
//!
//! Sandbox nodes ([`Cgroup`]), the pool that pre-builds and recycles them
//! ([`CgroupPool`]), and the filesystem seam both operate through
//! ([`CgroupFs`]).

pub mod fs;
pub mod pool;
pub mod v1;

pub use fs::{CgroupFs, HostCgroupFs};
pub use pool::{CgroupPool, CGROUP_RESERVE};
pub use v1::{Cgroup, CgroupLayout, FREEZE_TIMEOUT};
