//! Testing infrastructure
//!
//! An in-memory cgroup hierarchy, process-free sandboxes, and host mount
//! invariance checks.

pub mod fake_cgroupfs;
pub mod mock;
pub mod mount_invariance;

pub use fake_cgroupfs::FakeCgroupFs;
pub use mock::{MockControl, MockPool, MockResources, MockSandbox};
pub use mount_invariance::{capture_baseline, escaped_mounts, verify_mount_invariance};
