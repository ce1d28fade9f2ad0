//! sockbox: SOCK sandbox engine for serverless handlers
//! Lightweight Linux containers that start in milliseconds by forking a
//! pre-initialised Zygote and shrinking the memory of paused sandboxes
//!
//! # Architecture
//!
//! This crate is organized bottom-up, from kernel primitives to the
//! worker-wide engine:
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: cgroup v1 nodes, the pool that recycles them, and the
//!   filesystem seam both go through
//! - [`kernel::mount`]: bind-mount root filesystem assembly and
//!   `/proc/self/mountinfo` parsing
//! - [`kernel::fdpass`]: `SCM_RIGHTS` fork requests to a Zygote's guest
//!
//! ## Core ([`core`])
//! - [`core::types`]: sandbox ids, states, runtimes and metadata
//! - [`core::memory`]: FIFO memory accounting shared by a pool's sandboxes
//! - [`core::evictor`]: event-driven eviction under memory pressure
//!
//! ## Sandboxes ([`sandbox`])
//! - [`sandbox::sock`]: the SOCK container (pause, unpause, fork, destroy)
//! - [`sandbox::safe`]: the shared, auto-destroying handle
//! - [`sandbox::pool`]: sandbox creation with full unwinding on failure
//! - [`sandbox::registry`]: parent/child lifetime tracking for forked
//!   sandboxes
//!
//! ## Zygotes ([`cache`])
//! - [`cache::import_cache`]: the Zygote tree leaves fork from
//!
//! ## Observability ([`observability`])
//! - [`observability::debugger`]: cross-pool sandbox dumps
//!
//! ## Configuration ([`config`])
//! - [`config::worker`]: JSON worker configuration and limits
//! - [`config::types`]: the shared error type
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::fake_cgroupfs`]: in-memory cgroup v1 hierarchy
//! - [`testing::mock`]: process-free sandboxes and pools
//! - [`testing::mount_invariance`]: host mount table checks
//!
//! # Design Principles
//!
//! 1. **Kernel as truth** - limits, usage and freezer state are read back
//!    from cgroup files, never assumed
//! 2. **Unwind everything** - a failed create leaves no memory charged, no
//!    cgroup held and no mount behind
//! 3. **Children before parents** - a Zygote's resources outlive every
//!    sandbox forked from it
//! 4. **Minimal unsafe** - `pre_exec` hooks and `poll`, each with its SAFETY
//!    note

// Kernel Primitives
pub mod kernel;

// Sandbox runtime core
pub mod core;

// Sandboxes and pools
pub mod sandbox;

// Zygote management
pub mod cache;

// Host scratch state
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Worker-wide wiring
pub mod engine;

// Testing Infrastructure
pub mod testing;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use engine::Engine;
