//! Host-side scratch state
//!
//! Per-sandbox scratch directories and their removal at pool shutdown.

pub mod scratch;

pub use scratch::ScratchDirs;
