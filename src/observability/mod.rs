//! Observability
//!
//! Live view of every sandbox across pools, for debug dumps.

pub mod debugger;

pub use debugger::Debugger;
