//! Configuration and shared error types
//!
//! The worker configuration replaces the process-global settings a worker
//! reads at startup; it is built once and threaded through the engine.

pub mod types;
pub mod worker;

pub use types::{Result, SockError};
pub use worker::{Features, Limits, WorkerConfig};
