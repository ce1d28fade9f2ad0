//! Language-agnostic sandbox core.
//!
//! Core owns the shared vocabulary (ids, states, metadata), the memory
//! accounting every pool charges against, and the evictor that keeps a pool
//! from running dry.

pub mod evictor;
pub mod memory;
pub mod types;
