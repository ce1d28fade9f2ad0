//! Zygote management

pub mod import_cache;

pub use import_cache::ImportCache;
