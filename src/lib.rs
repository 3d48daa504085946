//! linewatch: betting-odds ingestion and consensus scanning.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod fetch;
pub mod storage;
pub mod sources;
pub mod scheduler;
pub mod consensus;
