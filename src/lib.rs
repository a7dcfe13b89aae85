//! Market Explorer — scheduled ticker enrichment pipeline.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod net;
pub mod data;
pub mod llm;
pub mod engine;
pub mod storage;
