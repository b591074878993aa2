//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod edits;
pub mod path;
pub mod requirement;
pub mod slots;
pub mod text;
pub mod types;
