//! Integration tests module
//!
//! End-to-end tests of the run controller over in-memory and SQLite
//! repositories, including:
//! - Complete fetch → dedup → probe → rank → select pipeline
//! - Progress and phase ordering
//! - Cancellation and failure recovery

pub mod pipeline_test;
