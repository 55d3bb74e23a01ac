//! Persistence for groups, servers and latency measurements
//!
//! The pipeline only depends on the [`ServerRepository`] trait. Two
//! implementations ship with the crate: a SQLite store used by the CLI and
//! an in-memory store for tests and embedding.

pub mod repository;

pub use repository::{MemoryServerRepository, ServerRepository, SqliteServerRepository};
