//! wxpush Storage - persistence contracts and backends
//!
//! This crate provides:
//! - `ArchiveStore`: what the archive server reads and writes
//! - `StationStore`: local data and image replication rows on the station
//! - `MemoryStore`: in-process backend for tests and small deployments
//! - `PgStore`: PostgreSQL backend

mod engine;
mod memory;
mod model;
pub mod postgres;

pub use engine::*;
pub use memory::*;
pub use model::*;
pub use postgres::{IMAGE_CHANNEL, LIVE_CHANNEL, PgStore, SAMPLE_CHANNEL};
