// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;

pub use crate::api::router;
pub use crate::config::IngestConfig;
pub use crate::error::{CheckpointError, IngestError};
