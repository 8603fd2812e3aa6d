// src/ingest/mod.rs
pub mod checkpoint;
pub mod client;
pub mod feeds;
pub mod pager;
pub mod runner;
pub mod scheduler;
pub mod sink;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use client::{HttpFeedClient, RetryPolicy};
pub use pager::fetch_since;
pub use runner::{CycleOutcome, CycleReport, FeedExit, FeedPhase, FeedRunner, FeedStatus};
pub use scheduler::StatusBoard;
pub use types::{EventSink, FeedDefinition, FeedKind, FeedSource, IndexedEvent, Marker};

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_records_emitted_total",
            "Records written to the destination, per feed."
        );
        describe_counter!("ingest_cycles_total", "Completed ingestion cycles, per feed.");
        describe_counter!(
            "ingest_fetch_retries_total",
            "Upstream requests retried after a transient failure."
        );
        describe_counter!(
            "ingest_feed_errors_total",
            "Failed cycles, labelled by feed and error kind."
        );
        describe_counter!(
            "ingest_full_refreshes_total",
            "Cycles that rewound to the start of history for a full refresh."
        );
        describe_histogram!("ingest_cycle_ms", "Cycle duration in milliseconds.");
        describe_gauge!(
            "ingest_checkpoint_unix",
            "Unix ts of the last persisted timestamp marker."
        );
    });
}
