// src/ingest/runner.rs
//! Per-feed ingestion loop: fetch, emit, then checkpoint.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::IngestError;
use crate::ingest::checkpoint::{Checkpoint, CheckpointStore};
use crate::ingest::pager::fetch_since;
use crate::ingest::types::{
    EventSink, FeedDefinition, FeedSource, IndexedEvent, Marker, StartPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedPhase {
    Idle,
    Fetching,
    Emitting,
    Checkpointing,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Ok,
    Skipped,
    Halted,
}

/// Operator-visible state of one feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedStatus {
    pub feed: String,
    pub phase: FeedPhase,
    pub last_outcome: Option<CycleOutcome>,
    pub last_error: Option<String>,
    pub records_emitted_total: u64,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub marker: Option<Marker>,
}

impl FeedStatus {
    pub fn new(feed: &str) -> Self {
        Self {
            feed: feed.to_string(),
            phase: FeedPhase::Idle,
            last_outcome: None,
            last_error: None,
            records_emitted_total: 0,
            cycles: 0,
            last_cycle_at: None,
            marker: None,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.phase == FeedPhase::Halted
    }
}

/// Result of one successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub pages: u32,
    pub records: u64,
    /// Marker persisted by this cycle, if it moved.
    pub checkpointed: Option<Marker>,
}

/// Where a cycle starts reading and what it carries forward.
#[derive(Debug, Clone, PartialEq)]
struct CyclePlan {
    since: Option<Marker>,
    delivered: Vec<String>,
    last_full_refresh: Option<DateTime<Utc>>,
    full_refresh: bool,
}

/// Why a feed loop returned.
#[derive(Debug)]
pub enum FeedExit {
    Cancelled,
    Halted(IngestError),
}

pub struct FeedRunner {
    def: FeedDefinition,
    source: Arc<dyn FeedSource>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn CheckpointStore>,
    status: watch::Sender<FeedStatus>,
}

impl FeedRunner {
    pub fn new(
        def: FeedDefinition,
        source: Arc<dyn FeedSource>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (status, _) = watch::channel(FeedStatus::new(def.id()));
        Self {
            def,
            source,
            sink,
            store,
            status,
        }
    }

    pub fn definition(&self) -> &FeedDefinition {
        &self.def
    }

    /// Live status; receivers see every phase change.
    pub fn subscribe(&self) -> watch::Receiver<FeedStatus> {
        self.status.subscribe()
    }

    fn set_phase(&self, phase: FeedPhase) {
        self.status.send_modify(|s| s.phase = phase);
        tracing::debug!(feed = self.def.id(), ?phase, "phase");
    }

    /// One fetch, emit, checkpoint pass. The checkpoint is written only after
    /// every page has been accepted by the sink, so a failure anywhere leaves
    /// the stored marker untouched and the next cycle re-reads the same range.
    pub async fn run_cycle(&self) -> Result<CycleReport, IngestError> {
        let feed = self.def.id();
        self.set_phase(FeedPhase::Fetching);

        let stored = self.store.get(feed).await?;
        let plan = self.plan(stored.as_ref(), Utc::now());
        if plan.full_refresh {
            counter!("ingest_full_refreshes_total", "feed" => feed).increment(1);
            tracing::info!(feed, "full refresh due; reading from the beginning of history");
        }

        let mut pages = fetch_since(self.source.as_ref(), &self.def, plan.since.clone())
            .skipping(&plan.delivered);
        let mut records = 0u64;
        while let Some(batch) = pages.next_page().await? {
            if batch.is_empty() {
                continue;
            }
            self.set_phase(FeedPhase::Emitting);
            let now = Utc::now();
            let events: Vec<IndexedEvent> = batch
                .into_iter()
                .map(|r| IndexedEvent::new(&self.def, r, now))
                .collect();
            self.sink.write_batch(&events).await?;

            let n = events.len() as u64;
            records += n;
            counter!("ingest_records_emitted_total", "feed" => feed).increment(n);
            self.status.send_modify(|s| s.records_emitted_total += n);
            self.set_phase(FeedPhase::Fetching);
        }

        self.set_phase(FeedPhase::Checkpointing);
        let stored_marker = stored.as_ref().and_then(|s| s.marker.clone());
        let next = Checkpoint {
            marker: pages
                .next_marker()
                .map(|m| Marker::advance(stored_marker.as_ref(), m)),
            delivered: pages.delivered(),
            last_full_refresh: plan.last_full_refresh,
        };
        let changed = match &stored {
            Some(prev) => *prev != next,
            None => next != Checkpoint::default(),
        };

        let mut checkpointed = None;
        if changed {
            self.store.set(feed, &next).await?;
            if let Some(ts) = next.marker.as_ref().and_then(Marker::timestamp) {
                gauge!("ingest_checkpoint_unix", "feed" => feed).set(ts.timestamp() as f64);
            }
            if next.marker != stored_marker {
                checkpointed = next.marker.clone();
            }
        }

        let marker = next.marker;
        self.status.send_modify(|s| s.marker = marker);

        Ok(CycleReport {
            pages: pages.pages(),
            records,
            checkpointed,
        })
    }

    /// Resume point for this cycle. A due full refresh rewinds to the start
    /// of history and drops carried fingerprints; the stored timestamp still
    /// never moves backwards because the new marker is advanced against it.
    fn plan(&self, stored: Option<&Checkpoint>, now: DateTime<Utc>) -> CyclePlan {
        let resume = CyclePlan {
            since: stored
                .and_then(|s| s.marker.clone())
                .or_else(|| self.def.start.initial_marker(&self.def.marker, now)),
            delivered: stored.map(|s| s.delivered.clone()).unwrap_or_default(),
            last_full_refresh: stored.and_then(|s| s.last_full_refresh),
            full_refresh: false,
        };
        let Some(every) = self.def.full_refresh else {
            return resume;
        };

        match resume.last_full_refresh {
            // First sighting: the configured start already covers history.
            None => CyclePlan {
                last_full_refresh: Some(now),
                ..resume
            },
            Some(last) if (now - last).to_std().is_ok_and(|elapsed| elapsed > every) => {
                CyclePlan {
                    since: StartPolicy::FullHistory.initial_marker(&self.def.marker, now),
                    delivered: Vec::new(),
                    last_full_refresh: Some(now),
                    full_refresh: true,
                }
            }
            Some(_) => resume,
        }
    }

    /// Cycle once, then every `poll_interval`, until cancelled or halted.
    /// Ticks missed while a cycle runs are dropped rather than queued.
    pub async fn run(self, cancel: CancellationToken) -> FeedExit {
        let feed = self.def.id();
        let mut ticker = tokio::time::interval(self.def.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            feed,
            interval_secs = self.def.poll_interval.as_secs(),
            index = %self.def.index,
            "feed started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.cycle_and_record() => r,
            };
            if let Err(e) = result {
                return FeedExit::Halted(e);
            }
        }

        self.set_phase(FeedPhase::Idle);
        tracing::info!(feed, "feed stopped");
        FeedExit::Cancelled
    }

    /// Run one cycle and publish its outcome. Only terminal errors are
    /// returned.
    pub async fn cycle_and_record(&self) -> Result<(), IngestError> {
        let feed = self.def.id();
        let started = Instant::now();
        let result = self.run_cycle().await;
        let ms = started.elapsed().as_secs_f64() * 1_000.0;

        histogram!("ingest_cycle_ms", "feed" => feed).record(ms);
        counter!("ingest_cycles_total", "feed" => feed).increment(1);

        match result {
            Ok(report) => {
                tracing::info!(
                    feed,
                    pages = report.pages,
                    records = report.records,
                    marker = report.checkpointed.as_ref().map(tracing::field::display),
                    elapsed_ms = ms as u64,
                    "cycle complete"
                );
                self.finish(CycleOutcome::Ok, None, FeedPhase::Idle);
                Ok(())
            }
            Err(e) if e.is_terminal() => {
                counter!("ingest_feed_errors_total", "feed" => feed, "kind" => e.kind())
                    .increment(1);
                tracing::error!(feed, kind = e.kind(), error = %e, "feed halted");
                self.finish(CycleOutcome::Halted, Some(e.to_string()), FeedPhase::Halted);
                Err(e)
            }
            Err(e) => {
                counter!("ingest_feed_errors_total", "feed" => feed, "kind" => e.kind())
                    .increment(1);
                tracing::warn!(feed, kind = e.kind(), error = %e, "cycle skipped; checkpoint unchanged");
                self.finish(CycleOutcome::Skipped, Some(e.to_string()), FeedPhase::Idle);
                Ok(())
            }
        }
    }

    fn finish(&self, outcome: CycleOutcome, error: Option<String>, phase: FeedPhase) {
        self.status.send_modify(|s| {
            s.phase = phase;
            s.last_outcome = Some(outcome);
            s.last_error = error;
            s.cycles += 1;
            s.last_cycle_at = Some(Utc::now());
        });
    }
}
