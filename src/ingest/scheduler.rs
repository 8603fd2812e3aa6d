// src/ingest/scheduler.rs
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::ingest::checkpoint::CheckpointStore;
use crate::ingest::client::HttpFeedClient;
use crate::ingest::runner::{FeedExit, FeedRunner, FeedStatus};
use crate::ingest::types::EventSink;

/// Read side of every feed's status channel.
#[derive(Clone, Default)]
pub struct StatusBoard {
    feeds: Vec<watch::Receiver<FeedStatus>>,
}

impl StatusBoard {
    pub fn new(runners: &[FeedRunner]) -> Self {
        Self {
            feeds: runners.iter().map(FeedRunner::subscribe).collect(),
        }
    }

    pub fn snapshot(&self) -> Vec<FeedStatus> {
        self.feeds.iter().map(|rx| rx.borrow().clone()).collect()
    }

    pub fn any_halted(&self) -> bool {
        self.feeds.iter().any(|rx| rx.borrow().is_halted())
    }
}

/// One runner per enabled feed, each with its own HTTP client.
pub fn build_runners(
    cfg: &IngestConfig,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn CheckpointStore>,
) -> Result<Vec<FeedRunner>, IngestError> {
    cfg.enabled_feeds()
        .map(|feed| {
            let client = HttpFeedClient::new(
                feed.definition.clone(),
                feed.connection.clone(),
                cfg.retry,
            )?;
            Ok::<_, IngestError>(FeedRunner::new(
                feed.definition.clone(),
                Arc::new(client),
                sink.clone(),
                store.clone(),
            ))
        })
        .collect()
}

/// Spawn one task per feed. Each task yields its feed id and why it stopped.
pub fn spawn_feeds(
    runners: Vec<FeedRunner>,
    cancel: &CancellationToken,
) -> JoinSet<(&'static str, FeedExit)> {
    let mut set = JoinSet::new();
    for runner in runners {
        let feed = runner.definition().id();
        let cancel = cancel.child_token();
        set.spawn(async move { (feed, runner.run(cancel).await) });
    }
    set
}

/// Wait for every feed task. Returns the number that halted.
pub async fn wait_feeds(mut set: JoinSet<(&'static str, FeedExit)>) -> usize {
    let mut halted = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((feed, FeedExit::Halted(e))) => {
                halted += 1;
                tracing::error!(feed, error = %e, "feed stopped after terminal error");
            }
            Ok((feed, FeedExit::Cancelled)) => tracing::debug!(feed, "feed task finished"),
            Err(e) => {
                halted += 1;
                tracing::error!(error = %e, "feed task panicked");
            }
        }
    }
    halted
}

/// A single cycle for every feed, concurrently. Used by `run --once`.
pub async fn run_once_all(runners: Vec<FeedRunner>) -> Vec<(&'static str, Result<(), IngestError>)> {
    let mut set = JoinSet::new();
    for runner in runners {
        set.spawn(async move {
            let feed = runner.definition().id();
            (feed, runner.cycle_and_record().await)
        });
    }

    let mut out = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(r) => out.push(r),
            Err(e) => tracing::error!(error = %e, "feed task panicked"),
        }
    }
    out.sort_by_key(|(feed, _)| *feed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::checkpoint::MemoryCheckpointStore;
    use crate::ingest::sink::MemorySink;

    const CONFIG: &str = r#"
        [connection]
        base_url = "https://ot.example.net"
        api_key = "k"
        index = "ot"

        [feeds.alerts]
        [feeds.assets]
        [feeds.network]
        disabled = true
    "#;

    #[test]
    fn builds_one_runner_per_enabled_feed() {
        let cfg = IngestConfig::from_toml_str(CONFIG).unwrap();
        let runners = build_runners(
            &cfg,
            Arc::new(MemorySink::new()),
            Arc::new(MemoryCheckpointStore::new()),
        )
        .unwrap();
        let ids: Vec<_> = runners.iter().map(|r| r.definition().id()).collect();
        assert_eq!(ids, vec!["alerts", "assets"]);

        let board = StatusBoard::new(&runners);
        assert_eq!(board.snapshot().len(), 2);
        assert!(!board.any_halted());
    }
}
