//! ICS telemetry ingest: binary entrypoint.
//! Loads the config, then polls every enabled feed until interrupted.
//!
//! See `README.md` for the config layout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ics_telemetry_ingest::config::{IngestConfig, DEFAULT_CONFIG_PATH};
use ics_telemetry_ingest::ingest::checkpoint::{CheckpointStore, FileCheckpointStore};
use ics_telemetry_ingest::ingest::client::HttpFeedClient;
use ics_telemetry_ingest::ingest::scheduler::{
    build_runners, run_once_all, spawn_feeds, wait_feeds, StatusBoard,
};
use ics_telemetry_ingest::ingest::sink::build_sink;
use ics_telemetry_ingest::ingest::types::FeedKind;
use ics_telemetry_ingest::metrics::Metrics;

#[derive(Parser, Debug)]
#[command(name = "ics-ingest", version, about = "ICS/OT security telemetry ingestion")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "ICS_INGEST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(
        long,
        env = "ICS_LOG_JSON",
        action = clap::ArgAction::SetTrue,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every enabled feed on its interval.
    Run {
        /// Run a single cycle per feed and exit.
        #[arg(long)]
        once: bool,
    },
    /// Verify connectivity and credentials for every enabled feed.
    Check,
    /// Inspect or reset stored markers.
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointAction {
    List,
    /// Forget a feed's marker; its next cycle starts from the configured start.
    Reset { feed: String },
}

/// Logs go to stderr; stdout may be the event destination.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ics_telemetry_ingest=info,warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let cfg = IngestConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Run { once } => run(cfg, once).await,
        Command::Check => check(&cfg).await,
        Command::Checkpoints { action } => checkpoints(&cfg, action).await,
    }
}

async fn run(cfg: IngestConfig, once: bool) -> Result<()> {
    let metrics = Metrics::install()?;
    let sink = build_sink(&cfg.destination).await?;
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(&cfg.checkpoint_dir));
    let runners = build_runners(&cfg, sink, store)?;

    if once {
        let mut halted = 0;
        for (feed, result) in run_once_all(runners).await {
            if let Err(e) = result {
                halted += 1;
                tracing::error!(feed, error = %e, "feed halted");
            }
        }
        if halted > 0 {
            bail!("{halted} feed(s) hit a terminal error");
        }
        return Ok(());
    }

    let total = runners.len();
    let board = StatusBoard::new(&runners);
    let cancel = CancellationToken::new();

    if let Some(addr) = cfg.status_listen {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding status endpoint on {addr}"))?;
        let app = ics_telemetry_ingest::api::router(board, &metrics);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = ics_telemetry_ingest::api::serve(listener, app, cancel).await {
                tracing::error!(error = %e, "status endpoint failed");
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            cancel.cancel();
        });
    }

    tracing::info!(feeds = total, "ingest started");
    let halted = wait_feeds(spawn_feeds(runners, &cancel)).await;
    cancel.cancel();

    if halted > 0 {
        bail!("{halted} of {total} feed(s) halted on terminal errors");
    }
    Ok(())
}

async fn check(cfg: &IngestConfig) -> Result<()> {
    let mut failed = 0;
    for feed in cfg.enabled_feeds() {
        let id = feed.definition.id();
        let client =
            HttpFeedClient::new(feed.definition.clone(), feed.connection.clone(), cfg.retry)?;
        match client.check_connection().await {
            Ok(version) => println!("{id}: ok ({}) {version}", feed.connection.base_url),
            Err(e) => {
                failed += 1;
                println!("{id}: FAILED {e}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} feed(s) failed the connectivity check");
    }
    Ok(())
}

async fn checkpoints(cfg: &IngestConfig, action: CheckpointAction) -> Result<()> {
    let store = FileCheckpointStore::new(&cfg.checkpoint_dir);
    match action {
        CheckpointAction::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("no checkpoints in {}", store.dir().display());
            }
            for r in records {
                let marker = r
                    .state
                    .marker
                    .as_ref()
                    .map_or_else(|| "(start)".to_string(), ToString::to_string);
                let refreshed = r
                    .state
                    .last_full_refresh
                    .map(|t| format!(" full-refresh={}", t.to_rfc3339()))
                    .unwrap_or_default();
                println!(
                    "{:<16} {:<40} {}{refreshed}",
                    r.feed,
                    marker,
                    r.updated_at.to_rfc3339()
                );
            }
        }
        CheckpointAction::Reset { feed } => {
            let kind: FeedKind = feed.parse()?;
            if store.clear(kind.id()).await? {
                println!("{}: checkpoint cleared", kind.id());
            } else {
                println!("{}: no checkpoint stored", kind.id());
            }
        }
    }
    Ok(())
}
