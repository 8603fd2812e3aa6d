// src/ingest/sink.rs
//! Event destinations. Every sink is shared by all feed tasks, so each
//! batch is written under a lock and lines from different feeds never
//! interleave.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::settings::Credential;
use crate::config::DestinationConfig;
use crate::error::IngestError;
use crate::ingest::client::USER_AGENT;
use crate::ingest::types::{EventSink, IndexedEvent};

pub const HEC_EVENT_PATH: &str = "/services/collector/event";

/// Build the configured destination.
pub async fn build_sink(dest: &DestinationConfig) -> Result<Arc<dyn EventSink>, IngestError> {
    let sink: Arc<dyn EventSink> = match dest {
        DestinationConfig::Stdout => Arc::new(StdoutSink::new()),
        DestinationConfig::File { path } => Arc::new(FileSink::open(path).await?),
        DestinationConfig::Hec {
            url,
            token,
            tls_verify,
            timeout,
        } => Arc::new(HecSink::new(url, token, *tls_verify, *timeout)?),
    };
    tracing::info!(sink = sink.name(), "event destination ready");
    Ok(sink)
}

fn encode_lines(events: &[IndexedEvent]) -> Result<Vec<u8>, IngestError> {
    let mut buf = Vec::with_capacity(events.len() * 256);
    for ev in events {
        serde_json::to_writer(&mut buf, ev)
            .map_err(|e| IngestError::Sink(format!("encoding event: {e}")))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// One JSON line per event on standard output.
pub struct StdoutSink {
    out: Mutex<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    async fn write_batch(&self, events: &[IndexedEvent]) -> Result<(), IngestError> {
        if events.is_empty() {
            return Ok(());
        }
        let buf = encode_lines(events)?;
        let mut out = self.out.lock().await;
        out.write_all(&buf)
            .await
            .map_err(|e| IngestError::Sink(format!("stdout: {e}")))?;
        out.flush()
            .await
            .map_err(|e| IngestError::Sink(format!("stdout: {e}")))
    }

    fn name(&self) -> &'static str {
        "stdout"
    }
}

/// Append-only JSON lines file, synced after every batch.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileSink {
    pub async fn open(path: &Path) -> Result<Self, IngestError> {
        let sink_err = |e: std::io::Error| IngestError::Sink(format!("{}: {e}", path.display()));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(sink_err)?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(sink_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for FileSink {
    async fn write_batch(&self, events: &[IndexedEvent]) -> Result<(), IngestError> {
        if events.is_empty() {
            return Ok(());
        }
        let buf = encode_lines(events)?;
        let sink_err = |e: std::io::Error| IngestError::Sink(format!("{}: {e}", self.path.display()));
        let mut file = self.file.lock().await;
        file.write_all(&buf).await.map_err(sink_err)?;
        file.flush().await.map_err(sink_err)?;
        file.sync_data().await.map_err(sink_err)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// HTTP Event Collector. One request per batch.
pub struct HecSink {
    http: reqwest::Client,
    endpoint: Url,
}

impl HecSink {
    pub fn new(
        base: &Url,
        token: &Credential,
        tls_verify: bool,
        timeout: Duration,
    ) -> Result<Self, IngestError> {
        let mut auth = HeaderValue::from_str(&format!("Splunk {}", token.expose()))
            .map_err(|_| IngestError::Configuration("hec token contains invalid characters".into()))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .danger_accept_invalid_certs(!tls_verify)
            .build()
            .map_err(|e| IngestError::Configuration(format!("building hec client: {e}")))?;

        let trimmed = base.as_str().trim_end_matches('/');
        let endpoint = Url::parse(&format!("{trimmed}{HEC_EVENT_PATH}"))
            .map_err(|e| IngestError::Configuration(format!("hec url: {e}")))?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// HEC envelope for one event. Routing tags sit at the top level and the
/// dataset travels as an indexed field.
pub fn hec_envelope(ev: &IndexedEvent) -> serde_json::Value {
    json!({
        "time": ev.time,
        "index": ev.index,
        "source": ev.source,
        "sourcetype": ev.sourcetype,
        "event": ev.event,
        "fields": {
            "dataset": ev.dataset,
            "ingested_at": ev.ingested_at.to_rfc3339(),
        },
    })
}

#[async_trait]
impl EventSink for HecSink {
    async fn write_batch(&self, events: &[IndexedEvent]) -> Result<(), IngestError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for ev in events {
            body.push_str(&hec_envelope(ev).to_string());
            body.push('\n');
        }

        let resp = self
            .http
            .post(self.endpoint.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| IngestError::Sink(format!("hec request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(IngestError::Sink(format!(
                "hec rejected batch of {}: {status} {}",
                events.len(),
                text.chars().take(200).collect::<String>()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "hec"
    }
}

// --- Test helper ---
/// Collects batches in memory. Can be told to reject writes.
#[derive(Default)]
pub struct MemorySink {
    pub batches: std::sync::Mutex<Vec<Vec<IndexedEvent>>>,
    fail: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every event accepted so far, in write order.
    pub fn events(&self) -> Vec<IndexedEvent> {
        self.lock().iter().flatten().cloned().collect()
    }

    pub fn batch_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<IndexedEvent>>> {
        self.batches.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn write_batch(&self, events: &[IndexedEvent]) -> Result<(), IngestError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(IngestError::Sink("memory sink rejecting writes".into()));
        }
        if !events.is_empty() {
            self.lock().push(events.to_vec());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::feeds;
    use crate::ingest::types::FeedKind;
    use chrono::{TimeZone, Utc};

    fn event(id: u32) -> IndexedEvent {
        let def = feeds::builtin(FeedKind::Alerts, "ot_security");
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        IndexedEvent::new(
            &def,
            json!({"id": id, "timestamp": "2024-01-01T01:00:00Z"}),
            now,
        )
    }

    #[test]
    fn hec_envelope_carries_routing_tags() {
        let env = hec_envelope(&event(7));
        assert_eq!(env["index"], "ot_security");
        assert_eq!(env["sourcetype"], "ics:alerts");
        assert_eq!(env["source"], "ics-ingest:alerts");
        assert_eq!(env["fields"]["dataset"], "alerts");
        assert_eq!(env["event"]["id"], 7);
        assert_eq!(env["time"].as_f64().unwrap(), 1_704_070_800.0);
    }

    #[test]
    fn hec_endpoint_keeps_base_path() {
        let base = Url::parse("https://hec.example.net:8088/").unwrap();
        let sink = HecSink::new(&base, &Credential::new("t"), true, Duration::from_secs(5)).unwrap();
        assert_eq!(
            sink.endpoint().as_str(),
            "https://hec.example.net:8088/services/collector/event"
        );
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out/events.jsonl");
        let sink = FileSink::open(&path).await.unwrap();
        sink.write_batch(&[event(1), event(2)]).await.unwrap();
        sink.write_batch(&[]).await.unwrap();
        sink.write_batch(&[event(3)]).await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<u64> = body
            .lines()
            .map(|l| serde_json::from_str::<IndexedEvent>(l).unwrap().event["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reopening_file_sink_does_not_truncate() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("events.jsonl");
        FileSink::open(&path).await.unwrap().write_batch(&[event(1)]).await.unwrap();
        FileSink::open(&path).await.unwrap().write_batch(&[event(2)]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn memory_sink_failure_switch() {
        let sink = MemorySink::new();
        sink.write_batch(&[event(1)]).await.unwrap();
        sink.fail_writes(true);
        assert!(matches!(
            sink.write_batch(&[event(2)]).await,
            Err(IngestError::Sink(_))
        ));
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.batch_count(), 1);
    }
}
