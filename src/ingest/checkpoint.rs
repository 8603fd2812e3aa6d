// src/ingest/checkpoint.rs
//! Durable per-feed markers.
//!
//! One JSON file per feed. Writes go to a sibling temp file which is fsynced
//! and renamed over the old one, so a crash leaves either the previous or the
//! new marker on disk, never a torn file.
//!
//! Files written before `delivered` and `last_full_refresh` existed still
//! load; both fields default to empty.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::ingest::types::Marker;

/// Everything a feed carries from one cycle to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Resume position. `None` means the feed's configured start.
    pub marker: Option<Marker>,
    /// Fingerprints of records already delivered at the resume position.
    /// Only cursor feeds whose upstream stops reporting a cursor fill this.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivered: Vec<String>,
    /// When the feed last rewound for a full refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_refresh: Option<DateTime<Utc>>,
}

impl From<Marker> for Checkpoint {
    fn from(marker: Marker) -> Self {
        Self {
            marker: Some(marker),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub feed: String,
    #[serde(flatten)]
    pub state: Checkpoint,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, feed: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Replace the feed's checkpoint atomically.
    async fn set(&self, feed: &str, state: &Checkpoint) -> Result<(), CheckpointError>;

    async fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError>;

    /// Drop a feed's marker. Returns whether one existed.
    async fn clear(&self, feed: &str) -> Result<bool, CheckpointError>;
}

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, feed: &str) -> PathBuf {
        self.dir.join(format!("{feed}.json"))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn read_record(path: &Path) -> Result<Option<CheckpointRecord>, CheckpointError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| CheckpointError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn write_atomic(dir: &Path, path: &Path, record: &CheckpointRecord) -> Result<(), CheckpointError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let body = serde_json::to_vec_pretty(record).map_err(|e| io_err(path, e.into()))?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut f = std::fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        f.write_all(&body).map_err(|e| io_err(&tmp, e))?;
        f.sync_all().map_err(|e| io_err(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    sync_dir(dir);
    Ok(())
}

/// Persist the rename itself.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = std::fs::File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

async fn blocking<T, F>(path: PathBuf, f: F) -> Result<T, CheckpointError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CheckpointError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io_err(&path, std::io::Error::other(e)))?
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, feed: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(feed);
        let p = path.clone();
        let record = blocking(path, move || read_record(&p)).await?;
        Ok(record.map(|r| r.state))
    }

    async fn set(&self, feed: &str, state: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(feed);
        let dir = self.dir.clone();
        let record = CheckpointRecord {
            feed: feed.to_string(),
            state: state.clone(),
            updated_at: Utc::now(),
        };
        let p = path.clone();
        blocking(path, move || write_atomic(&dir, &p, &record)).await
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let dir = self.dir.clone();
        blocking(dir.clone(), move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(io_err(&dir, e)),
            };
            let mut out = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                if let Some(rec) = read_record(&path)? {
                    out.push(rec);
                }
            }
            out.sort_by(|a, b| a.feed.cmp(&b.feed));
            Ok(out)
        })
        .await
    }

    async fn clear(&self, feed: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(feed);
        let p = path.clone();
        blocking(path, move || match std::fs::remove_file(&p) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&p, e)),
        })
        .await
    }
}

/// Volatile store for tests and `--dry-run` style runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    markers: Mutex<BTreeMap<String, CheckpointRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marker(feed: &str, marker: Marker) -> Self {
        Self::with_state(feed, marker.into())
    }

    pub fn with_state(feed: &str, state: Checkpoint) -> Self {
        let store = Self::new();
        store.insert(feed, state);
        store
    }

    fn insert(&self, feed: &str, state: Checkpoint) {
        let rec = CheckpointRecord {
            feed: feed.to_string(),
            state,
            updated_at: Utc::now(),
        };
        self.lock().insert(feed.to_string(), rec);
    }

    /// Make every subsequent `set` fail, simulating a crash before the
    /// checkpoint lands.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The stored marker alone.
    pub fn snapshot(&self, feed: &str) -> Option<Marker> {
        self.state(feed).and_then(|s| s.marker)
    }

    pub fn state(&self, feed: &str) -> Option<Checkpoint> {
        self.lock().get(feed).map(|r| r.state.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CheckpointRecord>> {
        self.markers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, feed: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.state(feed))
    }

    async fn set(&self, feed: &str, state: &Checkpoint) -> Result<(), CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Io {
                path: format!("memory:{feed}"),
                source: std::io::Error::other("simulated checkpoint failure"),
            });
        }
        self.insert(feed, state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn clear(&self, feed: &str) -> Result<bool, CheckpointError> {
        Ok(self.lock().remove(feed).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> Marker {
        Marker::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap())
    }

    fn marker_of(state: Option<Checkpoint>) -> Option<Marker> {
        state.and_then(|s| s.marker)
    }

    #[tokio::test]
    async fn file_store_roundtrip_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(tmp.path().join("cp"));

        assert_eq!(store.get("alerts").await.unwrap(), None);
        assert!(store.list().await.unwrap().is_empty());

        store.set("alerts", &ts(3).into()).await.unwrap();
        store
            .set("network", &Marker::Cursor("c-9".into()).into())
            .await
            .unwrap();
        assert_eq!(marker_of(store.get("alerts").await.unwrap()), Some(ts(3)));

        let all = store.list().await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.feed.as_str()).collect::<Vec<_>>(),
            vec!["alerts", "network"]
        );

        assert!(store.clear("alerts").await.unwrap());
        assert!(!store.clear("alerts").await.unwrap());
        assert_eq!(store.get("alerts").await.unwrap(), None);
    }

    #[tokio::test]
    async fn overwrite_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(tmp.path());
        store.set("assets", &ts(1).into()).await.unwrap();
        store.set("assets", &ts(2).into()).await.unwrap();

        assert_eq!(marker_of(store.get("assets").await.unwrap()), Some(ts(2)));
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["assets.json".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_not_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("alerts.json"), b"{\"feed\": \"al").unwrap();
        let store = FileCheckpointStore::new(tmp.path());

        let err = store.get("alerts").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn interrupted_write_keeps_previous_value() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(tmp.path());
        store.set("alerts", &ts(1).into()).await.unwrap();

        // A crash mid-write leaves only a partial temp file behind.
        std::fs::write(tmp.path().join("alerts.json.tmp"), b"{\"fee").unwrap();
        assert_eq!(marker_of(store.get("alerts").await.unwrap()), Some(ts(1)));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_failure_switch() {
        let store = MemoryCheckpointStore::with_marker("alerts", ts(1));
        store.fail_writes(true);
        assert!(store.set("alerts", &ts(2).into()).await.is_err());
        assert_eq!(store.snapshot("alerts"), Some(ts(1)));
        store.fail_writes(false);
        store.set("alerts", &ts(2).into()).await.unwrap();
        assert_eq!(marker_of(store.get("alerts").await.unwrap()), Some(ts(2)));
    }

    #[tokio::test]
    async fn full_state_roundtrips_and_old_files_still_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(tmp.path());
        let refreshed = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let state = Checkpoint {
            marker: None,
            delivered: vec!["0a1b".into(), "2c3d".into()],
            last_full_refresh: Some(refreshed),
        };
        store.set("network", &state).await.unwrap();
        assert_eq!(store.get("network").await.unwrap(), Some(state));

        std::fs::write(
            tmp.path().join("assets.json"),
            br#"{"feed":"assets","marker":{"kind":"timestamp","value":"2024-01-01T02:00:00Z"},"updated_at":"2024-01-01T02:00:05Z"}"#,
        )
        .unwrap();
        assert_eq!(store.get("assets").await.unwrap(), Some(ts(2).into()));
    }
}
