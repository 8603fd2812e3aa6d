// tests/common/mod.rs
//
// In-process fake of the vendor REST API, served by axum on 127.0.0.1:0.
// Each dataset route owns a `FakeApi` holding its records and failure knobs.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use ics_telemetry_ingest::config::settings::{ConnectionInput, ConnectionSettings, Credential};
use ics_telemetry_ingest::ingest::checkpoint::MemoryCheckpointStore;
use ics_telemetry_ingest::ingest::types::{parse_record_time, Marker};

pub const API_KEY: &str = "test-key";

#[derive(Default)]
pub struct FakeApi {
    pub records: Mutex<Vec<Value>>,
    /// Answer every request with this status.
    pub fail_status: Mutex<Option<u16>>,
    /// Answer 200 with this body verbatim.
    pub raw_body: Mutex<Option<String>>,
    /// Number of upcoming requests that stall past the client timeout.
    pub stall_next: AtomicU32,
    pub requests: Mutex<Vec<HashMap<String, String>>>,
    pub auth_headers: Mutex<Vec<String>>,
    /// When set, the "alerts" checkpoint is sampled on every request.
    pub watch_store: Mutex<Option<Arc<MemoryCheckpointStore>>>,
    pub sampled: Mutex<Vec<Option<Marker>>>,
}

impl FakeApi {
    pub fn with_records(records: Vec<Value>) -> Arc<Self> {
        let api = Arc::new(Self::default());
        *api.records.lock().unwrap() = records;
        api
    }

    pub fn push(&self, record: Value) {
        self.records.lock().unwrap().push(record);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Records newer than `updated_after`, paged by `page` / `page_size`.
async fn list(
    State(api): State<Arc<FakeApi>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    api.requests.lock().unwrap().push(q.clone());
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        api.auth_headers.lock().unwrap().push(auth.to_string());
    }
    let sampled = api
        .watch_store
        .lock()
        .unwrap()
        .as_ref()
        .map(|s| s.snapshot("alerts"));
    if let Some(marker) = sampled {
        api.sampled.lock().unwrap().push(marker);
    }

    if let Some(code) = *api.fail_status.lock().unwrap() {
        let status = StatusCode::from_u16(code).unwrap();
        return (status, "denied").into_response();
    }
    if let Some(body) = api.raw_body.lock().unwrap().clone() {
        return (StatusCode::OK, body).into_response();
    }

    let stall = api
        .stall_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if stall {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    let after: Option<DateTime<Utc>> = q
        .get("updated_after")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    let page: usize = q.get("page").and_then(|s| s.parse().ok()).unwrap_or(1);
    let size: usize = q.get("page_size").and_then(|s| s.parse().ok()).unwrap_or(500);

    let matching: Vec<Value> = api
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| match (after, r.get("timestamp").and_then(parse_record_time)) {
            (Some(after), Some(at)) => at > after,
            _ => true,
        })
        .cloned()
        .collect();

    let total_pages = matching.len().div_ceil(size).max(1);
    let items: Vec<Value> = matching
        .into_iter()
        .skip((page - 1) * size)
        .take(size)
        .collect();

    Json(json!({ "items": items, "page": page, "total_pages": total_pages })).into_response()
}

/// Serve the given dataset routes plus `/api/v1/version`. Returns the base URL.
pub async fn spawn_upstream(routes: Vec<(&str, Arc<FakeApi>)>) -> String {
    let mut app = Router::new().route(
        "/api/v1/version",
        get(|| async { Json(json!({ "version": "2.4.1" })) }),
    );
    for (path, api) in routes {
        app = app.route(path, get(list).with_state(api));
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn connection(base_url: &str) -> ConnectionSettings {
    ConnectionSettings::validate(ConnectionInput {
        base_url: Some(base_url),
        credential: Some(Credential::new(API_KEY)),
        target_index: Some("ot_security"),
        ..Default::default()
    })
    .unwrap()
}

pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
}

pub fn alert(id: u32, time: DateTime<Utc>) -> Value {
    json!({ "id": id, "type": "alert", "severity": 3, "timestamp": time.to_rfc3339() })
}
