// src/ingest/types.rs
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IngestError;

/// Vendor records are opaque JSON documents; we never reshape them.
pub type RawRecord = serde_json::Value;

/// The datasets the connector knows how to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedKind {
    Alerts,
    Assets,
    ThreatIntel,
    Indicators,
    Network,
    Vulnerabilities,
}

impl FeedKind {
    pub const ALL: [FeedKind; 6] = [
        FeedKind::Alerts,
        FeedKind::Assets,
        FeedKind::ThreatIntel,
        FeedKind::Indicators,
        FeedKind::Network,
        FeedKind::Vulnerabilities,
    ];

    /// Stable id used in config tables, checkpoint files and the dataset tag.
    pub fn id(self) -> &'static str {
        match self {
            FeedKind::Alerts => "alerts",
            FeedKind::Assets => "assets",
            FeedKind::ThreatIntel => "threat-intel",
            FeedKind::Indicators => "indicators",
            FeedKind::Network => "network",
            FeedKind::Vulnerabilities => "vulnerabilities",
        }
    }

    pub fn sourcetype(self) -> &'static str {
        match self {
            FeedKind::Alerts => "ics:alerts",
            FeedKind::Assets => "ics:assets",
            FeedKind::ThreatIntel => "ics:threat-intel",
            FeedKind::Indicators => "ics:indicators",
            FeedKind::Network => "ics:network",
            FeedKind::Vulnerabilities => "ics:vulnerabilities",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for FeedKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        FeedKind::ALL
            .into_iter()
            .find(|k| k.id() == wanted || (wanted == "threat_intel" && *k == FeedKind::ThreatIntel))
            .ok_or_else(|| IngestError::Configuration(format!("unknown feed '{s}'")))
    }
}

/// Ingestion progress for one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Marker {
    Timestamp(DateTime<Utc>),
    Cursor(String),
}

impl Marker {
    /// Value sent upstream as the filter parameter.
    pub fn as_query_value(&self) -> String {
        match self {
            Marker::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Marker::Cursor(c) => c.clone(),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Marker::Timestamp(ts) => Some(*ts),
            Marker::Cursor(_) => None,
        }
    }

    /// Pick the marker to persist after a cycle.
    ///
    /// Timestamps only move forward. Cursors are opaque, so the newest one
    /// reported by the API wins.
    pub fn advance(previous: Option<&Marker>, next: Marker) -> Marker {
        match (previous, next) {
            (Some(Marker::Timestamp(prev)), Marker::Timestamp(next)) => {
                Marker::Timestamp((*prev).max(next))
            }
            (_, next) => next,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_query_value())
    }
}

/// How a feed tracks progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerMode {
    /// Highest value of the first present field, in order.
    Timestamp { fields: Vec<String> },
    /// Opaque cursor handed back by the API.
    Cursor,
}

/// Where a feed starts when no checkpoint exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    FullHistory,
    Lookback(Duration),
    At(DateTime<Utc>),
}

impl StartPolicy {
    /// Initial marker. Cursor feeds start with no cursor at all.
    pub fn initial_marker(&self, mode: &MarkerMode, now: DateTime<Utc>) -> Option<Marker> {
        if *mode == MarkerMode::Cursor {
            return None;
        }
        let ts = match self {
            StartPolicy::FullHistory => Utc.timestamp_opt(0, 0).single()?,
            StartPolicy::Lookback(window) => {
                let window = chrono::Duration::from_std(*window).ok()?;
                now.checked_sub_signed(window)?
            }
            StartPolicy::At(ts) => *ts,
        };
        Some(Marker::Timestamp(ts))
    }
}

impl FromStr for StartPolicy {
    type Err = IngestError;

    /// Accepts `full`, `lookback:<seconds>` or an RFC 3339 timestamp.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("full") {
            return Ok(StartPolicy::FullHistory);
        }
        if let Some(secs) = s.strip_prefix("lookback:") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                IngestError::Configuration(format!("start '{s}': lookback must be whole seconds"))
            })?;
            return Ok(StartPolicy::Lookback(Duration::from_secs(secs)));
        }
        let ts = DateTime::parse_from_rfc3339(s).map_err(|_| {
            IngestError::Configuration(format!(
                "start '{s}': expected 'full', 'lookback:<seconds>' or an RFC 3339 timestamp"
            ))
        })?;
        let ts = ts.with_timezone(&Utc);
        if ts.timestamp() < 0 {
            return Err(IngestError::Configuration(format!(
                "start '{s}' is before 1970-01-01T00:00:00Z"
            )));
        }
        Ok(StartPolicy::At(ts))
    }
}

/// Static description of one dataset. Immutable once the service starts.
#[derive(Debug, Clone)]
pub struct FeedDefinition {
    pub kind: FeedKind,
    pub endpoint_path: String,
    /// Destination index events are routed to.
    pub index: String,
    pub sourcetype: String,
    pub poll_interval: Duration,
    /// Array holding records in a response body.
    pub items_key: String,
    pub marker: MarkerMode,
    /// Query parameter carrying the timestamp filter.
    pub filter_param: String,
    pub page_size: u32,
    pub start: StartPolicy,
    /// Rewind to the beginning of history this often, so the destination
    /// holds a complete fresh copy of slowly changing datasets.
    pub full_refresh: Option<Duration>,
}

impl FeedDefinition {
    pub fn id(&self) -> &'static str {
        self.kind.id()
    }

    /// Marker timestamp of a record, if the feed is timestamp based and the
    /// record carries one.
    pub fn record_timestamp(&self, record: &RawRecord) -> Option<DateTime<Utc>> {
        let MarkerMode::Timestamp { fields } = &self.marker else {
            return None;
        };
        fields
            .iter()
            .find_map(|f| record.get(f).and_then(parse_record_time))
    }

    /// Field used for the ascending sort hint.
    pub fn sort_field(&self) -> Option<&str> {
        match &self.marker {
            MarkerMode::Timestamp { fields } => fields.first().map(String::as_str),
            MarkerMode::Cursor => None,
        }
    }
}

/// RFC 3339 strings, or epoch seconds / milliseconds as numbers.
pub fn parse_record_time(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    match v {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            // Float casts saturate, so absurd values land on i64::MIN / MAX.
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            // Anything past year 5138 in seconds is really milliseconds.
            if raw.unsigned_abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

/// Stable content hash of a record, used to recognise records that were
/// already delivered when an upstream gives no better resume position.
pub fn record_fingerprint(record: &RawRecord) -> String {
    let digest = Sha256::digest(record.to_string().as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Position within a paginated result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageToken {
    Number(u32),
    Cursor(String),
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub since: Option<Marker>,
    pub token: PageToken,
    pub page_size: u32,
}

/// One decoded response page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Where to continue; `None` once the API reports no further pages.
    pub next: Option<PageToken>,
    /// Cursor reported by the API, used as the resume marker in cursor mode.
    pub cursor: Option<String>,
}

/// One upstream endpoint. Implemented over HTTP in production and by
/// scripted fakes in tests.
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, IngestError>;
    fn name(&self) -> &str;
}

/// A record wrapped with its routing tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEvent {
    /// Event time in epoch seconds: the record's own timestamp when it has
    /// one, else the ingestion time.
    pub time: f64,
    pub index: String,
    pub sourcetype: String,
    pub source: String,
    pub dataset: String,
    pub ingested_at: DateTime<Utc>,
    /// The vendor record, untouched.
    pub event: RawRecord,
}

impl IndexedEvent {
    pub fn new(def: &FeedDefinition, record: RawRecord, ingested_at: DateTime<Utc>) -> Self {
        let at = def.record_timestamp(&record).unwrap_or(ingested_at);
        Self {
            time: at.timestamp_millis() as f64 / 1_000.0,
            index: def.index.clone(),
            sourcetype: def.sourcetype.clone(),
            source: format!("ics-ingest:{}", def.id()),
            dataset: def.id().to_string(),
            ingested_at,
            event: record,
        }
    }
}

/// Append-only destination shared by every feed.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Returns only once the whole batch is durably accepted.
    async fn write_batch(&self, events: &[IndexedEvent]) -> Result<(), IngestError>;
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn feed_kind_parses_ids() {
        assert_eq!("alerts".parse::<FeedKind>().unwrap(), FeedKind::Alerts);
        assert_eq!("Threat-Intel".parse::<FeedKind>().unwrap(), FeedKind::ThreatIntel);
        assert_eq!("threat_intel".parse::<FeedKind>().unwrap(), FeedKind::ThreatIntel);
        assert_eq!("indicators".parse::<FeedKind>().unwrap(), FeedKind::Indicators);
        assert!("syslog".parse::<FeedKind>().is_err());
    }

    #[test]
    fn timestamp_marker_never_moves_back() {
        let prev = Marker::Timestamp(ts("2024-01-01T03:00:00Z"));
        let older = Marker::Timestamp(ts("2024-01-01T01:00:00Z"));
        assert_eq!(Marker::advance(Some(&prev), older), prev);

        let newer = Marker::Timestamp(ts("2024-01-02T00:00:00Z"));
        assert_eq!(Marker::advance(Some(&prev), newer.clone()), newer);
        assert_eq!(Marker::advance(None, newer.clone()), newer);
    }

    #[test]
    fn cursor_marker_takes_latest() {
        let prev = Marker::Cursor("b".into());
        assert_eq!(
            Marker::advance(Some(&prev), Marker::Cursor("a".into())),
            Marker::Cursor("a".into())
        );
    }

    #[test]
    fn marker_serializes_tagged() {
        let m = Marker::Timestamp(ts("2024-01-01T00:00:00Z"));
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v, json!({"kind": "timestamp", "value": "2024-01-01T00:00:00Z"}));
        assert_eq!(m.as_query_value(), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn start_policy_parsing() {
        assert_eq!("full".parse::<StartPolicy>().unwrap(), StartPolicy::FullHistory);
        assert_eq!(
            "lookback:300".parse::<StartPolicy>().unwrap(),
            StartPolicy::Lookback(Duration::from_secs(300))
        );
        assert_eq!(
            "2024-05-01T00:00:00Z".parse::<StartPolicy>().unwrap(),
            StartPolicy::At(ts("2024-05-01T00:00:00Z"))
        );
        assert!("lookback:soon".parse::<StartPolicy>().is_err());
        assert!("yesterday".parse::<StartPolicy>().is_err());
        assert!("1969-12-31T00:00:00Z".parse::<StartPolicy>().is_err());
    }

    #[test]
    fn initial_marker_per_policy() {
        let now = ts("2024-06-01T12:00:00Z");
        let mode = MarkerMode::Timestamp { fields: vec!["updated_at".into()] };

        assert_eq!(
            StartPolicy::FullHistory.initial_marker(&mode, now),
            Some(Marker::Timestamp(ts("1970-01-01T00:00:00Z")))
        );
        assert_eq!(
            StartPolicy::Lookback(Duration::from_secs(300)).initial_marker(&mode, now),
            Some(Marker::Timestamp(ts("2024-06-01T11:55:00Z")))
        );
        assert_eq!(StartPolicy::FullHistory.initial_marker(&MarkerMode::Cursor, now), None);
    }

    #[test]
    fn record_time_accepts_strings_and_epochs() {
        assert_eq!(
            parse_record_time(&json!("2024-01-01T01:00:00+01:00")),
            Some(ts("2024-01-01T00:00:00Z"))
        );
        assert_eq!(parse_record_time(&json!(1_704_067_200)), Some(ts("2024-01-01T00:00:00Z")));
        assert_eq!(
            parse_record_time(&json!(1_704_067_200_000i64)),
            Some(ts("2024-01-01T00:00:00Z"))
        );
        assert_eq!(parse_record_time(&json!("not a time")), None);
        assert_eq!(parse_record_time(&json!(null)), None);
    }

    #[test]
    fn extreme_epoch_values_are_rejected_not_panicking() {
        assert_eq!(parse_record_time(&json!(i64::MIN)), None);
        assert_eq!(parse_record_time(&json!(i64::MAX)), None);
        assert_eq!(parse_record_time(&json!(-1e30)), None);
        assert_eq!(parse_record_time(&json!(1e300)), None);
        assert_eq!(
            parse_record_time(&json!(-1_000)),
            Some(ts("1969-12-31T23:43:20Z"))
        );
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = record_fingerprint(&json!({"id": 1, "name": "plc"}));
        let b = record_fingerprint(&json!({"name": "plc", "id": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, record_fingerprint(&json!({"id": 2, "name": "plc"})));
    }
}
