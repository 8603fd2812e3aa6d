// src/config/mod.rs
//! Config file loading.
//!
//! One TOML file: `[connection]` defaults, one `[feeds.<id>]` table per
//! dataset (which may override any connection field), plus the destination,
//! checkpoint, retry and status sections.

pub mod settings;

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::IgnoredAny;
use serde::Deserialize;

use crate::error::IngestError;
use crate::ingest::client::RetryPolicy;
use crate::ingest::feeds;
use crate::ingest::types::{FeedDefinition, FeedKind, MarkerMode, StartPolicy};
use settings::{resolve_secret, validate_interval, ConnectionInput, ConnectionSettings, Credential};

pub const DEFAULT_CONFIG_PATH: &str = "config/ingest.toml";
pub const DEFAULT_CHECKPOINT_DIR: &str = "state/checkpoints";
/// Env var consulted when the HEC token reads "ENV".
pub const ENV_HEC_TOKEN: &str = "ICS_HEC_TOKEN";
/// Upper bound for `full_refresh_days`.
pub const MAX_FULL_REFRESH_DAYS: u32 = 365;

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConnection {
    base_url: Option<String>,
    api_key: Option<String>,
    index: Option<String>,
    proxy: Option<String>,
    proxy_user: Option<String>,
    proxy_pass: Option<String>,
    verify_ssl: Option<bool>,
    timeout_seconds: Option<u64>,
}

impl RawConnection {
    /// Field-wise override: values set on `feed` win over `self`.
    fn merged_with(&self, feed: &RawConnection) -> RawConnection {
        RawConnection {
            base_url: feed.base_url.clone().or_else(|| self.base_url.clone()),
            api_key: feed.api_key.clone().or_else(|| self.api_key.clone()),
            index: feed.index.clone().or_else(|| self.index.clone()),
            proxy: feed.proxy.clone().or_else(|| self.proxy.clone()),
            proxy_user: feed.proxy_user.clone().or_else(|| self.proxy_user.clone()),
            proxy_pass: feed.proxy_pass.clone().or_else(|| self.proxy_pass.clone()),
            verify_ssl: feed.verify_ssl.or(self.verify_ssl),
            timeout_seconds: feed.timeout_seconds.or(self.timeout_seconds),
        }
    }
}

/// `[connection]`. Leftover keys are collected so typos can be reported.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConnectionTable {
    #[serde(flatten)]
    connection: RawConnection,
    #[serde(flatten)]
    unknown: BTreeMap<String, IgnoredAny>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawFeed {
    #[serde(flatten)]
    connection: RawConnection,
    interval: Option<i64>,
    #[serde(default)]
    disabled: bool,
    page_size: Option<u32>,
    start: Option<String>,
    /// `"cursor"`, or the record field(s) holding the marker timestamp.
    marker: Option<MarkerFields>,
    endpoint: Option<String>,
    items_key: Option<String>,
    filter_param: Option<String>,
    sourcetype: Option<String>,
    /// Days between full re-pulls; 0 or absent turns it off.
    full_refresh_days: Option<u32>,
    #[serde(flatten)]
    unknown: BTreeMap<String, IgnoredAny>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MarkerFields {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    connection: RawConnectionTable,
    #[serde(default)]
    destination: RawDestination,
    #[serde(default)]
    checkpoint: RawCheckpoint,
    #[serde(default)]
    retry: RawRetry,
    #[serde(default)]
    status: RawStatus,
    #[serde(default)]
    feeds: BTreeMap<String, RawFeed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawDestination {
    #[default]
    Stdout,
    File {
        path: PathBuf,
    },
    Hec {
        url: String,
        token: String,
        verify_ssl: Option<bool>,
        timeout_seconds: Option<u64>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCheckpoint {
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetry {
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStatus {
    listen: Option<String>,
}

/// Where events go.
#[derive(Debug, Clone, PartialEq)]
pub enum DestinationConfig {
    Stdout,
    File {
        path: PathBuf,
    },
    Hec {
        url: reqwest::Url,
        token: Credential,
        tls_verify: bool,
        timeout: Duration,
    },
}

/// Everything one feed needs, resolved and validated.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub definition: FeedDefinition,
    pub connection: ConnectionSettings,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub feeds: Vec<FeedConfig>,
    pub destination: DestinationConfig,
    pub checkpoint_dir: PathBuf,
    pub retry: RetryPolicy,
    pub status_listen: Option<SocketAddr>,
}

impl IngestConfig {
    pub fn load_from(path: &Path) -> Result<Self, IngestError> {
        let content = fs::read_to_string(path).map_err(|e| {
            IngestError::Configuration(format!("reading config from {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, IngestError> {
        let raw: RawConfig = toml::from_str(s)
            .map_err(|e| IngestError::Configuration(format!("parsing config: {e}")))?;
        Self::resolve(raw)
    }

    /// Feeds that should be polled.
    pub fn enabled_feeds(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|f| f.enabled)
    }

    pub fn feed(&self, kind: FeedKind) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.definition.kind == kind)
    }

    fn resolve(raw: RawConfig) -> Result<Self, IngestError> {
        if raw.feeds.is_empty() {
            return Err(IngestError::Configuration(
                "no feeds configured; add at least one [feeds.<id>] table".into(),
            ));
        }

        reject_unknown("[connection]", &raw.connection.unknown)?;
        let mut feeds = Vec::with_capacity(raw.feeds.len());
        for (id, raw_feed) in &raw.feeds {
            let kind: FeedKind = id.parse()?;
            if feeds.iter().any(|f: &FeedConfig| f.definition.kind == kind) {
                return Err(IngestError::Configuration(format!("feed '{id}' configured twice")));
            }
            reject_unknown(&format!("[feeds.{id}]"), &raw_feed.unknown)?;
            feeds.push(resolve_feed(kind, &raw.connection.connection, raw_feed)?);
        }

        if !feeds.iter().any(|f| f.enabled) {
            return Err(IngestError::Configuration("every feed is disabled".into()));
        }

        Ok(Self {
            feeds,
            destination: resolve_destination(raw.destination)?,
            checkpoint_dir: raw
                .checkpoint
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_DIR)),
            retry: resolve_retry(&raw.retry)?,
            status_listen: raw
                .status
                .listen
                .as_deref()
                .map(|l| {
                    l.parse().map_err(|_| {
                        IngestError::Configuration(format!("status.listen '{l}' is not host:port"))
                    })
                })
                .transpose()?,
        })
    }
}

fn resolve_feed(
    kind: FeedKind,
    defaults: &RawConnection,
    raw: &RawFeed,
) -> Result<FeedConfig, IngestError> {
    let id = kind.id();
    let conn = defaults.merged_with(&raw.connection);

    let credential = conn
        .api_key
        .as_deref()
        .map(|k| resolve_secret(k, settings::ENV_API_KEY))
        .transpose()
        .map_err(|e| prefixed(id, e))?;
    let proxy_pass = conn.proxy_pass.as_deref().map(Credential::new);

    let connection = ConnectionSettings::validate(ConnectionInput {
        base_url: conn.base_url.as_deref(),
        credential,
        target_index: conn.index.as_deref(),
        proxy: conn.proxy.as_deref(),
        proxy_user: conn.proxy_user.as_deref(),
        proxy_pass,
        tls_verify: conn.verify_ssl,
        timeout_seconds: conn.timeout_seconds,
    })
    .map_err(|e| prefixed(id, e))?;

    let mut def = feeds::builtin(kind, connection.target_index.clone());
    if let Some(secs) = raw.interval {
        def.poll_interval = validate_interval(id, secs)?;
    }
    if let Some(size) = raw.page_size {
        if size == 0 {
            return Err(IngestError::Configuration(format!(
                "feed '{id}': page_size must be positive"
            )));
        }
        def.page_size = size;
    }
    if let Some(start) = raw.start.as_deref() {
        def.start = start.parse::<StartPolicy>().map_err(|e| prefixed(id, e))?;
    }
    match &raw.marker {
        Some(MarkerFields::One(m)) if m.eq_ignore_ascii_case("cursor") => {
            def.marker = MarkerMode::Cursor;
        }
        Some(MarkerFields::One(field)) => {
            def.marker = MarkerMode::Timestamp {
                fields: vec![field.clone()],
            };
        }
        Some(MarkerFields::Many(fields)) if !fields.is_empty() => {
            def.marker = MarkerMode::Timestamp {
                fields: fields.clone(),
            };
        }
        Some(MarkerFields::Many(_)) => {
            return Err(IngestError::Configuration(format!(
                "feed '{id}': marker field list is empty"
            )));
        }
        None => {}
    }
    if let Some(endpoint) = &raw.endpoint {
        if !endpoint.starts_with('/') {
            return Err(IngestError::Configuration(format!(
                "feed '{id}': endpoint must start with '/'"
            )));
        }
        def.endpoint_path = endpoint.clone();
    }
    if let Some(k) = &raw.items_key {
        def.items_key = k.clone();
    }
    if let Some(p) = &raw.filter_param {
        def.filter_param = p.clone();
    }
    if let Some(st) = &raw.sourcetype {
        def.sourcetype = st.clone();
    }
    match raw.full_refresh_days {
        None | Some(0) => {}
        Some(days) if days > MAX_FULL_REFRESH_DAYS => {
            return Err(IngestError::Configuration(format!(
                "feed '{id}': full_refresh_days must be at most {MAX_FULL_REFRESH_DAYS}, got {days}"
            )));
        }
        Some(days) => def.full_refresh = Some(Duration::from_secs(u64::from(days) * 86_400)),
    }

    Ok(FeedConfig {
        definition: def,
        connection,
        enabled: !raw.disabled,
    })
}

fn resolve_destination(raw: RawDestination) -> Result<DestinationConfig, IngestError> {
    match raw {
        RawDestination::Stdout => Ok(DestinationConfig::Stdout),
        RawDestination::File { path } => Ok(DestinationConfig::File { path }),
        RawDestination::Hec {
            url,
            token,
            verify_ssl,
            timeout_seconds,
        } => {
            let url = reqwest::Url::parse(&url).map_err(|e| {
                IngestError::Configuration(format!("destination.url '{url}': {e}"))
            })?;
            let token = resolve_secret(&token, ENV_HEC_TOKEN)?;
            if token.is_empty() {
                return Err(IngestError::Configuration("destination.token is empty".into()));
            }
            let timeout = timeout_seconds.unwrap_or(settings::DEFAULT_TIMEOUT_SECS);
            if timeout == 0 {
                return Err(IngestError::Configuration(
                    "destination.timeout_seconds must be positive".into(),
                ));
            }
            Ok(DestinationConfig::Hec {
                url,
                token,
                tls_verify: verify_ssl.unwrap_or(true),
                timeout: Duration::from_secs(timeout),
            })
        }
    }
}

fn resolve_retry(raw: &RawRetry) -> Result<RetryPolicy, IngestError> {
    let mut policy = RetryPolicy::default();
    if let Some(n) = raw.max_attempts {
        if n == 0 {
            return Err(IngestError::Configuration("retry.max_attempts must be >= 1".into()));
        }
        policy.max_attempts = n;
    }
    if let Some(ms) = raw.backoff_ms {
        policy.backoff = Duration::from_millis(ms);
    }
    Ok(policy)
}

fn reject_unknown(table: &str, unknown: &BTreeMap<String, IgnoredAny>) -> Result<(), IngestError> {
    if unknown.is_empty() {
        return Ok(());
    }
    let keys: Vec<&str> = unknown.keys().map(String::as_str).collect();
    Err(IngestError::Configuration(format!(
        "{table}: unknown key(s) {}",
        keys.join(", ")
    )))
}

fn prefixed(feed: &str, e: IngestError) -> IngestError {
    match e {
        IngestError::Configuration(msg) => IngestError::Configuration(format!("feed '{feed}': {msg}")),
        other => other,
    }
}
