// src/ingest/feeds.rs
//! Built-in dataset catalog.
//!
//! Endpoints, record arrays and marker fields follow the vendor's v1 REST
//! layout. Every default here can be overridden per feed in the config file.

use std::time::Duration;

use crate::ingest::types::{FeedDefinition, FeedKind, MarkerMode, StartPolicy};

pub const DEFAULT_PAGE_SIZE: u32 = 500;
pub const DEFAULT_FILTER_PARAM: &str = "updated_after";

/// Defaults for one feed before config overrides are applied.
#[derive(Debug, Clone, Copy)]
pub struct FeedDefaults {
    pub endpoint_path: &'static str,
    pub items_key: &'static str,
    pub marker_fields: &'static [&'static str],
    pub poll_interval_secs: u64,
    pub start: StartPolicy,
}

pub fn defaults(kind: FeedKind) -> FeedDefaults {
    match kind {
        FeedKind::Alerts => FeedDefaults {
            endpoint_path: "/api/v1/alerts",
            items_key: "alerts",
            marker_fields: &["timestamp", "created_at", "createdAt"],
            poll_interval_secs: 300,
            start: StartPolicy::Lookback(Duration::from_secs(300)),
        },
        FeedKind::Assets => FeedDefaults {
            endpoint_path: "/api/v1/assets",
            items_key: "assets",
            marker_fields: &["updated_at", "updatedAt", "lastObservedTime"],
            poll_interval_secs: 3_600,
            start: StartPolicy::FullHistory,
        },
        FeedKind::ThreatIntel => FeedDefaults {
            endpoint_path: "/api/v1/threat-intelligence",
            items_key: "items",
            marker_fields: &["updated_at", "updatedAt"],
            poll_interval_secs: 3_600,
            start: StartPolicy::FullHistory,
        },
        FeedKind::Indicators => FeedDefaults {
            endpoint_path: "/api/v1/indicators",
            items_key: "indicators",
            marker_fields: &["updated_at", "updatedAt"],
            poll_interval_secs: 3_600,
            start: StartPolicy::FullHistory,
        },
        FeedKind::Network => FeedDefaults {
            endpoint_path: "/api/v1/network/activity",
            items_key: "activity",
            marker_fields: &["timestamp", "last_seen", "lastSeen"],
            poll_interval_secs: 300,
            start: StartPolicy::Lookback(Duration::from_secs(3_600)),
        },
        FeedKind::Vulnerabilities => FeedDefaults {
            endpoint_path: "/api/v1/vulnerabilities",
            items_key: "items",
            marker_fields: &["updated_at", "lastObservedTime"],
            poll_interval_secs: 86_400,
            start: StartPolicy::FullHistory,
        },
    }
}

/// Definition with catalog defaults, routed to `index`.
pub fn builtin(kind: FeedKind, index: impl Into<String>) -> FeedDefinition {
    let d = defaults(kind);
    FeedDefinition {
        kind,
        endpoint_path: d.endpoint_path.to_string(),
        index: index.into(),
        sourcetype: kind.sourcetype().to_string(),
        poll_interval: Duration::from_secs(d.poll_interval_secs),
        items_key: d.items_key.to_string(),
        marker: MarkerMode::Timestamp {
            fields: d.marker_fields.iter().map(|f| f.to_string()).collect(),
        },
        filter_param: DEFAULT_FILTER_PARAM.to_string(),
        page_size: DEFAULT_PAGE_SIZE,
        start: d.start,
        full_refresh: None,
    }
}
