// src/ingest/client.rs
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use serde_json::Value;

use crate::config::settings::ConnectionSettings;
use crate::error::IngestError;
use crate::ingest::types::{FeedDefinition, FeedSource, MarkerMode, Page, PageRequest, PageToken};

pub const USER_AGENT: &str = concat!("ics-telemetry-ingest/", env!("CARGO_PKG_VERSION"));
const VERSION_PATH: &str = "/api/v1/version";
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Bounded exponential backoff for transient upstream failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): backoff, 2x, 4x, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << shift).min(MAX_BACKOFF)
    }
}

/// HTTP client for one feed endpoint.
pub struct HttpFeedClient {
    def: FeedDefinition,
    settings: ConnectionSettings,
    retry: RetryPolicy,
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpFeedClient {
    pub fn new(
        def: FeedDefinition,
        settings: ConnectionSettings,
        retry: RetryPolicy,
    ) -> Result<Self, IngestError> {
        let http = build_http_client(&settings)?;
        let endpoint = join_path(&settings.base_url, &def.endpoint_path)?;
        Ok(Self {
            def,
            settings,
            retry,
            http,
            endpoint,
        })
    }

    pub fn definition(&self) -> &FeedDefinition {
        &self.def
    }

    /// Read-only reachability and credential check against the version
    /// endpoint. Not retried: this backs an interactive command.
    pub async fn check_connection(&self) -> Result<Value, IngestError> {
        let url = join_path(&self.settings.base_url, VERSION_PATH)?;
        let once = RetryPolicy {
            max_attempts: 1,
            ..self.retry
        };
        self.get_json(&url, &[], once).await
    }

    fn query_for(&self, req: &PageRequest) -> Vec<(String, String)> {
        let mut q = vec![("page_size".to_string(), req.page_size.to_string())];
        match &req.token {
            PageToken::Number(n) => q.push(("page".into(), n.to_string())),
            PageToken::Cursor(c) => q.push(("cursor".into(), c.clone())),
        }
        if let MarkerMode::Timestamp { .. } = self.def.marker {
            if let Some(since) = &req.since {
                q.push((self.def.filter_param.clone(), since.as_query_value()));
            }
        }
        if let Some(field) = self.def.sort_field() {
            q.push(("sort".into(), format!("{field}:asc")));
        }
        q
    }

    async fn get_json(
        &self,
        url: &Url,
        query: &[(String, String)],
        retry: RetryPolicy,
    ) -> Result<Value, IngestError> {
        let feed = self.def.id();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let reason = match self.http.get(url.clone()).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(IngestError::Authentication {
                            status: status.as_u16(),
                        });
                    }
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        format!("HTTP {status}")
                    } else if !status.is_success() {
                        return Err(IngestError::Protocol(format!(
                            "unexpected HTTP {status} from {}",
                            url.path()
                        )));
                    } else {
                        match resp.bytes().await {
                            Ok(body) => {
                                return serde_json::from_slice(&body).map_err(|e| {
                                    IngestError::Protocol(format!(
                                        "response from {} is not JSON: {e}",
                                        url.path()
                                    ))
                                });
                            }
                            Err(e) => format!("reading body: {}", e.without_url()),
                        }
                    }
                }
                Err(e) if e.is_builder() => {
                    return Err(IngestError::Configuration(format!(
                        "building request: {}",
                        e.without_url()
                    )));
                }
                Err(e) => describe_transport_error(e),
            };

            if attempt >= retry.max_attempts {
                return Err(IngestError::TransientFetch {
                    attempts: attempt,
                    reason,
                });
            }
            let delay = retry.delay_for(attempt);
            counter!("ingest_fetch_retries_total", "feed" => feed).increment(1);
            tracing::warn!(
                feed,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "transient upstream failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, IngestError> {
        let query = self.query_for(request);
        let body = self.get_json(&self.endpoint, &query, self.retry).await?;
        parse_page(&self.def, &request.token, body)
    }

    fn name(&self) -> &str {
        self.def.id()
    }
}

fn build_http_client(settings: &ConnectionSettings) -> Result<reqwest::Client, IngestError> {
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", settings.credential.expose()))
        .map_err(|_| {
            IngestError::Configuration("api_key contains characters not allowed in a header".into())
        })?;
    auth.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, auth);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(USER_AGENT)
        .timeout(settings.timeout)
        .danger_accept_invalid_certs(!settings.tls_verify);

    if let Some(p) = &settings.proxy {
        let mut proxy = reqwest::Proxy::all(p.url.as_str())
            .map_err(|e| IngestError::Configuration(format!("proxy: {e}")))?;
        if let (Some(user), Some(pass)) = (&p.username, &p.password) {
            proxy = proxy.basic_auth(user, pass.expose());
        }
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| IngestError::Configuration(format!("building http client: {e}")))
}

/// Append an API path to the base URL, keeping any path prefix on the base.
fn join_path(base: &Url, path: &str) -> Result<Url, IngestError> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|e| IngestError::Configuration(format!("endpoint '{joined}': {e}")))
}

fn describe_transport_error(e: reqwest::Error) -> String {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect"
    } else {
        "request"
    };
    format!("{kind}: {}", e.without_url())
}

const FALLBACK_ITEM_KEYS: [&str; 3] = ["items", "content", "data"];
const CURSOR_KEYS: [&str; 4] = ["next_cursor", "nextCursor", "next_page_token", "nextPageToken"];
const HAS_MORE_KEYS: [&str; 2] = ["has_more", "hasMore"];
const TOTAL_PAGES_KEYS: [&str; 2] = ["total_pages", "totalPages"];

/// Decode one response body into records plus the continuation token.
///
/// Continuation, in priority order: an explicit `has_more: false` stops; a
/// non-empty next cursor continues by cursor; `total_pages` continues by page
/// number while pages remain; otherwise a non-empty page asks for the next
/// page number.
pub(crate) fn parse_page(
    def: &FeedDefinition,
    current: &PageToken,
    body: Value,
) -> Result<Page, IngestError> {
    let (records, envelope) = match body {
        Value::Array(items) => (items, None),
        Value::Object(mut map) => {
            let key = if map.get(&def.items_key).is_some_and(Value::is_array) {
                Some(def.items_key.clone())
            } else {
                FALLBACK_ITEM_KEYS
                    .iter()
                    .find(|k| map.get(**k).is_some_and(Value::is_array))
                    .map(|k| k.to_string())
            };
            let items = match key.and_then(|k| map.remove(&k)) {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(IngestError::Protocol(format!(
                        "{}: response has no '{}' array",
                        def.id(),
                        def.items_key
                    )));
                }
            };
            (items, Some(map))
        }
        other => {
            return Err(IngestError::Protocol(format!(
                "{}: expected a JSON object or array, got {}",
                def.id(),
                json_type(&other)
            )));
        }
    };

    let Some(env) = envelope else {
        // Bare arrays carry no paging metadata.
        let next = match current {
            PageToken::Number(n) if !records.is_empty() => Some(PageToken::Number(n + 1)),
            _ => None,
        };
        return Ok(Page {
            records,
            next,
            cursor: None,
        });
    };

    let cursor = CURSOR_KEYS
        .iter()
        .find_map(|k| env.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    let has_more = HAS_MORE_KEYS.iter().find_map(|k| env.get(*k).and_then(Value::as_bool));
    let total_pages = TOTAL_PAGES_KEYS.iter().find_map(|k| env.get(*k).and_then(Value::as_u64));

    let next = if has_more == Some(false) {
        None
    } else if let Some(c) = &cursor {
        Some(PageToken::Cursor(c.clone()))
    } else if let PageToken::Number(n) = current {
        match total_pages {
            Some(total) if u64::from(*n) < total => Some(PageToken::Number(n + 1)),
            Some(_) => None,
            None if has_more == Some(true) || !records.is_empty() => Some(PageToken::Number(n + 1)),
            None => None,
        }
    } else {
        None
    };

    Ok(Page {
        records,
        next,
        cursor,
    })
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
