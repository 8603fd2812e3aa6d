// tests/ingest_config.rs
use std::{env, fs, path::Path, time::Duration};

use ics_telemetry_ingest::config::settings::ENV_API_KEY;
use ics_telemetry_ingest::config::{DestinationConfig, IngestConfig, ENV_HEC_TOKEN};
use ics_telemetry_ingest::ingest::types::{FeedKind, StartPolicy};
use ics_telemetry_ingest::IngestError;

#[serial_test::serial]
#[test]
fn shipped_example_config_loads_with_env_secrets() {
    env::set_var(ENV_API_KEY, "api-from-env");
    env::set_var(ENV_HEC_TOKEN, "hec-from-env");

    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/ingest.example.toml");
    let cfg = IngestConfig::load_from(&path).unwrap();

    env::remove_var(ENV_API_KEY);
    env::remove_var(ENV_HEC_TOKEN);

    assert_eq!(cfg.enabled_feeds().count(), 5);
    assert!(!cfg.feed(FeedKind::Vulnerabilities).unwrap().enabled);
    assert_eq!(
        cfg.feed(FeedKind::Indicators).unwrap().definition.full_refresh,
        Some(Duration::from_secs(7 * 86_400))
    );

    let alerts = cfg.feed(FeedKind::Alerts).unwrap();
    assert_eq!(alerts.connection.credential.expose(), "api-from-env");
    assert_eq!(alerts.definition.index, "ot_security");
    assert_eq!(cfg.feed(FeedKind::Assets).unwrap().definition.index, "ot_assets");

    let network = cfg.feed(FeedKind::Network).unwrap();
    assert_eq!(
        network.definition.start,
        StartPolicy::Lookback(Duration::from_secs(3_600))
    );

    match &cfg.destination {
        DestinationConfig::Hec { url, token, .. } => {
            assert_eq!(url.host_str(), Some("splunk.example.net"));
            assert_eq!(token.expose(), "hec-from-env");
        }
        other => panic!("expected hec destination, got {other:?}"),
    }
    assert_eq!(cfg.status_listen.map(|a| a.port()), Some(9187));
}

#[serial_test::serial]
#[test]
fn env_api_key_missing_is_a_configuration_error() {
    env::remove_var(ENV_API_KEY);
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("ingest.toml");
    fs::write(
        &p,
        r#"
[connection]
base_url = "https://ot.example.net"
api_key = "ENV"
index = "ot"

[feeds.alerts]
"#,
    )
    .unwrap();

    let err = IngestConfig::load_from(&p).unwrap_err();
    assert!(matches!(err, IngestError::Configuration(_)));
    assert!(err.to_string().contains(ENV_API_KEY), "{err}");
}

#[test]
fn per_feed_connection_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("ingest.toml");
    fs::write(
        &p,
        r#"
[connection]
base_url = "https://ot.example.net"
api_key = "shared"
index = "ot"
proxy = "http://proxy.local:3128"

[feeds.alerts]
api_key = "alerts-only"
verify_ssl = false

[feeds.assets]
"#,
    )
    .unwrap();

    let cfg = IngestConfig::load_from(&p).unwrap();
    let alerts = cfg.feed(FeedKind::Alerts).unwrap();
    let assets = cfg.feed(FeedKind::Assets).unwrap();
    assert_eq!(alerts.connection.credential.expose(), "alerts-only");
    assert!(!alerts.connection.tls_verify);
    assert_eq!(assets.connection.credential.expose(), "shared");
    assert!(assets.connection.tls_verify);
    assert!(assets.connection.proxy.is_some());
    assert_eq!(cfg.destination, DestinationConfig::Stdout);
}

#[test]
fn missing_file_and_all_disabled_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(IngestConfig::load_from(&dir.path().join("nope.toml")).is_err());

    let p = dir.path().join("ingest.toml");
    fs::write(
        &p,
        r#"
[connection]
base_url = "https://ot.example.net"
api_key = "k"
index = "ot"

[feeds.alerts]
disabled = true
"#,
    )
    .unwrap();
    let err = IngestConfig::load_from(&p).unwrap_err();
    assert!(err.to_string().contains("disabled"), "{err}");
}
