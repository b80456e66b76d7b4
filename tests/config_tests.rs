use pipevisor::daemon::config::{
    ConfigBundle, ConfigError, OutputFormat, SinkTarget, StageKind, StageSettings, DEFAULT_BROKER_SERVER,
};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("pipevisor.yaml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_load_full_pipeline() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
app_name: metrics-pipe
queue_capacity: 100
logging:
  level: debug
  sinks:
    - type: console
      stream: stdout
    - type: file
      path: /var/log/pipevisor.log
      level: warn
broker:
  servers: ["broker-1:9092", "broker-2:9092"]
  offset_reset_to_largest: true
shutdown:
  grace_interval_ms: 250
stages:
  ingest:
    kind: protocol-consumer
    output: metrics
    queue_capacity: 5
  writer:
    kind: format-writer
    input: metrics
    output_dir: /tmp/out
    format: csv
"#,
    );

    let config = ConfigBundle::load(&path).unwrap();
    assert_eq!(config.origin(), path.as_path());
    assert_eq!(config.app_name(), "metrics-pipe");
    assert_eq!(config.queue_capacity(), 100);
    assert_eq!(config.logging().sinks.len(), 2);
    assert_eq!(config.logging().sinks[0].target, SinkTarget::Stdout);

    let broker = config.broker();
    assert_eq!(broker.servers.len(), 2);
    assert_eq!(broker.client_id, "metrics-pipe");
    assert_eq!(broker.group_id, "metrics-pipe");
    assert!(broker.offset_reset_to_largest);

    assert_eq!(config.shutdown().grace_interval, Duration::from_millis(250));
    assert_eq!(config.shutdown().poll_interval, Duration::from_millis(500));

    let ingest = config.stage("ingest").unwrap();
    assert_eq!(ingest.kind(), StageKind::ProtocolConsumer);
    assert_eq!(ingest.queue_capacity, 5);
    let writer = config.stage("writer").unwrap();
    assert_eq!(writer.queue_capacity, 100);
    match &writer.settings {
        StageSettings::FormatWriter(settings) => assert_eq!(settings.format, OutputFormat::Csv),
        other => panic!("unexpected settings {:?}", other),
    }
}

#[test]
fn test_minimal_config_gets_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
queue_capacity: 1
logging: {}
stages:
  tables:
    kind: table-dumper
    source: /tmp/t.csv
    output_dir: /tmp/tables
"#,
    );

    let config = ConfigBundle::load(&path).unwrap();
    assert_eq!(config.app_name(), "pipevisor");
    assert_eq!(config.broker().servers, vec![DEFAULT_BROKER_SERVER.to_string()]);
    assert_eq!(config.broker().client_id, "pipevisor");
    assert!(!config.broker().offset_reset_to_largest);
    assert_eq!(config.logging().sinks[0].target, SinkTarget::Stderr);
    assert!(config.stage("tables").unwrap().enabled);
}

#[test]
fn test_unreadable_file() {
    let dir = TempDir::new().unwrap();
    let err = ConfigBundle::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.yaml"));
}

#[test]
fn test_malformed_yaml_reports_location() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "queue_capacity: 1\nlogging:\n  level: [info\n");

    match ConfigBundle::load(&path).unwrap_err() {
        ConfigError::Parse { line, .. } => assert!(line.is_some()),
        other => panic!("expected parse error, got {:?}", other),
    }
}

#[test]
fn test_missing_logging_section() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
queue_capacity: 1
stages:
  tables:
    kind: table-dumper
    source: /tmp/t.csv
    output_dir: /tmp/tables
"#,
    );

    match ConfigBundle::load(&path).unwrap_err() {
        ConfigError::MissingSection { section, .. } => assert_eq!(section, "logging"),
        other => panic!("expected missing section, got {:?}", other),
    }
}

#[test]
fn test_all_stages_disabled() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
queue_capacity: 1
logging: {}
stages:
  tables:
    kind: table-dumper
    enabled: false
    source: /tmp/t.csv
    output_dir: /tmp/tables
"#,
    );

    let err = ConfigBundle::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
    assert!(err.to_string().contains("all pipeline stages are disabled"));
}

#[test]
fn test_consumer_without_enabled_producer() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
queue_capacity: 1
logging: {}
stages:
  ingest:
    kind: protocol-consumer
    enabled: false
    output: metrics
  writer:
    kind: format-writer
    input: metrics
    output_dir: /tmp/out
"#,
    );

    let err = ConfigBundle::load(&path).unwrap_err();
    assert!(err.to_string().contains("producer 'ingest' is disabled"), "{}", err);
}

#[test]
fn test_clones_share_one_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
queue_capacity: 3
logging: {}
stages:
  tables:
    kind: table-dumper
    source: /tmp/t.csv
    output_dir: /tmp/tables
"#,
    );

    let config = ConfigBundle::load(&path).unwrap();
    let copy = config.clone();
    assert_eq!(config.handle_count(), 2);
    assert_eq!(copy.queue_capacity(), 3);
    drop(copy);
    assert_eq!(config.handle_count(), 1);
}
