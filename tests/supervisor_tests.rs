use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serial_test::serial;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const GRACE_MS: u64 = 300;

fn pipeline_config(dir: &Path) -> PathBuf {
    let config = format!(
        r#"
queue_capacity: 2
logging:
  level: info
  sinks:
    - type: file
      path: {dir}/pipevisor.log
shutdown:
  grace_interval_ms: {grace}
  poll_interval_ms: 50
stages:
  ingest:
    kind: protocol-consumer
    output: metrics
    source: {dir}/metrics.stream
    poll_interval_ms: 20
  writer:
    kind: format-writer
    input: metrics
    output_dir: {dir}/out
    file_prefix: metrics
    poll_interval_ms: 20
  tables:
    kind: table-dumper
    enabled: false
    source: {dir}/table.csv
    output_dir: {dir}/tables
"#,
        dir = dir.display(),
        grace = GRACE_MS
    );
    let path = dir.join("pipevisor.yaml");
    fs::write(&path, config).unwrap();
    path
}

fn spawn(config: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_pipevisor"))
        .arg("--config")
        .arg(config)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn pipevisor")
}

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

fn wait_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("pipevisor did not exit");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn written_payloads(out: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(out) else {
        return Vec::new();
    };
    // Hourly file names sort chronologically
    let mut files: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    files.sort();

    let mut payloads = Vec::new();
    for file in files {
        let content = fs::read_to_string(&file).unwrap_or_default();
        for line in content.lines() {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                if let Some(payload) = value["payload"].as_str() {
                    payloads.push(payload.to_string());
                }
            }
        }
    }
    payloads
}

fn timestamp(line: &str) -> DateTime<Utc> {
    let stamp = line.split_whitespace().next().unwrap();
    DateTime::parse_from_rfc3339(stamp).unwrap().with_timezone(&Utc)
}

fn line_index(lines: &[&str], needle: &str) -> usize {
    lines
        .iter()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no log line containing {:?}", needle))
}

#[test]
#[serial]
fn test_pipeline_runs_and_drains_in_order() {
    let dir = TempDir::new().unwrap();
    let stream = dir.path().join("metrics.stream");
    fs::write(&stream, "").unwrap();
    let config = pipeline_config(dir.path());

    let mut child = spawn(&config);
    let log_path = dir.path().join("pipevisor.log");
    assert!(wait_for(Duration::from_secs(10), || {
        fs::read_to_string(&log_path).map(|l| l.contains("started with 2 stages")).unwrap_or(false)
    }));

    let mut file = fs::OpenOptions::new().append(true).open(&stream).unwrap();
    for i in 0..10 {
        writeln!(file, "host-{}\tcpu={}", i % 3, i).unwrap();
    }
    drop(file);

    let out = dir.path().join("out");
    assert!(wait_for(Duration::from_secs(10), || written_payloads(&out).len() == 10));
    let expected: Vec<String> = (0..10).map(|i| format!("cpu={}", i)).collect();
    assert_eq!(written_payloads(&out), expected);

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = wait_exit(&mut child, Duration::from_secs(15));
    assert_eq!(status.code(), Some(0));

    let log = fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = log.lines().collect();

    let received = line_index(&lines, "received SIGTERM");
    let stop_writer = line_index(&lines, "stopping stage 'writer'");
    let writer_stopped = line_index(&lines, "stage 'writer' stopped");
    let stop_ingest = line_index(&lines, "stopping stage 'ingest'");
    let ingest_stopped = line_index(&lines, "stage 'ingest' stopped");
    let supervisor_stopped = line_index(&lines, "supervisor stopped");
    let aggregator_stopped = line_index(&lines, "log aggregator stopped");

    // Consumer before producer, aggregator last
    assert!(received < stop_writer);
    assert!(writer_stopped < stop_ingest);
    assert!(stop_ingest < ingest_stopped);
    assert!(ingest_stopped < supervisor_stopped);
    assert!(supervisor_stopped < aggregator_stopped);
    assert_eq!(aggregator_stopped, lines.len() - 1);

    let gap = timestamp(lines[stop_ingest]) - timestamp(lines[stop_writer]);
    assert!(gap >= chrono::Duration::milliseconds(GRACE_MS as i64), "gap {:?}", gap);

    assert!(!dir.path().join("tables").exists());
}

#[test]
#[serial]
fn test_sigint_is_treated_like_sigterm() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("metrics.stream"), "").unwrap();
    let config = pipeline_config(dir.path());

    let mut child = spawn(&config);
    let log_path = dir.path().join("pipevisor.log");
    assert!(wait_for(Duration::from_secs(10), || {
        fs::read_to_string(&log_path).map(|l| l.contains("started with 2 stages")).unwrap_or(false)
    }));

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    let status = wait_exit(&mut child, Duration::from_secs(15));
    assert_eq!(status.code(), Some(0));

    let log = fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("received SIGINT"));
    assert!(log.contains("stage 'ingest' stopped"));
}
