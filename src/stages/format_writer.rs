//! Format writer stage
//!
//! Drains its input queue into hourly files named
//! `<prefix>-<YYYYMMDD-HH>.<ext>`, where the hour is the item's receive time.

use crate::daemon::config::{FormatWriterSettings, OutputFormat, StageKind};
use crate::daemon::queue::{QueueConsumer, QueueError};
use crate::signal::ShutdownToken;
use crate::stages::{Stage, WorkItem};
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

const CSV_HEADER: &str = "sequence,topic,key,received_at,payload";

/// Wait used while draining the queue after a stop request
const DRAIN_WAIT: Duration = Duration::from_millis(10);

struct OpenFile {
    hour: String,
    path: PathBuf,
    writer: BufWriter<File>,
    dirty: bool,
}

pub struct FormatWriter {
    name: String,
    input: QueueConsumer<WorkItem>,
    output_dir: PathBuf,
    format: OutputFormat,
    prefix: String,
    poll_interval: Duration,
    current: Option<OpenFile>,
    written: u64,
}

impl FormatWriter {
    /// Creates the output directory
    pub fn new(name: &str, settings: &FormatWriterSettings, input: QueueConsumer<WorkItem>) -> Result<Self> {
        if settings.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }
        fs::create_dir_all(&settings.output_dir)
            .with_context(|| format!("cannot create output directory {}", settings.output_dir.display()))?;

        Ok(Self {
            name: name.to_string(),
            input,
            output_dir: settings.output_dir.clone(),
            format: settings.format,
            prefix: settings.file_prefix.clone().unwrap_or_else(|| name.to_string()),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            current: None,
            written: 0,
        })
    }

    fn file_name(&self, hour: &str) -> String {
        format!("{}-{}.{}", self.prefix, hour, self.format.extension())
    }

    fn write(&mut self, item: &WorkItem) -> Result<()> {
        let hour = item.received_at.format("%Y%m%d-%H").to_string();
        if self.current.as_ref().map(|f| f.hour != hour).unwrap_or(true) {
            self.rotate(hour)?;
        }
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };

        let written = match self.format {
            OutputFormat::Jsonl => {
                serde_json::to_writer(&mut file.writer, item).context("cannot encode item")?;
                file.writer.write_all(b"\n")
            }
            OutputFormat::Csv => writeln!(file.writer, "{}", csv_row(item)),
        };
        written.with_context(|| format!("cannot write to {}", file.path.display()))?;

        file.dirty = true;
        self.written += 1;
        Ok(())
    }

    fn rotate(&mut self, hour: String) -> Result<()> {
        self.flush()?;

        let path = self.output_dir.join(self.file_name(&hour));
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        let fresh = handle.metadata().map(|m| m.len() == 0).unwrap_or(false);

        let mut writer = BufWriter::new(handle);
        if fresh && self.format == OutputFormat::Csv {
            writeln!(writer, "{}", CSV_HEADER).with_context(|| format!("cannot write to {}", path.display()))?;
        }
        log::debug!("stage '{}' writing {}", self.name, path.display());

        self.current = Some(OpenFile {
            hour,
            path,
            writer,
            dirty: fresh,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.current.as_mut() {
            if file.dirty {
                file.writer
                    .flush()
                    .with_context(|| format!("cannot flush {}", file.path.display()))?;
                file.dirty = false;
            }
        }
        Ok(())
    }

    /// Write out whatever is already queued
    fn drain(&mut self) -> Result<()> {
        loop {
            match self.input.get_timeout(DRAIN_WAIT) {
                Ok(Some(item)) => self.write(&item)?,
                Ok(None) | Err(QueueError::Disconnected) => return Ok(()),
                Err(e) => return Err(e).context("failed to drain input queue"),
            }
        }
    }
}

impl Stage for FormatWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::FormatWriter
    }

    fn run(&mut self, stop: &ShutdownToken) -> Result<()> {
        log::info!(
            "stage '{}' writing {} files to {}",
            self.name,
            self.format.extension(),
            self.output_dir.display()
        );

        loop {
            if stop.is_cancelled() {
                self.drain()?;
                break;
            }
            match self.input.get_timeout(self.poll_interval) {
                Ok(Some(item)) => self.write(&item)?,
                Ok(None) => self.flush()?,
                Err(QueueError::Disconnected) => {
                    log::info!("stage '{}': input queue closed", self.name);
                    break;
                }
                Err(e) => return Err(e).context("failed to read input queue"),
            }
        }

        self.flush()?;
        log::info!("stage '{}' wrote {} items", self.name, self.written);
        Ok(())
    }

    fn retained_fds(&self) -> Vec<RawFd> {
        vec![self.input.as_raw_fd()]
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(item: &WorkItem) -> String {
    [
        item.sequence.to_string(),
        csv_field(&item.topic),
        csv_field(item.key.as_deref().unwrap_or("")),
        item.received_at.to_rfc3339(),
        csv_field(&item.payload),
    ]
    .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::queue::bounded;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;

    fn item(sequence: u64, hour: u32, payload: &str) -> WorkItem {
        WorkItem {
            sequence,
            topic: "metrics".to_string(),
            key: None,
            payload: payload.to_string(),
            received_at: Utc.with_ymd_and_hms(2026, 10, 18, hour, 5, 0).unwrap(),
        }
    }

    fn settings(dir: &Path, format: OutputFormat) -> FormatWriterSettings {
        FormatWriterSettings {
            input: "metrics".to_string(),
            output_dir: dir.join("out"),
            format,
            file_prefix: Some("m".to_string()),
            poll_interval_ms: 20,
        }
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_jsonl_hourly_files() {
        let dir = TempDir::new().unwrap();
        let (mut tx, rx) = bounded::<WorkItem>(4).unwrap();
        let mut stage = FormatWriter::new("writer", &settings(dir.path(), OutputFormat::Jsonl), rx).unwrap();

        let producer = thread::spawn(move || {
            tx.put(&item(0, 10, "a")).unwrap();
            tx.put(&item(1, 10, "b")).unwrap();
            tx.put(&item(2, 11, "c")).unwrap();
        });
        stage.run(&ShutdownToken::new()).unwrap();
        producer.join().unwrap();

        let ten = fs::read_to_string(dir.path().join("out/m-20261018-10.jsonl")).unwrap();
        let lines: Vec<WorkItem> = ten.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.iter().map(|i| i.payload.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        let eleven = fs::read_to_string(dir.path().join("out/m-20261018-11.jsonl")).unwrap();
        assert_eq!(eleven.lines().count(), 1);
    }

    #[test]
    fn test_csv_file_has_header() {
        let dir = TempDir::new().unwrap();
        let (mut tx, rx) = bounded::<WorkItem>(4).unwrap();
        let mut stage = FormatWriter::new("writer", &settings(dir.path(), OutputFormat::Csv), rx).unwrap();

        tx.put(&item(0, 9, "x,y")).unwrap();
        drop(tx);
        stage.run(&ShutdownToken::new()).unwrap();

        let content = fs::read_to_string(dir.path().join("out/m-20261018-09.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("0,metrics,,2026-10-18T09:05:00"));
        assert!(lines[1].ends_with(",\"x,y\""));
    }

    #[test]
    fn test_stop_drains_queued_items() {
        let dir = TempDir::new().unwrap();
        let (mut tx, rx) = bounded::<WorkItem>(4).unwrap();
        let mut stage = FormatWriter::new("writer", &settings(dir.path(), OutputFormat::Jsonl), rx).unwrap();

        for i in 0..3 {
            tx.put(&item(i, 12, "queued")).unwrap();
        }
        let stop = ShutdownToken::new();
        stop.cancel();
        stage.run(&stop).unwrap();

        let content = fs::read_to_string(dir.path().join("out/m-20261018-12.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 3);
        drop(tx);
    }
}
