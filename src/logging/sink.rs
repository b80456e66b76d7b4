//! Log sinks
//!
//! Only the aggregator thread writes to sinks, so a sink needs no locking of
//! its own.

use crate::daemon::config::{LoggingSection, SinkTarget};
use crate::logging::LogRecord;
use log::LevelFilter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for aggregated log records
pub trait Sink: Send {
    /// Most verbose level this sink accepts
    fn level(&self) -> LevelFilter;

    fn emit(&mut self, record: &LogRecord) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Short human-readable name used in diagnostics
    fn describe(&self) -> String;
}

/// Render a record as one output line (without the newline)
///
/// `2026-10-18T12:00:00.123Z INFO  [writer:4242] message`
pub fn format_record(record: &LogRecord) -> String {
    format!(
        "{} {:<5} [{}:{}] {}",
        record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        record.severity.as_str(),
        record.source,
        record.pid,
        record.message
    )
}

/// Which standard stream a console sink writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stderr,
    Stdout,
}

/// Writes records to stderr or stdout
pub struct ConsoleSink {
    stream: ConsoleStream,
    level: LevelFilter,
}

impl ConsoleSink {
    pub fn new(stream: ConsoleStream, level: LevelFilter) -> Self {
        Self { stream, level }
    }
}

impl Sink for ConsoleSink {
    fn level(&self) -> LevelFilter {
        self.level
    }

    fn emit(&mut self, record: &LogRecord) -> io::Result<()> {
        let line = format_record(record);
        match self.stream {
            ConsoleStream::Stderr => writeln!(io::stderr().lock(), "{}", line),
            ConsoleStream::Stdout => writeln!(io::stdout().lock(), "{}", line),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stream {
            ConsoleStream::Stderr => io::stderr().flush(),
            ConsoleStream::Stdout => io::stdout().flush(),
        }
    }

    fn describe(&self) -> String {
        match self.stream {
            ConsoleStream::Stderr => "console (stderr)".to_string(),
            ConsoleStream::Stdout => "console (stdout)".to_string(),
        }
    }
}

/// Appends records to a file
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    level: LevelFilter,
}

impl FileSink {
    /// Open (creating parent directories and the file as needed) for append
    pub fn open(path: &Path, level: LevelFilter) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            level,
        })
    }
}

impl Sink for FileSink {
    fn level(&self) -> LevelFilter {
        self.level
    }

    fn emit(&mut self, record: &LogRecord) -> io::Result<()> {
        writeln!(self.writer, "{}", format_record(record))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Build the sinks named in the `logging` section
pub fn build_sinks(section: &LoggingSection) -> io::Result<Vec<Box<dyn Sink>>> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(section.sinks.len());

    for config in &section.sinks {
        let sink: Box<dyn Sink> = match &config.target {
            SinkTarget::Stderr => Box::new(ConsoleSink::new(ConsoleStream::Stderr, config.level)),
            SinkTarget::Stdout => Box::new(ConsoleSink::new(ConsoleStream::Stdout, config.level)),
            SinkTarget::File(path) => Box::new(FileSink::open(path, config.level).map_err(|e| {
                io::Error::new(e.kind(), format!("cannot open log file {}: {}", path.display(), e))
            })?),
        };
        sinks.push(sink);
    }

    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::config::SinkConfig;
    use crate::logging::Severity;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            pid: 4242,
            source: "writer".to_string(),
            severity: Severity::Info,
            target: "pipevisor::stages".to_string(),
            message: message.to_string(),
            timestamp: chrono::Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_format_record() {
        assert_eq!(
            format_record(&record("hello")),
            "2026-10-18T12:00:00.000Z INFO  [writer:4242] hello"
        );
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("out.log");

        let mut sink = FileSink::open(&path, LevelFilter::Info).unwrap();
        sink.emit(&record("one")).unwrap();
        sink.flush().unwrap();
        drop(sink);

        let mut sink = FileSink::open(&path, LevelFilter::Info).unwrap();
        sink.emit(&record("two")).unwrap();
        sink.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("one"));
        assert!(lines[1].ends_with("two"));
    }

    #[test]
    fn test_build_sinks_from_section() {
        let dir = TempDir::new().unwrap();
        let section = LoggingSection {
            level: LevelFilter::Debug,
            sinks: vec![
                SinkConfig {
                    target: SinkTarget::Stdout,
                    level: LevelFilter::Trace,
                },
                SinkConfig {
                    target: SinkTarget::File(dir.path().join("p.log")),
                    level: LevelFilter::Warn,
                },
            ],
        };

        let sinks = build_sinks(&section).unwrap();
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0].describe(), "console (stdout)");
        assert_eq!(sinks[1].level(), LevelFilter::Warn);
    }
}
