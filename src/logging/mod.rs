//! Cross-process logging
//!
//! Every process (the supervisor and each stage) logs through the `log`
//! macros. The process-wide [`ChannelLogger`] turns each record into a
//! [`LogRecord`] and pushes it down the log channel, a Unix datagram socket
//! pair whose receiving end is drained by the [`LogAggregator`] thread in the
//! supervisor. One record is one datagram, so records from concurrent
//! processes never interleave mid-line.
//!
//! Delivery is best-effort: a send that fails or times out drops the record
//! and the emitting process carries on.

pub mod aggregator;
pub mod sink;

pub use aggregator::{AggregatorStats, LogAggregator};
pub use sink::{build_sinks, format_record, ConsoleSink, FileSink, Sink};

use chrono::{DateTime, Utc};
use log::{LevelFilter, Log, Metadata, Record};
use serde::{Deserialize, Serialize};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::RwLock;
use std::time::Duration;

/// Messages longer than this are truncated before sending
pub const MAX_MESSAGE_LEN: usize = 16 * 1024;

/// Receive buffer size, comfortably above one encoded record
const MAX_DATAGRAM: usize = 64 * 1024;

/// How long a sender waits on a full channel before dropping the record
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Source label of records emitted by the supervisor itself
pub const SUPERVISOR_SOURCE: &str = "supervisor";

/// Record severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Severity {
    pub fn level(self) -> log::Level {
        match self {
            Severity::Error => log::Level::Error,
            Severity::Warn => log::Level::Warn,
            Severity::Info => log::Level::Info,
            Severity::Debug => log::Level::Debug,
            Severity::Trace => log::Level::Trace,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.level().as_str()
    }

    /// Whether a filter lets this severity through
    pub fn passes(self, filter: LevelFilter) -> bool {
        self.level() <= filter
    }
}

impl From<log::Level> for Severity {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Severity::Error,
            log::Level::Warn => Severity::Warn,
            log::Level::Info => Severity::Info,
            log::Level::Debug => Severity::Debug,
            log::Level::Trace => Severity::Trace,
        }
    }
}

/// One log line on its way to the aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emitting process
    pub pid: u32,
    /// Stage name, or `supervisor`
    pub source: String,
    pub severity: Severity,
    /// `log` target (module path by default)
    pub target: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Record stamped with the current process id and time
    pub fn new(
        source: impl Into<String>,
        severity: Severity,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            pid: std::process::id(),
            source: source.into(),
            severity,
            target: target.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Wire message on the log channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum LogMessage {
    Record(LogRecord),
    /// No more records will be sent
    Shutdown,
}

/// Create a log channel
pub fn log_channel() -> io::Result<(LogSender, LogReceiver)> {
    let (send, recv) = UnixDatagram::pair()?;
    send.set_write_timeout(Some(SEND_TIMEOUT))?;
    Ok((
        LogSender { socket: send },
        LogReceiver {
            socket: recv,
            buf: vec![0u8; MAX_DATAGRAM],
        },
    ))
}

/// Sending end of the log channel; any number of processes may share it
#[derive(Debug)]
pub struct LogSender {
    socket: UnixDatagram,
}

impl LogSender {
    /// Push one record. Ownership passes to the channel.
    pub fn send(&self, mut record: LogRecord) -> io::Result<()> {
        truncate(&mut record.message, MAX_MESSAGE_LEN);
        self.send_message(&LogMessage::Record(record))
    }

    pub(crate) fn send_shutdown(&self) -> io::Result<()> {
        self.send_message(&LogMessage::Shutdown)
    }

    fn send_message(&self, message: &LogMessage) -> io::Result<()> {
        let bytes = bincode::serialize(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket.send(&bytes)?;
        Ok(())
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            socket: self.socket.try_clone()?,
        })
    }
}

impl AsRawFd for LogSender {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Receiving end of the log channel, owned by the aggregator
#[derive(Debug)]
pub struct LogReceiver {
    socket: UnixDatagram,
    buf: Vec<u8>,
}

impl LogReceiver {
    pub(crate) fn recv(&mut self) -> io::Result<LogMessage> {
        let n = self.socket.recv(&mut self.buf)?;
        bincode::deserialize(&self.buf[..n]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }
}

fn truncate(message: &mut String, max: usize) {
    if message.len() <= max {
        return;
    }
    let mut cut = max;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message.truncate(cut);
    message.push_str(" [truncated]");
}

// =============================================================================
// `log` facade forwarder
// =============================================================================

struct ForwarderState {
    sender: Option<LogSender>,
    source: String,
}

/// Process-wide `log` implementation feeding the log channel
///
/// While no channel is attached (before start-up and after teardown) records
/// are written straight to stderr.
pub struct ChannelLogger {
    state: RwLock<ForwarderState>,
}

static LOGGER: ChannelLogger = ChannelLogger {
    state: RwLock::new(ForwarderState {
        sender: None,
        source: String::new(),
    }),
};

impl Log for ChannelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let source = if state.source.is_empty() {
            SUPERVISOR_SOURCE
        } else {
            state.source.as_str()
        };
        let entry = LogRecord::new(
            source,
            record.level().into(),
            record.target(),
            record.args().to_string(),
        );

        match &state.sender {
            Some(sender) => {
                let _ = sender.send(entry);
            }
            None => eprintln!("{}", format_record(&entry)),
        }
    }

    fn flush(&self) {}
}

/// Install the forwarder as the `log` backend and set the global filter
///
/// Safe to call more than once; only the filter changes after the first call.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Route this process's records into `sender`
pub fn attach(sender: LogSender) {
    let mut state = LOGGER.state.write().unwrap_or_else(|e| e.into_inner());
    state.sender = Some(sender);
}

/// Stop routing records into the channel; returns the sender that was in use
pub fn detach() -> Option<LogSender> {
    let mut state = LOGGER.state.write().unwrap_or_else(|e| e.into_inner());
    state.sender.take()
}

/// Label every record this process emits from now on
pub fn set_source(name: &str) {
    let mut state = LOGGER.state.write().unwrap_or_else(|e| e.into_inner());
    state.source = name.to_string();
}

/// Descriptor of the attached channel, which a forked stage must keep open
pub fn forwarding_fd() -> Option<RawFd> {
    let state = LOGGER.state.read().unwrap_or_else(|e| e.into_inner());
    state.sender.as_ref().map(AsRawFd::as_raw_fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_filter() {
        assert!(Severity::Error.passes(LevelFilter::Warn));
        assert!(Severity::Warn.passes(LevelFilter::Warn));
        assert!(!Severity::Info.passes(LevelFilter::Warn));
        assert!(!Severity::Error.passes(LevelFilter::Off));
        assert!(Severity::Trace.passes(LevelFilter::Trace));
    }

    #[test]
    fn test_record_carries_pid() {
        let record = LogRecord::new("writer", Severity::Info, "test", "hello");
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.source, "writer");
    }

    #[test]
    fn test_channel_transfers_records_in_order() {
        let (sender, mut receiver) = log_channel().unwrap();
        for i in 0..10 {
            sender
                .send(LogRecord::new("t", Severity::Info, "test", format!("line {}", i)))
                .unwrap();
        }
        sender.send_shutdown().unwrap();

        for i in 0..10 {
            match receiver.recv().unwrap() {
                LogMessage::Record(record) => assert_eq!(record.message, format!("line {}", i)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(receiver.recv().unwrap(), LogMessage::Shutdown);
    }

    #[test]
    fn test_long_message_truncated() {
        let (sender, mut receiver) = log_channel().unwrap();
        let long = "é".repeat(MAX_MESSAGE_LEN);
        sender.send(LogRecord::new("t", Severity::Warn, "test", long)).unwrap();

        match receiver.recv().unwrap() {
            LogMessage::Record(record) => {
                assert!(record.message.ends_with("[truncated]"));
                assert!(record.message.len() <= MAX_MESSAGE_LEN + 12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cloned_sender_shares_channel() {
        let (sender, mut receiver) = log_channel().unwrap();
        let clone = sender.try_clone().unwrap();
        drop(sender);
        clone.send(LogRecord::new("t", Severity::Info, "test", "via clone")).unwrap();

        match receiver.recv().unwrap() {
            LogMessage::Record(record) => assert_eq!(record.message, "via clone"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
