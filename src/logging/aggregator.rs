//! Log aggregator thread
//!
//! Drains the log channel and hands each record to every sink whose level
//! admits it. Stopping is in-band: `stop()` queues a shutdown marker behind
//! everything already sent, and the thread exits once it has seen the marker
//! and emptied the channel.

use crate::daemon::config::LoggingSection;
use crate::logging::sink::{build_sinks, Sink};
use crate::logging::{log_channel, LogMessage, LogReceiver, LogRecord, LogSender, Severity};
use log::LevelFilter;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Source label of records the aggregator emits about itself
const AGGREGATOR_SOURCE: &str = "log-aggregator";

/// Longest time a record may sit in a buffered sink
const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Counters reported when the aggregator exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Records that passed the global filter
    pub dispatched: u64,
    /// Records dropped by the global filter
    pub filtered: u64,
    /// Datagrams that did not decode
    pub malformed: u64,
}

/// Handle on the running aggregator thread
pub struct LogAggregator {
    control: LogSender,
    handle: Option<JoinHandle<AggregatorStats>>,
    stop_sent: bool,
}

impl LogAggregator {
    /// Start an aggregator with the sinks named in `section`
    ///
    /// Returns the aggregator and a sender for the new log channel.
    pub fn spawn(section: &LoggingSection) -> io::Result<(Self, LogSender)> {
        let sinks = build_sinks(section)?;
        Self::with_sinks(sinks, section.level)
    }

    /// Start an aggregator with caller-supplied sinks
    pub fn with_sinks(sinks: Vec<Box<dyn Sink>>, level: LevelFilter) -> io::Result<(Self, LogSender)> {
        let (sender, receiver) = log_channel()?;
        let control = sender.try_clone()?;

        let handle = thread::Builder::new()
            .name("log-aggregator".to_string())
            .spawn(move || drain(receiver, sinks, level))?;

        Ok((
            Self {
                control,
                handle: Some(handle),
                stop_sent: false,
            },
            sender,
        ))
    }

    /// Signal that no more records will be sent. Returns immediately.
    pub fn stop(&mut self) -> io::Result<()> {
        if !self.stop_sent {
            self.control.send_shutdown()?;
            self.stop_sent = true;
        }
        Ok(())
    }

    /// Block until the thread has drained the channel and exited
    ///
    /// Sends the stop marker first if `stop()` was not called.
    pub fn join(mut self) -> AggregatorStats {
        self.finish()
    }

    fn finish(&mut self) -> AggregatorStats {
        let Some(handle) = self.handle.take() else {
            return AggregatorStats::default();
        };

        if let Err(e) = self.stop() {
            eprintln!("log aggregator: failed to send stop marker: {}", e);
        }

        handle.join().unwrap_or_else(|_| {
            eprintln!("log aggregator: thread panicked");
            AggregatorStats::default()
        })
    }
}

impl Drop for LogAggregator {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Per-sink dispatch state
struct SinkSlot {
    sink: Box<dyn Sink>,
    /// Set after the first write error, so each sink complains once
    failed: bool,
}

struct Dispatcher {
    slots: Vec<SinkSlot>,
    level: LevelFilter,
    stats: AggregatorStats,
}

impl Dispatcher {
    fn dispatch(&mut self, record: &LogRecord) {
        if !record.severity.passes(self.level) {
            self.stats.filtered += 1;
            return;
        }
        self.stats.dispatched += 1;

        for slot in &mut self.slots {
            if !record.severity.passes(slot.sink.level()) {
                continue;
            }
            if let Err(e) = slot.sink.emit(record) {
                if !slot.failed {
                    eprintln!("log aggregator: {} failed: {}", slot.sink.describe(), e);
                    slot.failed = true;
                }
            }
        }
    }

    fn flush(&mut self) {
        for slot in &mut self.slots {
            if let Err(e) = slot.sink.flush() {
                if !slot.failed {
                    eprintln!("log aggregator: {} flush failed: {}", slot.sink.describe(), e);
                    slot.failed = true;
                }
            }
        }
    }

    fn handle(&mut self, received: io::Result<LogMessage>) -> Step {
        match received {
            Ok(LogMessage::Record(record)) => {
                self.dispatch(&record);
                Step::Continue
            }
            Ok(LogMessage::Shutdown) => Step::Shutdown,
            Err(ref e) if e.kind() == io::ErrorKind::InvalidData => {
                self.stats.malformed += 1;
                Step::Continue
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Step::Idle
            }
            Err(e) => {
                eprintln!("log aggregator: receive failed: {}", e);
                Step::Failed
            }
        }
    }
}

enum Step {
    Continue,
    Shutdown,
    /// Nothing to read right now
    Idle,
    Failed,
}

fn drain(mut receiver: LogReceiver, sinks: Vec<Box<dyn Sink>>, level: LevelFilter) -> AggregatorStats {
    let mut dispatcher = Dispatcher {
        slots: sinks
            .into_iter()
            .map(|sink| SinkSlot { sink, failed: false })
            .collect(),
        level,
        stats: AggregatorStats::default(),
    };

    if let Err(e) = receiver.set_read_timeout(Some(FLUSH_INTERVAL)) {
        eprintln!("log aggregator: cannot set receive timeout: {}", e);
    }

    let mut last_flush = Instant::now();
    loop {
        match dispatcher.handle(receiver.recv()) {
            Step::Continue => {
                if last_flush.elapsed() >= FLUSH_INTERVAL {
                    dispatcher.flush();
                    last_flush = Instant::now();
                }
            }
            Step::Idle => {
                dispatcher.flush();
                last_flush = Instant::now();
            }
            Step::Shutdown | Step::Failed => break,
        }
    }

    // Pick up anything that landed behind the stop marker
    if receiver.set_nonblocking(true).is_ok() {
        loop {
            match dispatcher.handle(receiver.recv()) {
                Step::Continue | Step::Shutdown => continue,
                Step::Idle | Step::Failed => break,
            }
        }
    }

    let stats = dispatcher.stats;
    dispatcher.dispatch(&LogRecord::new(
        AGGREGATOR_SOURCE,
        Severity::Info,
        module_path!(),
        format!(
            "log aggregator stopped ({} records, {} filtered, {} malformed)",
            stats.dispatched, stats.filtered, stats.malformed
        ),
    ));
    dispatcher.flush();

    stats
}
