//! Protocol consumer stage
//!
//! Reads newline-delimited messages and pushes each one into its output
//! queue as a [`WorkItem`]. Messages come from a local stream file that is
//! tailed, or from a TCP connection to the first reachable broker server.
//! A line of the form `<key>\t<payload>` carries a message key.

use crate::daemon::config::{BrokerSection, ProtocolConsumerSettings, StageKind};
use crate::daemon::queue::{QueueError, QueueProducer};
use crate::signal::ShutdownToken;
use crate::stages::{Stage, WorkItem};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

enum MessageSource {
    File(PathBuf),
    Broker(Vec<String>),
}

/// What one attempt to read a line produced
enum ReadOutcome {
    /// A complete line is in the pending buffer
    Line,
    /// No data right now
    Idle,
    /// End of input; any partial line stays pending
    Eof,
}

/// Why a pump loop returned
enum PumpEnd {
    Stopped,
    /// The consumer end of the queue went away
    Downstream,
    /// The connection closed (broker mode only)
    Closed,
}

pub struct ProtocolConsumer {
    name: String,
    topic: String,
    source: MessageSource,
    broker: BrokerSection,
    poll_interval: Duration,
    output: QueueProducer<WorkItem>,
    sequence: u64,
}

impl ProtocolConsumer {
    pub fn new(
        name: &str,
        settings: &ProtocolConsumerSettings,
        broker: &BrokerSection,
        output: QueueProducer<WorkItem>,
    ) -> Result<Self> {
        if settings.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }

        let source = match &settings.source {
            Some(path) => MessageSource::File(path.clone()),
            None => MessageSource::Broker(broker.servers.clone()),
        };

        Ok(Self {
            name: name.to_string(),
            topic: settings.topic.clone().unwrap_or_else(|| name.to_string()),
            source,
            broker: broker.clone(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            output,
            sequence: 0,
        })
    }

    /// Turn a complete line into a work item and queue it
    ///
    /// Returns `false` once the consumer end is gone.
    fn publish(&mut self, line: &[u8]) -> Result<bool> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\n', '\r']);
        if text.is_empty() {
            return Ok(true);
        }

        let (key, payload) = match text.split_once('\t') {
            Some((key, payload)) if !key.is_empty() => (Some(key.to_string()), payload.to_string()),
            _ => (None, text.to_string()),
        };

        let item = WorkItem {
            sequence: self.sequence,
            topic: self.topic.clone(),
            key,
            payload,
            received_at: Utc::now(),
        };

        match self.output.put(&item) {
            Ok(()) => {
                self.sequence += 1;
                Ok(true)
            }
            Err(QueueError::Disconnected) => Ok(false),
            Err(e) => Err(e).context("failed to queue message"),
        }
    }

    fn pump<R: BufRead>(&mut self, reader: &mut R, pending: &mut Vec<u8>, stop: &ShutdownToken) -> Result<PumpEnd> {
        loop {
            if stop.is_cancelled() {
                return Ok(PumpEnd::Stopped);
            }

            match read_line(reader, pending)? {
                ReadOutcome::Line => {
                    let line = std::mem::take(pending);
                    if !self.publish(&line)? {
                        return Ok(PumpEnd::Downstream);
                    }
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Eof => return Ok(PumpEnd::Closed),
            }
        }
    }

    fn run_file(&mut self, path: &Path, stop: &ShutdownToken) -> Result<()> {
        let Some(file) = self.open_source(path, stop) else {
            return Ok(());
        };
        let mut reader = BufReader::new(file);
        if self.broker.offset_reset_to_largest {
            reader.seek(SeekFrom::End(0)).context("cannot seek to end of source")?;
        }
        log::info!("stage '{}' tailing {}", self.name, path.display());

        let mut pending = Vec::new();
        loop {
            match self.pump(&mut reader, &mut pending, stop)? {
                PumpEnd::Stopped => return Ok(()),
                PumpEnd::Downstream => {
                    log::info!("stage '{}': output queue closed, stopping", self.name);
                    return Ok(());
                }
                PumpEnd::Closed => {}
            }

            // Caught up with the writer of the file
            let position = reader.stream_position().context("cannot read source position")?;
            if let Ok(meta) = std::fs::metadata(path) {
                if meta.len() < position {
                    log::warn!("stage '{}': {} was truncated, reading from start", self.name, path.display());
                    reader.seek(SeekFrom::Start(0)).context("cannot rewind source")?;
                    pending.clear();
                }
            }
            if stop.sleep(self.poll_interval) {
                return Ok(());
            }
        }
    }

    /// Open the source file, waiting for it to appear
    fn open_source(&self, path: &Path, stop: &ShutdownToken) -> Option<File> {
        let mut warned = false;
        loop {
            match File::open(path) {
                Ok(file) => return Some(file),
                Err(e) => {
                    if !warned {
                        log::warn!("stage '{}' waiting for {}: {}", self.name, path.display(), e);
                        warned = true;
                    }
                }
            }
            if stop.sleep(self.poll_interval) {
                return None;
            }
        }
    }

    fn run_broker(&mut self, servers: &[String], stop: &ShutdownToken) -> Result<()> {
        let mut backoff = self.poll_interval;

        while !stop.is_cancelled() {
            let Some(stream) = connect_any(servers) else {
                log::warn!(
                    "stage '{}': no broker reachable among {}, retrying in {:?}",
                    self.name,
                    servers.join(", "),
                    backoff
                );
                if stop.sleep(backoff) {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            };
            backoff = self.poll_interval;

            stream
                .set_read_timeout(Some(self.poll_interval))
                .context("cannot set broker read timeout")?;
            log::info!(
                "stage '{}' connected to {} (client {}, group {})",
                self.name,
                stream.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
                self.broker.client_id,
                self.broker.group_id
            );

            let mut reader = BufReader::new(stream);
            let mut pending = Vec::new();
            match self.pump(&mut reader, &mut pending, stop)? {
                PumpEnd::Stopped => break,
                PumpEnd::Downstream => {
                    log::info!("stage '{}': output queue closed, stopping", self.name);
                    break;
                }
                PumpEnd::Closed => {
                    if !pending.is_empty() {
                        log::warn!("stage '{}': dropped partial message at disconnect", self.name);
                    }
                    log::warn!("stage '{}': broker closed the connection", self.name);
                }
            }
        }

        Ok(())
    }
}

impl Stage for ProtocolConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::ProtocolConsumer
    }

    fn run(&mut self, stop: &ShutdownToken) -> Result<()> {
        let result = match &self.source {
            MessageSource::File(path) => {
                let path = path.clone();
                self.run_file(&path, stop)
            }
            MessageSource::Broker(servers) => {
                let servers = servers.clone();
                self.run_broker(&servers, stop)
            }
        };
        log::info!("stage '{}' queued {} messages", self.name, self.sequence);
        result
    }

    fn retained_fds(&self) -> Vec<RawFd> {
        vec![self.output.as_raw_fd()]
    }
}

fn read_line<R: BufRead>(reader: &mut R, pending: &mut Vec<u8>) -> Result<ReadOutcome> {
    match reader.read_until(b'\n', pending) {
        Ok(0) => Ok(ReadOutcome::Eof),
        Ok(_) if pending.ends_with(b"\n") => Ok(ReadOutcome::Line),
        Ok(_) => Ok(ReadOutcome::Eof),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
            Ok(ReadOutcome::Idle)
        }
        Err(e) => Err(e).context("failed to read message"),
    }
}

fn connect_any(servers: &[String]) -> Option<TcpStream> {
    for server in servers {
        let Ok(addrs) = server.to_socket_addrs() else {
            log::debug!("cannot resolve broker {}", server);
            continue;
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Some(stream),
                Err(e) => log::debug!("broker {} ({}) unreachable: {}", server, addr, e),
            }
        }
    }
    None
}
