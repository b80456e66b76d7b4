//! Pipeline stages
//!
//! Every stage variant implements [`Stage`]. The supervisor resolves the
//! variant from the `kind` tag of its configuration section and hands the
//! boxed stage to a [`WorkerProcess`](crate::daemon::worker::WorkerProcess),
//! which runs it in a child process.

pub mod format_writer;
pub mod protocol_consumer;
pub mod table_dumper;

pub use format_writer::FormatWriter;
pub use protocol_consumer::ProtocolConsumer;
pub use table_dumper::TableDumper;

use crate::daemon::config::{ConfigBundle, StageKind, StageSection, StageSettings};
use crate::daemon::queue::{bounded, QueueConsumer, QueueError, QueueProducer};
use crate::signal::ShutdownToken;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::fd::RawFd;

/// One message handed from a protocol consumer to a format writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Per-producer counter, starting at 0
    pub sequence: u64,
    pub topic: String,
    pub key: Option<String>,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// A long-running unit of pipeline work
pub trait Stage {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    /// Run until `stop` is cancelled or the stage's queue peer goes away
    fn run(&mut self, stop: &ShutdownToken) -> Result<()>;

    /// Descriptors the stage process must keep open after fork
    fn retained_fds(&self) -> Vec<RawFd> {
        Vec::new()
    }
}

struct QueueEnds {
    producer: Option<QueueProducer<WorkItem>>,
    consumer: Option<QueueConsumer<WorkItem>>,
}

/// Queues of one pipeline, keyed by queue name
///
/// Each endpoint can be taken exactly once, by the stage that owns it.
pub struct QueueRegistry {
    queues: BTreeMap<String, QueueEnds>,
}

impl QueueRegistry {
    /// One queue per enabled producer, sized by the producer's capacity
    pub fn create(config: &ConfigBundle) -> Result<Self, QueueError> {
        let mut queues = BTreeMap::new();
        for stage in config.enabled_stages() {
            if let Some(name) = stage.output() {
                let (producer, consumer) = bounded(stage.queue_capacity)?;
                queues.insert(
                    name.to_string(),
                    QueueEnds {
                        producer: Some(producer),
                        consumer: Some(consumer),
                    },
                );
            }
        }
        Ok(Self { queues })
    }

    pub fn take_producer(&mut self, queue: &str) -> Option<QueueProducer<WorkItem>> {
        self.queues.get_mut(queue).and_then(|ends| ends.producer.take())
    }

    pub fn take_consumer(&mut self, queue: &str) -> Option<QueueConsumer<WorkItem>> {
        self.queues.get_mut(queue).and_then(|ends| ends.consumer.take())
    }
}

/// Construct the stage described by `section`
///
/// Takes the stage's queue endpoint out of `queues` and prepares its output
/// directories, so every problem surfaces before anything is forked.
pub fn build(section: &StageSection, config: &ConfigBundle, queues: &mut QueueRegistry) -> Result<Box<dyn Stage>> {
    let stage: Box<dyn Stage> = match &section.settings {
        StageSettings::ProtocolConsumer(settings) => {
            let output = queues
                .take_producer(&settings.output)
                .ok_or_else(|| anyhow!("queue '{}' has no free producer end", settings.output))?;
            Box::new(ProtocolConsumer::new(&section.name, settings, config.broker(), output)?)
        }
        StageSettings::FormatWriter(settings) => {
            let input = queues
                .take_consumer(&settings.input)
                .ok_or_else(|| anyhow!("queue '{}' has no free consumer end", settings.input))?;
            Box::new(FormatWriter::new(&section.name, settings, input)?)
        }
        StageSettings::TableDumper(settings) => Box::new(TableDumper::new(&section.name, settings)?),
    };
    Ok(stage)
}
