//! Pipeline supervisor
//!
//! - `config`: immutable configuration snapshot, copied into stages on fork
//! - `protocol`: length-prefixed bincode frames
//! - `queue`: bounded producer/consumer queue over a Unix socket pair
//! - `worker`: fork-based stage processes
//! - `supervisor`: start ordering, wait loop and ordered shutdown

pub mod config;
pub mod protocol;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use config::{ConfigBundle, ConfigError};
pub use queue::{bounded, QueueConsumer, QueueError, QueueProducer};
pub use supervisor::{Supervisor, SupervisorState};
pub use worker::{Lifecycle, WorkerError, WorkerExit, WorkerProcess};
