//! Top-level error type and exit codes
//!
//! Every fatal condition the binary can hit funnels into [`PipevisorError`],
//! which knows its exit code and a short machine-readable error code.

use crate::daemon::config::ConfigError;
use crate::daemon::queue::QueueError;
use crate::daemon::worker::WorkerError;
use thiserror::Error;

/// Clean shutdown, or help/version printed
pub const EXIT_OK: i32 = 0;

/// Bad command-line usage
pub const EXIT_USAGE: i32 = 1;

/// Configuration or start-up failure
pub const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Error)]
pub enum PipevisorError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("start-up failed: {0:#}")]
    Startup(anyhow::Error),
}

impl PipevisorError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PipevisorError::Usage(_) => EXIT_USAGE,
            PipevisorError::Config(_) | PipevisorError::Startup(_) => EXIT_CONFIG,
        }
    }

    /// Short error category
    pub fn code(&self) -> &'static str {
        match self {
            PipevisorError::Usage(_) => "USAGE_ERROR",
            PipevisorError::Config(_) => "CONFIG_ERROR",
            PipevisorError::Startup(_) => "STARTUP_ERROR",
        }
    }

    /// One-line diagnostic for stderr
    pub fn to_text(&self) -> String {
        format!("pipevisor: {}: {}", self.code(), self)
    }
}

impl From<anyhow::Error> for PipevisorError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ConfigError>() {
            Ok(config) => PipevisorError::Config(config),
            Err(other) => PipevisorError::Startup(other),
        }
    }
}

impl From<QueueError> for PipevisorError {
    fn from(err: QueueError) -> Self {
        PipevisorError::Startup(anyhow::Error::new(err).context("failed to create stage queue"))
    }
}

impl From<WorkerError> for PipevisorError {
    fn from(err: WorkerError) -> Self {
        PipevisorError::Startup(anyhow::Error::new(err))
    }
}
