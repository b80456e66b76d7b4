use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Signals that ask the supervisor to shut down
pub const TERM_SIGNALS: &[i32] = &[SIGTERM, SIGINT, SIGQUIT];

/// Granularity of [`ShutdownToken::sleep`]
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Shared "please stop" flag
///
/// Set either by a registered signal or by calling [`ShutdownToken::cancel`].
/// Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
    /// Number of the last registered signal delivered (0 if none)
    signal: Arc<AtomicUsize>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag when any of `signals` is delivered
    ///
    /// Replaces the default disposition, so the process no longer dies on
    /// these signals and must poll the token instead.
    pub fn install(&self, signals: &[i32]) -> Result<()> {
        for &sig in signals {
            signal_hook::flag::register_usize(sig, Arc::clone(&self.signal), sig as usize)
                .with_context(|| format!("failed to register handler for signal {}", sig))?;
            signal_hook::flag::register(sig, Arc::clone(&self.cancelled))
                .with_context(|| format!("failed to register handler for signal {}", sig))?;
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Signal that cancelled the token, if it was a signal
    pub fn signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig as i32),
        }
    }

    /// Sleep for up to `duration`, returning early once cancelled
    ///
    /// Returns `true` if the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Human-readable signal name for log messages
pub fn signal_name(sig: i32) -> String {
    nix::sys::signal::Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", sig))
}
