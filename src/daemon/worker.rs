//! Stage processes
//!
//! A [`WorkerProcess`] owns one [`Stage`] until it is started, then forks a
//! child that runs it. The parent only keeps the pid and the lifecycle state;
//! the child owns the stage, its queue endpoints and its copy of the
//! configuration.
//!
//! Stopping is cooperative. `stop()` sends SIGTERM, which the child turns into
//! a cancelled [`ShutdownToken`]; whatever the stage does with that is up to
//! the stage. SIGINT and SIGQUIT sent straight to a stage process do the same.
//! Nothing here ever sends SIGKILL.

use crate::daemon::config::{StageKind, StageRole};
use crate::logging;
use crate::signal::{ShutdownToken, TERM_SIGNALS};
use crate::stages::Stage;
use nix::errno::Errno;
use nix::sys::signal::{self, pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, setpgid, ForkResult, Pid};
use std::fmt;
use std::os::fd::RawFd;
use thiserror::Error;

/// Highest descriptor closed when /proc is unavailable
const FALLBACK_MAX_FD: RawFd = 1024;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn stage '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("stage '{0}' was already started")]
    AlreadyStarted(String),
}

/// Lifecycle state of a stage process, as last observed by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Not forked yet
    Created,
    /// Forked, not yet seen alive by `poll`
    Started,
    Running,
    /// SIGTERM sent, exit not yet observed
    StopRequested,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Created => "created",
            Lifecycle::Started => "started",
            Lifecycle::Running => "running",
            Lifecycle::StopRequested => "stop-requested",
            Lifecycle::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// How a stage process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signaled(Signal),
    /// Reaped by someone else; status unknown
    Lost,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, WorkerExit::Code(0))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "exit code {}", code),
            WorkerExit::Signaled(sig) => write!(f, "killed by {}", sig.as_str()),
            WorkerExit::Lost => f.write_str("exit status unknown"),
        }
    }
}

/// One stage and the process running it
pub struct WorkerProcess {
    name: String,
    kind: StageKind,
    /// Present until the stage has been handed to a child
    unit: Option<Box<dyn Stage>>,
    state: Lifecycle,
    pid: Option<Pid>,
    exit: Option<WorkerExit>,
}

impl WorkerProcess {
    pub fn new(name: impl Into<String>, unit: Box<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            kind: unit.kind(),
            unit: Some(unit),
            state: Lifecycle::Created,
            pid: None,
            exit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn role(&self) -> StageRole {
        self.kind.role()
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<WorkerExit> {
        self.exit
    }

    /// Fork the stage process and return without waiting for it
    pub fn start(&mut self) -> Result<Pid, WorkerError> {
        if self.state != Lifecycle::Created {
            return Err(WorkerError::AlreadyStarted(self.name.clone()));
        }
        let Some(unit) = self.unit.take() else {
            return Err(WorkerError::AlreadyStarted(self.name.clone()));
        };

        let mut keep = unit.retained_fds();
        if let Some(fd) = logging::forwarding_fd() {
            keep.push(fd);
        }

        // Hold termination signals until the child has its own handlers in
        // place, so an early stop request reaches the stage's token
        let mut term = SigSet::empty();
        for &sig in TERM_SIGNALS {
            if let Ok(sig) = Signal::try_from(sig) {
                term.add(sig);
            }
        }
        let mut previous = SigSet::empty();
        if let Err(source) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&term), Some(&mut previous)) {
            self.unit = Some(unit);
            return Err(WorkerError::Spawn {
                name: self.name.clone(),
                source,
            });
        }

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
                // Closes the parent's copies of the stage's queue endpoints
                drop(unit);
                self.pid = Some(child);
                self.state = Lifecycle::Started;
                log::debug!("stage '{}' forked as pid {}", self.name, child);
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                let code = run_child(&self.name, unit, &keep, &previous);
                std::process::exit(code);
            }
            Err(source) => {
                let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
                self.unit = Some(unit);
                Err(WorkerError::Spawn {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Reap the child if it has exited, without blocking
    pub fn poll(&mut self) -> Lifecycle {
        let Some(pid) = self.pid else {
            return self.state;
        };
        if self.exit.is_some() {
            return self.state;
        }

        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if self.state == Lifecycle::Started {
                        self.state = Lifecycle::Running;
                    }
                }
                Ok(WaitStatus::Exited(_, code)) => self.finish(WorkerExit::Code(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => self.finish(WorkerExit::Signaled(sig)),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => self.finish(WorkerExit::Lost),
                Err(e) => log::warn!("failed to poll stage '{}' (pid {}): {}", self.name, pid, e),
            }
            return self.state;
        }
    }

    fn finish(&mut self, exit: WorkerExit) {
        self.exit = Some(exit);
        self.state = Lifecycle::Stopped;
    }

    /// Ask the stage to stop and return immediately
    ///
    /// A stage that was never started is simply marked stopped. Calling this
    /// again after a stop request does nothing.
    pub fn stop(&mut self) {
        match self.state {
            Lifecycle::Created => {
                self.unit = None;
                self.state = Lifecycle::Stopped;
                return;
            }
            Lifecycle::StopRequested | Lifecycle::Stopped => return,
            Lifecycle::Started | Lifecycle::Running => {}
        }

        // Never signal a pid that has already been reaped
        if self.poll() == Lifecycle::Stopped {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };

        match signal::kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("failed to signal stage '{}' (pid {}): {}", self.name, pid, e),
        }
        self.state = Lifecycle::StopRequested;
    }

    pub fn is_stopped(&self) -> bool {
        self.state == Lifecycle::Stopped
    }
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}

/// Body of the forked stage process; returns the exit code
fn run_child(name: &str, mut unit: Box<dyn Stage>, keep: &[RawFd], mask: &SigSet) -> i32 {
    // Terminal Ctrl-C goes to the supervisor only
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

    close_inherited_fds(keep);
    logging::set_source(name);

    // The supervisor's handlers survive fork but feed its own token, so
    // register the stage's token for the same signals
    let stop = ShutdownToken::new();
    let installed = stop.install(TERM_SIGNALS);
    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(mask), None);
    if let Err(e) = installed {
        log::error!("stage '{}' cannot install stop handlers: {:#}", name, e);
        return 1;
    }

    log::info!("stage '{}' running ({})", name, unit.kind().as_str());
    match unit.run(&stop) {
        Ok(()) => {
            log::info!("stage '{}' finished", name);
            0
        }
        Err(e) => {
            log::error!("stage '{}' failed: {:#}", name, e);
            1
        }
    }
}

/// Close every descriptor above stderr that is not in `keep`
///
/// Sibling stages' queue endpoints would otherwise stay open in this process
/// and hide peer disconnects.
fn close_inherited_fds(keep: &[RawFd]) {
    let open: Vec<RawFd> = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect(),
        Err(_) => (0..FALLBACK_MAX_FD).collect(),
    };

    for fd in open {
        if fd > 2 && !keep.contains(&fd) {
            let _ = close(fd);
        }
    }
}
