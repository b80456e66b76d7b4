//! Supervisor control loop
//!
//! `Init -> Running -> Draining -> Terminated`
//!
//! - Init ([`Supervisor::new`]): plan the start order, create the queues and
//!   build every stage. Nothing is forked yet, so a failure here leaves no
//!   process behind.
//! - Running ([`Supervisor::start`], [`Supervisor::wait`]): signal handlers,
//!   log aggregator, stage processes in dependency order, then a sleep loop
//!   on the shutdown token.
//! - Draining ([`Supervisor::drain`]): stop stages in reverse start order
//!   with a grace interval after each.
//! - Terminated ([`Supervisor::terminate`]): stop and join the aggregator.

use crate::daemon::config::{ConfigBundle, LoggingSection, ShutdownSection, StageSection};
use crate::daemon::worker::{Lifecycle, WorkerProcess};
use crate::error::PipevisorError;
use crate::logging::{self, AggregatorStats, LogAggregator, SUPERVISOR_SOURCE};
use crate::signal::{signal_name, ShutdownToken, TERM_SIGNALS};
use crate::stages::{self, QueueRegistry};
use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Running,
    Draining,
    Terminated,
}

/// Order in which enabled stages are started
///
/// A stage that reads a queue starts after the stage feeding it; otherwise
/// declaration order is kept. Returns indexes into `stages`.
pub fn plan_start_order(stages: &[StageSection]) -> Vec<usize> {
    let producer_of: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .filter(|(_, s)| s.enabled)
        .filter_map(|(i, s)| s.output().map(|queue| (queue, i)))
        .collect();

    let mut pending: Vec<usize> = (0..stages.len()).filter(|&i| stages[i].enabled).collect();
    let mut order = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let ready = pending.iter().position(|&i| {
            stages[i]
                .input()
                .and_then(|queue| producer_of.get(queue))
                .map_or(true, |producer| order.contains(producer))
        });
        // A dependency cycle cannot come out of a validated config; fall back
        // to declaration order if one ever does
        let next = pending.remove(ready.unwrap_or(0));
        order.push(next);
    }

    order
}

pub struct Supervisor {
    /// Released once every stage has been stopped
    config: Option<ConfigBundle>,
    app_name: String,
    logging: LoggingSection,
    timing: ShutdownSection,
    state: SupervisorState,
    /// In start order
    workers: Vec<WorkerProcess>,
    /// Workers whose unexpected exit has been logged
    reported: Vec<bool>,
    shutdown: ShutdownToken,
    aggregator: Option<LogAggregator>,
}

impl Supervisor {
    /// Load the configuration at `path` and prepare every stage
    pub fn from_path(path: &Path) -> Result<Self, PipevisorError> {
        let config = ConfigBundle::load(path)?;
        Self::new(config)
    }

    /// Prepare every enabled stage of a validated configuration
    pub fn new(config: ConfigBundle) -> Result<Self, PipevisorError> {
        let order = plan_start_order(config.stages());
        let mut queues = QueueRegistry::create(&config)?;

        let mut workers = Vec::with_capacity(order.len());
        for index in order {
            let section = &config.stages()[index];
            let unit = stages::build(section, &config, &mut queues)
                .with_context(|| format!("cannot set up stage '{}'", section.name))?;
            workers.push(WorkerProcess::new(section.name.clone(), unit));
        }

        Ok(Self {
            app_name: config.app_name().to_string(),
            logging: config.logging().clone(),
            timing: *config.shutdown(),
            config: Some(config),
            state: SupervisorState::Init,
            reported: vec![false; workers.len()],
            workers,
            shutdown: ShutdownToken::new(),
            aggregator: None,
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Stage processes in start order
    pub fn workers(&self) -> &[WorkerProcess] {
        &self.workers
    }

    /// Handle that requests shutdown when cancelled
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Whether the supervisor still holds its configuration handle
    pub fn holds_config(&self) -> bool {
        self.config.is_some()
    }

    /// Run the whole lifecycle and return once every stage has been stopped
    pub fn run(mut self) -> Result<(), PipevisorError> {
        self.start()?;
        self.wait();
        self.drain();
        self.terminate();
        Ok(())
    }

    /// Init -> Running
    pub fn start(&mut self) -> Result<(), PipevisorError> {
        if self.state != SupervisorState::Init {
            return Err(PipevisorError::Startup(anyhow::anyhow!("supervisor already started")));
        }

        self.shutdown
            .install(TERM_SIGNALS)
            .context("cannot install termination handlers")?;

        let (aggregator, sender) =
            LogAggregator::spawn(&self.logging).context("cannot start log aggregator")?;
        logging::init(self.logging.level);
        logging::set_source(SUPERVISOR_SOURCE);
        logging::attach(sender);
        self.aggregator = Some(aggregator);

        for index in 0..self.workers.len() {
            match self.workers[index].start() {
                Ok(pid) => log::info!(
                    "stage '{}' ({}) started as pid {}",
                    self.workers[index].name(),
                    self.workers[index].kind().as_str(),
                    pid
                ),
                Err(e) => {
                    log::error!("{}", e);
                    for worker in self.workers[..index].iter_mut().rev() {
                        log::info!("stopping stage '{}'", worker.name());
                        worker.stop();
                    }
                    self.terminate();
                    return Err(e.into());
                }
            }
        }

        self.state = SupervisorState::Running;
        log::info!("{} started with {} stages", self.app_name, self.workers.len());
        Ok(())
    }

    /// Sleep in poll-interval slices until the shutdown token is cancelled
    pub fn wait(&mut self) {
        while !self.shutdown.sleep(self.timing.poll_interval) {
            self.poll_workers();
        }

        match self.shutdown.signal() {
            Some(sig) => log::info!("received {}, shutting down", signal_name(sig)),
            None => log::info!("shutdown requested"),
        }
    }

    /// Log stages that exited on their own; they are not restarted
    fn poll_workers(&mut self) {
        for (worker, reported) in self.workers.iter_mut().zip(self.reported.iter_mut()) {
            if *reported || worker.poll() != Lifecycle::Stopped {
                continue;
            }
            *reported = true;
            match worker.exit_status() {
                Some(exit) if exit.success() => {
                    log::info!("stage '{}' exited on its own ({})", worker.name(), exit)
                }
                Some(exit) => log::warn!("stage '{}' died ({}); not restarting", worker.name(), exit),
                None => log::warn!("stage '{}' is gone; not restarting", worker.name()),
            }
        }
    }

    /// Running -> Draining: stop stages last-started first
    pub fn drain(&mut self) {
        self.state = SupervisorState::Draining;
        let grace = self.timing.grace_interval;

        for worker in self.workers.iter_mut().rev() {
            if worker.poll() == Lifecycle::Stopped {
                log::info!("stage '{}' stopped", worker.name());
                continue;
            }

            log::info!("stopping stage '{}'", worker.name());
            worker.stop();
            std::thread::sleep(grace);

            match (worker.poll(), worker.exit_status()) {
                (Lifecycle::Stopped, Some(exit)) => log::info!("stage '{}' stopped ({})", worker.name(), exit),
                (Lifecycle::Stopped, None) => log::info!("stage '{}' stopped", worker.name()),
                _ => log::warn!(
                    "stage '{}' has not exited {:?} after the stop request",
                    worker.name(),
                    grace
                ),
            }
        }

        if self.config.take().is_some() {
            log::debug!("configuration released");
        }
    }

    /// Draining -> Terminated: flush and stop the log aggregator
    pub fn terminate(&mut self) -> AggregatorStats {
        log::info!("supervisor stopped");
        logging::detach();

        let stats = match self.aggregator.take() {
            Some(mut aggregator) => {
                if let Err(e) = aggregator.stop() {
                    log::warn!("cannot stop log aggregator: {}", e);
                }
                aggregator.join()
            }
            None => AggregatorStats::default(),
        };

        self.state = SupervisorState::Terminated;
        stats
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.aggregator.is_some() {
            logging::detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    fn stages(raw: &str) -> Vec<StageSection> {
        let config = format!("queue_capacity: 4\nlogging: {{}}\nstages:\n{}", raw);
        ConfigBundle::build(&config, Path::new("test.yaml"))
            .unwrap()
            .stages()
            .to_vec()
    }

    fn names(stages: &[StageSection], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| stages[i].name.clone()).collect()
    }

    #[test]
    fn test_producer_starts_before_consumer() {
        let stages = stages(
            r#"
  writer:
    kind: format-writer
    input: metrics
    output_dir: /tmp/out
  ingest:
    kind: protocol-consumer
    output: metrics
"#,
        );
        assert_eq!(names(&stages, &plan_start_order(&stages)), vec!["ingest", "writer"]);
    }

    #[test]
    fn test_declaration_order_otherwise() {
        let stages = stages(
            r#"
  tables:
    kind: table-dumper
    source: /tmp/t.csv
    output_dir: /tmp/t
  ingest:
    kind: protocol-consumer
    output: metrics
  writer:
    kind: format-writer
    input: metrics
    output_dir: /tmp/out
  archive:
    kind: table-dumper
    enabled: false
    source: /tmp/a.csv
    output_dir: /tmp/a
"#,
        );
        assert_eq!(
            names(&stages, &plan_start_order(&stages)),
            vec!["tables", "ingest", "writer"]
        );
    }

    #[test]
    #[serial]
    fn test_lifecycle_with_standalone_stage() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("t.csv"), "a\n").unwrap();
        let raw = format!(
            r#"
queue_capacity: 4
logging:
  level: info
  sinks:
    - type: file
      path: {dir}/pipevisor.log
shutdown:
  grace_interval_ms: 500
  poll_interval_ms: 20
stages:
  tables:
    kind: table-dumper
    source: {dir}/t.csv
    output_dir: {dir}/tables
"#,
            dir = dir.path().display()
        );
        let config = ConfigBundle::build(&raw, Path::new("test.yaml")).unwrap();

        let mut supervisor = Supervisor::new(config).unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Init);
        assert_eq!(supervisor.workers()[0].state(), Lifecycle::Created);

        supervisor.start().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);

        let token = supervisor.shutdown_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            token.cancel();
        });
        supervisor.wait();
        canceller.join().unwrap();

        supervisor.drain();
        assert_eq!(supervisor.state(), SupervisorState::Draining);
        assert!(!supervisor.holds_config());
        assert_eq!(supervisor.workers()[0].state(), Lifecycle::Stopped);

        let stats = supervisor.terminate();
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert!(stats.dispatched > 0);

        let log = std::fs::read_to_string(dir.path().join("pipevisor.log")).unwrap();
        assert!(log.contains("stage 'tables' stopped"), "{}", log);
        assert!(log.contains("supervisor stopped"));
        assert!(log.trim_end().ends_with(')'), "{}", log);
        assert!(log.lines().last().unwrap().contains("log aggregator stopped"));
    }
}
