//! Supervisor configuration
//!
//! The configuration file is YAML with these top-level entries:
//! - `queue_capacity` (required): default capacity of every stage queue
//! - `logging` (required): level and sinks, consumed by the log aggregator
//! - `stages` (required): named stage sections, at least one enabled
//! - `broker` (optional): servers, client/group ids, offset reset policy
//! - `shutdown` (optional): grace and poll intervals
//! - `app_name` (optional)
//!
//! A [`ConfigBundle`] is built once, before any stage process exists, and is
//! never mutated afterwards. Stage processes get their copy when they fork.

use log::LevelFilter;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Application name used when `app_name` is not set
pub const DEFAULT_APP_NAME: &str = "pipevisor";

/// Broker endpoint used when `broker.servers` is not set
pub const DEFAULT_BROKER_SERVER: &str = "localhost:9092";

/// Pause between successive stage stops during shutdown
pub const DEFAULT_GRACE_INTERVAL: Duration = Duration::from_millis(2000);

/// Slice the supervisor sleeps between shutdown checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Config file name looked up next to the executable
pub const DEFAULT_CONFIG_FILE: &str = "pipevisor.yaml";

const DEFAULT_STAGE_POLL_MS: u64 = 200;
const DEFAULT_DUMP_INTERVAL_SECS: u64 = 60;

/// Errors raised while loading the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {}{}: {message}", .path.display(), location_suffix(.line, .column))]
    Parse {
        path: PathBuf,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error("config file {}: missing required section '{section}'", .path.display())]
    MissingSection { path: PathBuf, section: String },

    #[error("config file {}: {message}", .path.display())]
    Invalid { path: PathBuf, message: String },
}

fn location_suffix(line: &Option<usize>, column: &Option<usize>) -> String {
    match (*line, *column) {
        (Some(line), Some(column)) => format!(" at line {}, column {}", line, column),
        (Some(line), None) => format!(" at line {}", line),
        _ => String::new(),
    }
}

impl ConfigError {
    fn parse(path: &Path, err: serde_yaml::Error) -> Self {
        let location = err.location();
        ConfigError::Parse {
            path: path.to_path_buf(),
            line: location.as_ref().map(|l| l.line()),
            column: location.as_ref().map(|l| l.column()),
            message: err.to_string(),
        }
    }

    fn invalid(path: &Path, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    fn missing(path: &Path, section: &str) -> Self {
        ConfigError::MissingSection {
            path: path.to_path_buf(),
            section: section.to_string(),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Where a log sink writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Stderr,
    Stdout,
    File(PathBuf),
}

/// One configured log sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub target: SinkTarget,
    /// Records above this verbosity are skipped by this sink
    pub level: LevelFilter,
}

/// `logging` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSection {
    /// Global filter applied before any sink sees a record
    pub level: LevelFilter,
    pub sinks: Vec<SinkConfig>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            sinks: vec![SinkConfig {
                target: SinkTarget::Stderr,
                level: LevelFilter::Trace,
            }],
        }
    }
}

/// `broker` section with defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSection {
    pub servers: Vec<String>,
    pub client_id: String,
    pub group_id: String,
    /// Start from the newest message instead of the oldest
    pub offset_reset_to_largest: bool,
}

/// `shutdown` section with defaults applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSection {
    pub grace_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            grace_interval: DEFAULT_GRACE_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Stage variant, selected by the `kind` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    ProtocolConsumer,
    FormatWriter,
    TableDumper,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::ProtocolConsumer => "protocol-consumer",
            StageKind::FormatWriter => "format-writer",
            StageKind::TableDumper => "table-dumper",
        }
    }

    pub fn role(&self) -> StageRole {
        match self {
            StageKind::ProtocolConsumer => StageRole::Producer,
            StageKind::FormatWriter => StageRole::Consumer,
            StageKind::TableDumper => StageRole::Standalone,
        }
    }
}

/// Position of a stage relative to the queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    /// Feeds a queue
    Producer,
    /// Drains a queue
    Consumer,
    /// Touches no queue
    Standalone,
}

/// Output encoding of a format writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jsonl,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jsonl => "jsonl",
            OutputFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolConsumerSettings {
    /// Queue the consumed messages are pushed into
    pub output: String,
    /// Tag stamped on every work item (defaults to the stage name)
    #[serde(default)]
    pub topic: Option<String>,
    /// Newline-delimited stream file; broker servers are used when absent
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default = "default_stage_poll_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FormatWriterSettings {
    /// Queue the work items are taken from
    pub input: String,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_stage_poll_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableDumperSettings {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_dump_interval_secs")]
    pub interval_secs: u64,
}

fn default_stage_poll_ms() -> u64 {
    DEFAULT_STAGE_POLL_MS
}

fn default_dump_interval_secs() -> u64 {
    DEFAULT_DUMP_INTERVAL_SECS
}

/// Stage-specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StageSettings {
    ProtocolConsumer(ProtocolConsumerSettings),
    FormatWriter(FormatWriterSettings),
    TableDumper(TableDumperSettings),
}

/// One entry of the `stages` section with defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSection {
    pub name: String,
    pub enabled: bool,
    /// Capacity of the queue this stage produces into
    pub queue_capacity: usize,
    pub settings: StageSettings,
}

impl StageSection {
    pub fn kind(&self) -> StageKind {
        match self.settings {
            StageSettings::ProtocolConsumer(_) => StageKind::ProtocolConsumer,
            StageSettings::FormatWriter(_) => StageKind::FormatWriter,
            StageSettings::TableDumper(_) => StageKind::TableDumper,
        }
    }

    /// Queue this stage drains, if any
    pub fn input(&self) -> Option<&str> {
        match &self.settings {
            StageSettings::FormatWriter(s) => Some(&s.input),
            _ => None,
        }
    }

    /// Queue this stage feeds, if any
    pub fn output(&self) -> Option<&str> {
        match &self.settings {
            StageSettings::ProtocolConsumer(s) => Some(&s.output),
            _ => None,
        }
    }
}

// =============================================================================
// Raw file shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    app_name: Option<String>,
    queue_capacity: usize,
    #[serde(default)]
    logging: Option<RawLogging>,
    #[serde(default)]
    broker: Option<RawBroker>,
    #[serde(default)]
    shutdown: Option<RawShutdown>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    sinks: Vec<RawSink>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawSink {
    Console {
        #[serde(default)]
        stream: Option<String>,
        #[serde(default)]
        level: Option<String>,
    },
    File {
        path: PathBuf,
        #[serde(default)]
        level: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RawBroker {
    #[serde(default)]
    servers: Option<Vec<String>>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    offset_reset_to_largest: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawShutdown {
    #[serde(default)]
    grace_interval_ms: Option<u64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStageCommon {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    queue_capacity: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

// =============================================================================
// ConfigBundle
// =============================================================================

#[derive(Debug)]
struct BundleInner {
    origin: PathBuf,
    raw: Mapping,
    app_name: String,
    queue_capacity: usize,
    logging: LoggingSection,
    broker: BrokerSection,
    shutdown: ShutdownSection,
    stages: Vec<StageSection>,
}

/// Immutable configuration snapshot
///
/// Cloning is cheap and yields another handle on the same snapshot. There is
/// no way to change a bundle once built; reconfiguring means restarting.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    inner: Arc<BundleInner>,
}

impl ConfigBundle {
    /// Installation-relative default config path
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE)
    }

    /// Read and build the configuration at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::build(&content, path)
    }

    /// Build the configuration from YAML text; `origin` is used in errors
    pub fn build(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let document: Value = serde_yaml::from_str(raw).map_err(|e| ConfigError::parse(origin, e))?;
        let mapping = match document {
            Value::Mapping(mapping) => mapping,
            Value::Null => Mapping::new(),
            _ => return Err(ConfigError::invalid(origin, "top level must be a mapping")),
        };

        for section in ["logging", "stages", "queue_capacity"] {
            if !mapping.contains_key(section) {
                return Err(ConfigError::missing(origin, section));
            }
        }

        // Typed pass over the text again so type errors carry a location
        let top: RawConfig = serde_yaml::from_str(raw).map_err(|e| ConfigError::parse(origin, e))?;
        if top.queue_capacity == 0 {
            return Err(ConfigError::invalid(origin, "queue_capacity must be at least 1"));
        }

        let app_name = top
            .app_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_string());
        let logging = resolve_logging(origin, top.logging.unwrap_or_default())?;
        let broker = resolve_broker(top.broker.unwrap_or_default(), &app_name);
        let shutdown = resolve_shutdown(origin, top.shutdown.unwrap_or_default())?;

        let stages = match mapping.get("stages") {
            Some(Value::Mapping(stages)) => parse_stages(origin, stages, top.queue_capacity)?,
            Some(Value::Null) | None => return Err(ConfigError::missing(origin, "stages")),
            Some(_) => {
                return Err(ConfigError::invalid(
                    origin,
                    "`stages` must map stage names to stage sections",
                ))
            }
        };
        if stages.is_empty() {
            return Err(ConfigError::missing(origin, "stages"));
        }
        validate_stages(origin, &stages)?;

        Ok(Self {
            inner: Arc::new(BundleInner {
                origin: origin.to_path_buf(),
                raw: mapping,
                app_name,
                queue_capacity: top.queue_capacity,
                logging,
                broker,
                shutdown,
                stages,
            }),
        })
    }

    /// Path the bundle was loaded from
    pub fn origin(&self) -> &Path {
        &self.inner.origin
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// Global queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    pub fn logging(&self) -> &LoggingSection {
        &self.inner.logging
    }

    pub fn broker(&self) -> &BrokerSection {
        &self.inner.broker
    }

    pub fn shutdown(&self) -> &ShutdownSection {
        &self.inner.shutdown
    }

    /// All stage sections in declaration order
    pub fn stages(&self) -> &[StageSection] {
        &self.inner.stages
    }

    pub fn enabled_stages(&self) -> impl Iterator<Item = &StageSection> {
        self.inner.stages.iter().filter(|s| s.enabled)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSection> {
        self.inner.stages.iter().find(|s| s.name == name)
    }

    /// Raw value of a top-level section as written in the file
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.inner.raw.get(name)
    }

    /// Number of live handles on this snapshot
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

fn parse_level(origin: &Path, value: &str) -> Result<LevelFilter, ConfigError> {
    LevelFilter::from_str(value.trim())
        .map_err(|_| ConfigError::invalid(origin, format!("unknown log level '{}'", value)))
}

fn resolve_logging(origin: &Path, raw: RawLogging) -> Result<LoggingSection, ConfigError> {
    let level = match raw.level {
        Some(level) => parse_level(origin, &level)?,
        None => LevelFilter::Info,
    };

    let mut sinks = Vec::with_capacity(raw.sinks.len());
    for sink in raw.sinks {
        let (target, sink_level) = match sink {
            RawSink::Console { stream, level } => {
                let target = match stream.as_deref().map(str::to_lowercase).as_deref() {
                    None | Some("stderr") => SinkTarget::Stderr,
                    Some("stdout") => SinkTarget::Stdout,
                    Some(other) => {
                        return Err(ConfigError::invalid(
                            origin,
                            format!("unknown console stream '{}'", other),
                        ))
                    }
                };
                (target, level)
            }
            RawSink::File { path, level } => (SinkTarget::File(path), level),
        };
        let level = match sink_level {
            Some(level) => parse_level(origin, &level)?,
            None => LevelFilter::Trace,
        };
        sinks.push(SinkConfig { target, level });
    }

    if sinks.is_empty() {
        sinks = LoggingSection::default().sinks;
    }

    Ok(LoggingSection { level, sinks })
}

fn resolve_broker(raw: RawBroker, app_name: &str) -> BrokerSection {
    let servers = raw
        .servers
        .filter(|servers| !servers.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_BROKER_SERVER.to_string()]);

    BrokerSection {
        servers,
        client_id: raw.client_id.unwrap_or_else(|| app_name.to_string()),
        group_id: raw.group_id.unwrap_or_else(|| app_name.to_string()),
        offset_reset_to_largest: raw.offset_reset_to_largest.unwrap_or(false),
    }
}

fn resolve_shutdown(origin: &Path, raw: RawShutdown) -> Result<ShutdownSection, ConfigError> {
    let defaults = ShutdownSection::default();
    let poll_interval = raw
        .poll_interval_ms
        .map(Duration::from_millis)
        .unwrap_or(defaults.poll_interval);
    if poll_interval.is_zero() {
        return Err(ConfigError::invalid(origin, "shutdown.poll_interval_ms must be positive"));
    }

    Ok(ShutdownSection {
        grace_interval: raw
            .grace_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.grace_interval),
        poll_interval,
    })
}

fn parse_stages(
    origin: &Path,
    stages: &Mapping,
    default_capacity: usize,
) -> Result<Vec<StageSection>, ConfigError> {
    let mut parsed = Vec::with_capacity(stages.len());

    for (key, value) in stages {
        let name = key
            .as_str()
            .ok_or_else(|| ConfigError::invalid(origin, "stage names must be strings"))?
            .to_string();

        if !value.is_mapping() {
            return Err(ConfigError::invalid(
                origin,
                format!("stage '{}' must be a mapping with at least a `kind` key", name),
            ));
        }

        let stage_error =
            |e: serde_yaml::Error| ConfigError::invalid(origin, format!("stage '{}': {}", name, e));
        let common: RawStageCommon = serde_yaml::from_value(value.clone()).map_err(stage_error)?;
        let settings: StageSettings = serde_yaml::from_value(value.clone()).map_err(stage_error)?;

        let queue_capacity = common.queue_capacity.unwrap_or(default_capacity);
        if queue_capacity == 0 {
            return Err(ConfigError::invalid(
                origin,
                format!("stage '{}': queue_capacity must be at least 1", name),
            ));
        }

        parsed.push(StageSection {
            name,
            enabled: common.enabled,
            queue_capacity,
            settings,
        });
    }

    Ok(parsed)
}

/// Reject stage sets that cannot run: nothing enabled, or a queue without
/// exactly one enabled producer and one enabled consumer
fn validate_stages(origin: &Path, stages: &[StageSection]) -> Result<(), ConfigError> {
    if !stages.iter().any(|s| s.enabled) {
        return Err(ConfigError::invalid(
            origin,
            "all pipeline stages are disabled; enable at least one stage",
        ));
    }

    let mut producers: HashMap<&str, Vec<&StageSection>> = HashMap::new();
    let mut consumers: HashMap<&str, Vec<&StageSection>> = HashMap::new();
    for stage in stages {
        if let Some(queue) = stage.output() {
            producers.entry(queue).or_default().push(stage);
        }
        if let Some(queue) = stage.input() {
            consumers.entry(queue).or_default().push(stage);
        }
    }

    for stage in stages.iter().filter(|s| s.enabled) {
        if let Some(queue) = stage.input() {
            check_peer(origin, stage, queue, producers.get(queue), "producer", "reads from")?;
        }
        if let Some(queue) = stage.output() {
            check_peer(origin, stage, queue, consumers.get(queue), "consumer", "writes to")?;
        }
    }

    Ok(())
}

fn check_peer(
    origin: &Path,
    stage: &StageSection,
    queue: &str,
    peers: Option<&Vec<&StageSection>>,
    peer_role: &str,
    verb: &str,
) -> Result<(), ConfigError> {
    let peers = peers.map(Vec::as_slice).unwrap_or(&[]);
    let enabled: Vec<&str> = peers.iter().filter(|p| p.enabled).map(|p| p.name.as_str()).collect();

    match enabled.len() {
        1 => Ok(()),
        0 => {
            let message = match peers.first() {
                Some(disabled) => format!(
                    "stage '{}' {} queue '{}' but its {} '{}' is disabled",
                    stage.name, verb, queue, peer_role, disabled.name
                ),
                None => format!(
                    "stage '{}' {} queue '{}' but no stage is its {}",
                    stage.name, verb, queue, peer_role
                ),
            };
            Err(ConfigError::invalid(origin, message))
        }
        _ => Err(ConfigError::invalid(
            origin,
            format!(
                "queue '{}' has more than one enabled {}: {}",
                queue,
                peer_role,
                enabled.join(", ")
            ),
        )),
    }
}
