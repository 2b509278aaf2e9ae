//! Log telemetry pipeline
//!
//! Raw text lines flow from a [`LogSource`] through the stages below:
//!
//! ```text
//! LogSource -> parse (LogEvent) -> classify (PatternSet) -> aggregate (StatsAggregator)
//!                                                        -> report (render)
//!           -> AlertEngine (live, per line)
//!           -> RotationManager (snapshot + retention)
//! ```
//!
//! This module also holds the configuration schema shared by every stage.

use serde::{Deserialize, Serialize};

pub mod alerting;
pub mod console_output;
pub mod log_parsers;
pub mod log_sources;
pub mod patterns;
pub mod report;
pub mod rotation;
pub mod stats_aggregation;

pub use alerting::{AlertEngine, AlertLog, AlertRecord, MonitorState, MonitorSummary, StopReason};
pub use console_output::{ConsoleMonitorOutput, MonitorOutput};
pub use log_parsers::{
    create_parser, AccessLineParser, AutoParser, HttpMethod, JsonLineParser, LogEvent, LogParser,
};
pub use log_sources::{LineSource, LineStream, LogSource};
pub use patterns::{classify, LineClass, Pattern, PatternMatch, PatternSet, SeverityRule};
pub use report::{render, ReportContext, ReportFormat};
pub use rotation::{
    ArtifactState, BatchReport, CleanupReport, RetentionFile, RotateOptions, RotationManager,
    RotationOutcome,
};
pub use stats_aggregation::{percentile, StatsAggregator, StatsSnapshot};

/// Main pipeline configuration schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Known services and where their log lines come from
    #[serde(default = "default_services")]
    pub services: Vec<ServiceConfig>,
    /// Classification patterns (empty = built-in default set)
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
    /// Alerting engine settings
    #[serde(default)]
    pub alert: AlertConfig,
    /// Snapshot rotation and retention settings
    #[serde(default)]
    pub rotation: RotationConfig,
    /// Statistics defaults
    #[serde(default)]
    pub stats: StatsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            patterns: Vec::new(),
            alert: AlertConfig::default(),
            rotation: RotationConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

/// A logical log-producing service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name, used in alert records and artifact names
    pub name: String,
    /// Where the lines come from
    pub source: SourceConfig,
    /// Line parser
    #[serde(default)]
    pub parser: ParserType,
}

/// Log source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Read a local file
    File { path: String },
    /// Run a command and read its standard output
    Command {
        command: String,
        /// Command used when following live output (defaults to `command`)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        follow_command: Option<String>,
    },
    /// Read this process's standard input
    Stdin,
}

/// Parser selection for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParserType {
    /// JSON objects go to the JSON parser, everything else to the access-line parser
    #[default]
    Auto,
    /// Free-text access lines
    Access,
    /// One JSON object per line
    Json,
}

/// Named classification pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Pattern name reported in matches
    pub name: String,
    /// Regular expression matched against the raw line
    pub regex: String,
    /// Severity assigned on match
    #[serde(default)]
    pub severity: Severity,
    /// Optional presentation colour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorHint>,
    /// Case-sensitive matching (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_sensitive: Option<bool>,
}

/// Pattern severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// Presentation colour for a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorHint {
    Red,
    Yellow,
    Green,
    Blue,
    Magenta,
    Cyan,
}

/// Alerting engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Regex that turns a line into an alert
    #[serde(default = "default_alert_pattern")]
    pub pattern: String,
    /// Append alerts to `log_path`
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Append-only alert log
    #[serde(default = "default_alert_log_path")]
    pub log_path: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            pattern: default_alert_pattern(),
            persist: true,
            log_path: default_alert_log_path(),
        }
    }
}

/// Rotation and retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Directory holding rotation artifacts
    #[serde(default = "default_rotation_dir")]
    pub dir: String,
    /// Maximum number of artifacts kept per service
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Gzip artifacts after writing them
    #[serde(default)]
    pub compress: bool,
    /// Gzip level (1-9, higher = better compression but slower)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            dir: default_rotation_dir(),
            max_files: default_max_files(),
            compress: false,
            compression_level: default_compression_level(),
        }
    }
}

/// Statistics defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Size of ranked tables
    #[serde(default = "default_top")]
    pub top: usize,
    /// Slow-request cutoff in seconds
    #[serde(default = "default_threshold_secs")]
    pub threshold_secs: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            top: default_top(),
            threshold_secs: default_threshold_secs(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_alert_pattern() -> String { "ERROR|CRITICAL|FATAL".to_string() }
fn default_alert_log_path() -> String { "logs/alerts.log".to_string() }
fn default_rotation_dir() -> String { "logs/archive".to_string() }
fn default_max_files() -> usize { 10 }
pub fn default_compression_level() -> u32 { 6 }
fn default_top() -> usize { 10 }
fn default_threshold_secs() -> f64 { 1.0 }

fn default_services() -> Vec<ServiceConfig> {
    ["backend", "db"]
        .iter()
        .map(|name| ServiceConfig {
            name: name.to_string(),
            source: SourceConfig::Command {
                command: format!("docker compose logs --no-color --no-log-prefix {}", name),
                follow_command: Some(format!(
                    "docker compose logs -f --tail 0 --no-color --no-log-prefix {}",
                    name
                )),
            },
            parser: ParserType::Auto,
        })
        .collect()
}
