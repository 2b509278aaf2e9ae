//! Alerting engine
//!
//! Reads a live line stream and, for every line:
//! 1. counts it
//! 2. checks the alert pattern; on a match it builds an [`AlertRecord`],
//!    shows a banner and appends `[YYYY-MM-DD HH:MM:SS] [service] line` to the
//!    alert log when persistence is on
//! 3. classifies it for display and updates the error/warning counters
//!
//! All counters live in a [`MonitorState`] owned by one run. The summary is
//! emitted by a drop guard around the read loop, so it runs exactly once on
//! end of stream, on interruption, and when the watch future is cancelled.

use crate::logs::log_sources::LineSource;
use crate::logs::{LineClass, MonitorOutput, Pattern, PatternSet, SeverityRule};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// One alert raised during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    /// Monotonic within a run, starting at 1
    pub sequence_number: u64,
    /// Alert expression that matched
    pub matched_pattern: String,
    pub timestamp: DateTime<Local>,
    pub service: String,
    pub raw_line: String,
}

impl AlertRecord {
    /// Persisted form: `[YYYY-MM-DD HH:MM:SS] [service] <line>`
    pub fn log_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.service,
            self.raw_line
        )
    }
}

/// Append-only alert log
#[derive(Debug, Clone)]
pub struct AlertLog {
    path: PathBuf,
}

impl AlertLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record with a single write
    pub fn append(&self, record: &AlertRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create alert log directory {}", parent.display())
                })?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open alert log {}", self.path.display()))?;

        let mut line = record.log_line();
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to alert log {}", self.path.display()))
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    EndOfStream,
}

/// Counters for one monitor run
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub total_lines: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub alert_count: u64,
    pub persisted_alerts: u64,
    started_at: Instant,
}

impl MonitorState {
    pub fn new() -> Self {
        Self {
            total_lines: 0,
            error_count: 0,
            warning_count: 0,
            alert_count: 0,
            persisted_alerts: 0,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn summary(&self, service: &str, stop_reason: StopReason) -> MonitorSummary {
        MonitorSummary {
            service: service.to_string(),
            total_lines: self.total_lines,
            duration: self.elapsed(),
            error_count: self.error_count,
            warning_count: self.warning_count,
            alert_count: self.alert_count,
            persisted_alerts: self.persisted_alerts,
            stop_reason,
        }
    }
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Final figures of a monitor run
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSummary {
    pub service: String,
    pub total_lines: u64,
    pub duration: Duration,
    pub error_count: u64,
    pub warning_count: u64,
    pub alert_count: u64,
    pub persisted_alerts: u64,
    pub stop_reason: StopReason,
}

/// Live per-line alerting over a line stream
#[derive(Debug, Clone)]
pub struct AlertEngine {
    service: String,
    alert: Pattern,
    classifier: PatternSet,
    alert_log: Option<AlertLog>,
}

impl AlertEngine {
    /// An invalid alert expression is a configuration error
    pub fn new(service: impl Into<String>, alert_pattern: &str, classifier: PatternSet) -> Result<Self> {
        let alert = Pattern::new("alert", alert_pattern, SeverityRule::Infer, true)?;
        Ok(Self {
            service: service.into(),
            alert,
            classifier,
            alert_log: None,
        })
    }

    /// Persist alerts to this log
    pub fn with_alert_log(mut self, alert_log: AlertLog) -> Self {
        self.alert_log = Some(alert_log);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn alert_pattern(&self) -> &str {
        self.alert.as_str()
    }

    pub fn alert_log(&self) -> Option<&AlertLog> {
        self.alert_log.as_ref()
    }

    /// Process one line against the run state
    pub fn handle_line<O>(
        &self,
        state: &mut MonitorState,
        line: &str,
        output: &mut O,
    ) -> Result<Option<AlertRecord>>
    where
        O: MonitorOutput + ?Sized,
    {
        state.total_lines += 1;

        let record = if self.alert.is_match(line) {
            state.alert_count += 1;
            let record = AlertRecord {
                sequence_number: state.alert_count,
                matched_pattern: self.alert.as_str().to_string(),
                timestamp: Local::now(),
                service: self.service.clone(),
                raw_line: line.to_string(),
            };
            output.alert(&record)?;

            if let Some(log) = &self.alert_log {
                match log.append(&record) {
                    Ok(()) => state.persisted_alerts += 1,
                    Err(e) => error!("Failed to persist alert #{}: {:#}", record.sequence_number, e),
                }
            }
            Some(record)
        } else {
            None
        };

        let matches = self.classifier.classify(line);
        let class = self.classifier.line_class(line, &matches);
        match class {
            LineClass::Error => state.error_count += 1,
            LineClass::Warning => state.warning_count += 1,
            LineClass::Success | LineClass::Info => {}
        }
        output.line(line, class, &matches)?;

        Ok(record)
    }

    /// Watch `source` until it ends or `shutdown` completes
    ///
    /// The summary is written to `output` exactly once, also when this
    /// future is dropped before completion.
    pub async fn watch<S, O, F>(
        &self,
        source: &mut S,
        output: &mut O,
        shutdown: F,
    ) -> Result<MonitorSummary>
    where
        S: LineSource + ?Sized,
        O: MonitorOutput + ?Sized,
        F: Future<Output = ()>,
    {
        let description = self
            .alert_log
            .as_ref()
            .map(|log| format!("alerts -> {}", log.path().display()))
            .unwrap_or_else(|| "alerts not persisted".to_string());
        output.start(&self.service, &description, self.alert.as_str())?;

        let mut guard = SummaryGuard {
            service: &self.service,
            state: MonitorState::new(),
            output,
            emitted: false,
        };

        tokio::pin!(shutdown);
        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break StopReason::Interrupted,
                line = source.next_line() => match line {
                    Some(line) => {
                        self.handle_line(&mut guard.state, &line, &mut *guard.output)?;
                    }
                    None => break StopReason::EndOfStream,
                },
            }
        };

        debug!("Monitor for {} stopped: {:?}", self.service, reason);
        guard.finish(reason)
    }
}

/// Emits the run summary once, on every exit path
struct SummaryGuard<'a, O: MonitorOutput + ?Sized> {
    service: &'a str,
    state: MonitorState,
    output: &'a mut O,
    emitted: bool,
}

impl<O: MonitorOutput + ?Sized> SummaryGuard<'_, O> {
    fn finish(&mut self, reason: StopReason) -> Result<MonitorSummary> {
        self.emitted = true;
        let summary = self.state.summary(self.service, reason);
        self.output.summary(&summary)?;
        Ok(summary)
    }
}

impl<O: MonitorOutput + ?Sized> Drop for SummaryGuard<'_, O> {
    fn drop(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        let summary = self.state.summary(self.service, StopReason::Interrupted);
        if let Err(e) = self.output.summary(&summary) {
            warn!("Failed to write monitor summary: {:#}", e);
        }
    }
}
