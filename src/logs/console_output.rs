//! Console output for the live monitor
//!
//! Classified lines, alert banners and the final summary are user-facing
//! output written to stdout (or any injected writer), never tracing events.

use crate::logs::{AlertRecord, ColorHint, LineClass, MonitorSummary, PatternMatch, StopReason};
use anyhow::{Context, Result};
use std::io::{self, Write};

const RESET: &str = "\x1b[0m";
const BOLD_RED: &str = "\x1b[1;31m";
const BANNER_RULE: &str = "========================================================";

/// Destination for monitor events
pub trait MonitorOutput: Send {
    /// Called once before the first line
    fn start(&mut self, service: &str, source: &str, alert_pattern: &str) -> Result<()>;

    /// A classified line
    fn line(&mut self, line: &str, class: LineClass, matches: &[PatternMatch]) -> Result<()>;

    /// An alert was raised for the preceding line
    fn alert(&mut self, record: &AlertRecord) -> Result<()>;

    /// Final summary, emitted exactly once per run
    fn summary(&mut self, summary: &MonitorSummary) -> Result<()>;
}

/// Monitor output with ANSI colouring
pub struct ConsoleMonitorOutput {
    writer: Box<dyn Write + Send>,
    color: bool,
    quiet: bool,
}

impl ConsoleMonitorOutput {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            color: true,
            quiet: false,
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Enable or disable ANSI colours
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Only print banners and the summary
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if self.color && !code.is_empty() {
            format!("{}{}{}", code, text, RESET)
        } else {
            text.to_string()
        }
    }

    /// Line coloured by its strongest match, or by its class
    pub fn format_line(&self, line: &str, class: LineClass, matches: &[PatternMatch]) -> String {
        let hinted = matches
            .iter()
            .max_by_key(|m| m.severity)
            .and_then(|m| m.color);

        let code = match (hinted, class) {
            (Some(hint), _) => color_code(hint),
            (None, LineClass::Error) => color_code(ColorHint::Red),
            (None, LineClass::Warning) => color_code(ColorHint::Yellow),
            (None, LineClass::Success) => color_code(ColorHint::Green),
            (None, LineClass::Info) => "",
        };
        self.paint(line, code)
    }

    pub fn format_banner(&self, record: &AlertRecord) -> String {
        let body = format!(
            "{rule}\n ALERT #{seq} [{service}] matched '{pattern}' at {ts}\n {line}\n{rule}",
            rule = BANNER_RULE,
            seq = record.sequence_number,
            service = record.service,
            pattern = record.matched_pattern,
            ts = record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            line = record.raw_line,
        );
        self.paint(&body, BOLD_RED)
    }

    pub fn format_summary(&self, summary: &MonitorSummary) -> String {
        let reason = match summary.stop_reason {
            StopReason::Interrupted => "interrupted",
            StopReason::EndOfStream => "end of stream",
        };

        format!(
            "\n--- Monitor summary for {} ({}) ---\n\
             Total lines:      {}\n\
             Duration:         {:.1}s\n\
             Errors:           {}\n\
             Warnings:         {}\n\
             Alerts:           {}\n\
             Persisted alerts: {}",
            summary.service,
            reason,
            summary.total_lines,
            summary.duration.as_secs_f64(),
            summary.error_count,
            summary.warning_count,
            summary.alert_count,
            summary.persisted_alerts,
        )
    }

    fn write_line(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(text.as_bytes())
            .context("Failed to write to console")?;
        self.writer
            .write_all(b"\n")
            .context("Failed to write newline to console")?;
        self.writer
            .flush()
            .context("Failed to flush console output")
    }
}

impl MonitorOutput for ConsoleMonitorOutput {
    fn start(&mut self, service: &str, source: &str, alert_pattern: &str) -> Result<()> {
        if self.quiet {
            return Ok(());
        }
        let header = format!(
            "Monitoring {} ({}), alerting on '{}'. Press Ctrl+C to stop.",
            service, source, alert_pattern
        );
        self.write_line(&header)
    }

    fn line(&mut self, line: &str, class: LineClass, matches: &[PatternMatch]) -> Result<()> {
        if self.quiet {
            return Ok(());
        }
        let formatted = self.format_line(line, class, matches);
        self.write_line(&formatted)
    }

    fn alert(&mut self, record: &AlertRecord) -> Result<()> {
        let banner = self.format_banner(record);
        self.write_line(&banner)
    }

    fn summary(&mut self, summary: &MonitorSummary) -> Result<()> {
        let text = self.format_summary(summary);
        self.write_line(&text)
    }
}

fn color_code(hint: ColorHint) -> &'static str {
    match hint {
        ColorHint::Red => "\x1b[31m",
        ColorHint::Green => "\x1b[32m",
        ColorHint::Yellow => "\x1b[33m",
        ColorHint::Blue => "\x1b[34m",
        ColorHint::Magenta => "\x1b[35m",
        ColorHint::Cyan => "\x1b[36m",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::Severity;
    use chrono::{Local, TimeZone};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn record() -> AlertRecord {
        AlertRecord {
            sequence_number: 1,
            matched_pattern: "ERROR".to_string(),
            timestamp: Local.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            service: "backend".to_string(),
            raw_line: "ERROR: disk full".to_string(),
        }
    }

    fn summary() -> MonitorSummary {
        MonitorSummary {
            service: "backend".to_string(),
            total_lines: 12,
            duration: Duration::from_millis(2500),
            error_count: 3,
            warning_count: 2,
            alert_count: 1,
            persisted_alerts: 1,
            stop_reason: StopReason::Interrupted,
        }
    }

    #[test]
    fn test_line_colours_by_class() {
        let output = ConsoleMonitorOutput::new(Box::new(io::sink()));

        assert_eq!(
            output.format_line("boom", LineClass::Error, &[]),
            "\x1b[31mboom\x1b[0m"
        );
        assert_eq!(
            output.format_line("ok", LineClass::Success, &[]),
            "\x1b[32mok\x1b[0m"
        );
        assert_eq!(output.format_line("plain", LineClass::Info, &[]), "plain");
    }

    #[test]
    fn test_pattern_colour_wins() {
        let output = ConsoleMonitorOutput::new(Box::new(io::sink()));
        let matches = vec![
            PatternMatch {
                name: "error".to_string(),
                severity: Severity::Error,
                color: Some(ColorHint::Red),
                matched: "ERROR".to_string(),
            },
            PatternMatch {
                name: "critical".to_string(),
                severity: Severity::Critical,
                color: Some(ColorHint::Magenta),
                matched: "FATAL".to_string(),
            },
        ];

        assert_eq!(
            output.format_line("FATAL ERROR", LineClass::Error, &matches),
            "\x1b[35mFATAL ERROR\x1b[0m"
        );
    }

    #[test]
    fn test_no_color() {
        let output = ConsoleMonitorOutput::new(Box::new(io::sink())).with_color(false);
        assert_eq!(output.format_line("boom", LineClass::Error, &[]), "boom");
        assert!(!output.format_banner(&record()).contains('\x1b'));
    }

    #[test]
    fn test_banner_contents() {
        let output = ConsoleMonitorOutput::new(Box::new(io::sink()));
        let banner = output.format_banner(&record());

        assert!(banner.starts_with(BOLD_RED));
        assert!(banner.contains("ALERT #1 [backend] matched 'ERROR' at 2024-01-01 10:00:00"));
        assert!(banner.contains("ERROR: disk full"));
    }

    #[test]
    fn test_summary_text() {
        let output = ConsoleMonitorOutput::new(Box::new(io::sink()));
        let text = output.format_summary(&summary());

        assert!(text.contains("backend (interrupted)"));
        assert!(text.contains("Total lines:      12"));
        assert!(text.contains("Duration:         2.5s"));
        assert!(text.contains("Alerts:           1"));
    }

    #[test]
    fn test_quiet_prints_only_banners_and_summary() {
        let buffer = SharedBuffer::default();
        let mut output = ConsoleMonitorOutput::new(Box::new(buffer.clone()))
            .with_color(false)
            .with_quiet(true);

        output.start("backend", "stdin", "ERROR").unwrap();
        output.line("INFO: routine", LineClass::Info, &[]).unwrap();
        output.alert(&record()).unwrap();
        output.summary(&summary()).unwrap();

        let text = buffer.contents();
        assert!(!text.contains("routine"));
        assert!(!text.contains("Monitoring"));
        assert!(text.contains("ALERT #1"));
        assert!(text.contains("Monitor summary"));
    }
}
