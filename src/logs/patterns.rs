//! Pattern matching
//!
//! Classification rules are named regular expressions evaluated against the
//! raw line. Every pattern in a set is evaluated; a line can match several
//! of them and all matches are reported in set order.
//!
//! A pattern either carries a fixed severity or infers it from the text it
//! matched (`FATAL` is critical, `ERROR`/`Exception` is an error, a 5xx
//! status is an error, a 4xx status is a warning, and so on). Inference is
//! what custom `--pattern` expressions use.

use crate::error::PipelineError;
use crate::logs::{ColorHint, LogEvent, PatternConfig, Severity};
use anyhow::Result;
use regex::Regex;
use serde::Serialize;

/// Prefix that anchors a status code: after a request line or a `status` key
const STATUS_PREFIX: &str = r#"(?:HTTP/[0-9.]+"\s+|\bstatus(?:_code)?"?\s*[=:]\s*"?)"#;

/// How a pattern decides the severity of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityRule {
    /// Always this severity
    Fixed(Severity),
    /// Derived from the matched text
    Infer,
}

/// A named classification rule
#[derive(Debug, Clone)]
pub struct Pattern {
    name: String,
    regex: Regex,
    severity: SeverityRule,
    color: Option<ColorHint>,
}

impl Pattern {
    /// Compile a pattern; an invalid expression is a configuration error
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        severity: SeverityRule,
        case_sensitive: bool,
    ) -> Result<Self> {
        let regex = if case_sensitive {
            Regex::new(pattern)
        } else {
            Regex::new(&format!("(?i){}", pattern))
        }
        .map_err(|source| PipelineError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            name: name.into(),
            regex,
            severity,
            color: None,
        })
    }

    /// Attach a presentation colour
    pub fn with_color(mut self, color: ColorHint) -> Self {
        self.color = Some(color);
        self
    }

    /// Create from PatternConfig
    pub fn from_config(config: &PatternConfig) -> Result<Self> {
        let pattern = Self::new(
            config.name.clone(),
            &config.regex,
            SeverityRule::Fixed(config.severity),
            config.case_sensitive.unwrap_or(true),
        )?;
        Ok(match config.color {
            Some(color) => pattern.with_color(color),
            None => pattern,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn color(&self) -> Option<ColorHint> {
        self.color
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// Evaluate against a line, returning the match if any
    pub fn find(&self, line: &str) -> Option<PatternMatch> {
        let found = self.regex.find(line)?;
        let severity = match self.severity {
            SeverityRule::Fixed(severity) => severity,
            SeverityRule::Infer => infer_severity(found.as_str()),
        };

        Some(PatternMatch {
            name: self.name.clone(),
            severity,
            color: self.color,
            matched: found.as_str().to_string(),
        })
    }
}

/// One pattern hit on a line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternMatch {
    /// Name of the pattern that matched
    pub name: String,
    /// Severity assigned to this match
    pub severity: Severity,
    /// Presentation colour from the pattern, if configured
    pub color: Option<ColorHint>,
    /// Text the expression matched
    pub matched: String,
}

/// Display classification of a whole line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineClass {
    Error,
    Warning,
    Success,
    Info,
}

/// Ordered set of classification patterns
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
    success: Regex,
}

impl PatternSet {
    /// Build a set from already compiled patterns
    pub fn new(patterns: Vec<Pattern>) -> Result<Self> {
        let success = Regex::new(&format!(
            r"{}2\d{{2}}\b|\b(?:SUCCESS|[Ss]ucceeded)\b",
            STATUS_PREFIX
        ))
        .map_err(|source| PipelineError::InvalidPattern {
            pattern: "success".to_string(),
            source,
        })?;

        Ok(Self { patterns, success })
    }

    /// Built-in classification: level markers, failure markers, 4xx and 5xx
    pub fn default_set() -> Result<Self> {
        let patterns = vec![
            Pattern::new(
                "critical",
                r"\b(?:CRITICAL|FATAL)\b",
                SeverityRule::Fixed(Severity::Critical),
                true,
            )?
            .with_color(ColorHint::Magenta),
            Pattern::new("error", r"\bERROR\b", SeverityRule::Fixed(Severity::Error), true)?
                .with_color(ColorHint::Red),
            Pattern::new(
                "warning",
                r"\bWARN(?:ING)?\b",
                SeverityRule::Fixed(Severity::Warning),
                true,
            )?
            .with_color(ColorHint::Yellow),
            Pattern::new(
                "exception",
                r"Exception|Traceback",
                SeverityRule::Fixed(Severity::Error),
                true,
            )?
            .with_color(ColorHint::Red),
            Pattern::new(
                "http_4xx",
                &format!(r"{}4\d{{2}}\b", STATUS_PREFIX),
                SeverityRule::Fixed(Severity::Warning),
                true,
            )?
            .with_color(ColorHint::Yellow),
            Pattern::new(
                "http_5xx",
                &format!(r"{}5\d{{2}}\b", STATUS_PREFIX),
                SeverityRule::Fixed(Severity::Error),
                true,
            )?
            .with_color(ColorHint::Red),
        ];

        Self::new(patterns)
    }

    /// Build from a named list; an empty list yields the default set
    pub fn from_configs(configs: &[PatternConfig]) -> Result<Self> {
        if configs.is_empty() {
            return Self::default_set();
        }

        let patterns = configs
            .iter()
            .map(Pattern::from_config)
            .collect::<Result<Vec<_>>>()?;
        Self::new(patterns)
    }

    /// A single combined expression whose severity is inferred per match
    pub fn from_combined(pattern: &str) -> Result<Self> {
        Self::new(vec![Pattern::new(
            "custom",
            pattern,
            SeverityRule::Infer,
            true,
        )?])
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Evaluate every pattern, no short-circuit
    pub fn classify(&self, line: &str) -> Vec<PatternMatch> {
        self.patterns
            .iter()
            .filter_map(|pattern| pattern.find(line))
            .collect()
    }

    /// Classify a parsed event by its raw line
    pub fn classify_event(&self, event: &LogEvent) -> Vec<PatternMatch> {
        self.classify(&event.raw_line)
    }

    /// Display class for a line given its matches
    pub fn line_class(&self, line: &str, matches: &[PatternMatch]) -> LineClass {
        match matches.iter().map(|m| m.severity).max() {
            Some(Severity::Critical) | Some(Severity::Error) => LineClass::Error,
            Some(Severity::Warning) => LineClass::Warning,
            _ if self.success.is_match(line) => LineClass::Success,
            _ => LineClass::Info,
        }
    }
}

/// `classify(line, patterns)`: every match of every pattern in the set
pub fn classify(line: &str, patterns: &PatternSet) -> Vec<PatternMatch> {
    patterns.classify(line)
}

/// Severity implied by a keyword or a status code in `text`
pub fn infer_severity(text: &str) -> Severity {
    let upper = text.to_ascii_uppercase();

    if upper.contains("CRITICAL") || upper.contains("FATAL") {
        return Severity::Critical;
    }
    if upper.contains("ERROR") || upper.contains("EXCEPTION") || upper.contains("TRACEBACK") {
        return Severity::Error;
    }
    if upper.contains("WARN") {
        return Severity::Warning;
    }

    match status_digit(text) {
        Some('5') => Severity::Error,
        Some('4') => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Leading digit of the first standalone three-digit number
fn status_digit(text: &str) -> Option<char> {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|token| token.len() == 3)
        .and_then(|token| token.chars().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(matches: &[PatternMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn test_default_set_reports_all_matches() {
        let set = PatternSet::default_set().unwrap();
        let line = r#"ERROR 10.0.0.1 "GET /users HTTP/1.1" 500 Traceback follows"#;
        let matches = set.classify(line);

        assert_eq!(names(&matches), vec!["error", "exception", "http_5xx"]);
        assert!(matches.iter().all(|m| m.severity == Severity::Error));
    }

    #[test]
    fn test_default_set_levels() {
        let set = PatternSet::default_set().unwrap();

        let critical = set.classify("FATAL: out of memory");
        assert_eq!(names(&critical), vec!["critical"]);
        assert_eq!(critical[0].severity, Severity::Critical);

        let warning = set.classify("WARNING: slow query");
        assert_eq!(names(&warning), vec!["warning"]);

        let client = set.classify(r#""POST /users HTTP/1.1" 422"#);
        assert_eq!(names(&client), vec!["http_4xx"]);
        assert_eq!(client[0].severity, Severity::Warning);

        assert!(set.classify("INFO: all good").is_empty());
    }

    #[test]
    fn test_matching_is_case_sensitive_by_default() {
        let set = PatternSet::default_set().unwrap();
        assert!(set.classify("error: lowercase is not a level marker").is_empty());
    }

    #[test]
    fn test_json_status_matches_http_range() {
        let set = PatternSet::default_set().unwrap();
        let matches = set.classify(r#"{"status": "503", "path": "/health"}"#);
        assert_eq!(names(&matches), vec!["http_5xx"]);
    }

    #[test]
    fn test_line_class() {
        let set = PatternSet::default_set().unwrap();

        let line = r#""GET /users HTTP/1.1" 200 OK"#;
        assert_eq!(set.line_class(line, &set.classify(line)), LineClass::Success);

        let line = "WARNING: disk at 85%";
        assert_eq!(set.line_class(line, &set.classify(line)), LineClass::Warning);

        let line = "CRITICAL: replica down";
        assert_eq!(set.line_class(line, &set.classify(line)), LineClass::Error);

        let line = "Application startup complete.";
        assert_eq!(set.line_class(line, &set.classify(line)), LineClass::Info);
    }

    #[test]
    fn test_combined_pattern_infers_severity() {
        let set = PatternSet::from_combined("FATAL|timeout|WARN").unwrap();

        let fatal = set.classify("FATAL: cannot bind");
        assert_eq!(fatal[0].severity, Severity::Critical);
        assert_eq!(fatal[0].name, "custom");

        let warn = set.classify("WARN retrying");
        assert_eq!(warn[0].severity, Severity::Warning);

        let plain = set.classify("upstream timeout");
        assert_eq!(plain[0].severity, Severity::Info);
        assert_eq!(plain[0].matched, "timeout");
    }

    #[test]
    fn test_invalid_regex_is_configuration_error() {
        let err = PatternSet::from_combined("(unclosed").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_from_configs() {
        let configs = vec![
            PatternConfig {
                name: "db".to_string(),
                regex: "connection refused".to_string(),
                severity: Severity::Error,
                color: Some(ColorHint::Cyan),
                case_sensitive: Some(false),
            },
            PatternConfig {
                name: "slow".to_string(),
                regex: r"completed in \d{4,}ms".to_string(),
                severity: Severity::Warning,
                color: None,
                case_sensitive: None,
            },
        ];

        let set = PatternSet::from_configs(&configs).unwrap();
        assert_eq!(set.len(), 2);

        let matches = set.classify("Connection Refused after request completed in 4000ms");
        assert_eq!(names(&matches), vec!["db", "slow"]);
        assert_eq!(matches[0].color, Some(ColorHint::Cyan));

        let defaults = PatternSet::from_configs(&[]).unwrap();
        assert_eq!(defaults.len(), 6);
    }

    #[test]
    fn test_infer_severity() {
        assert_eq!(infer_severity("Traceback"), Severity::Error);
        assert_eq!(infer_severity("status=503"), Severity::Error);
        assert_eq!(infer_severity("\" 404"), Severity::Warning);
        assert_eq!(infer_severity("hello"), Severity::Info);
    }
}
