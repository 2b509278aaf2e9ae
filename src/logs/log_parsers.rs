//! Log parsers
//!
//! This module turns raw log lines into structured [`LogEvent`]s. Input comes
//! from loosely structured sources, so extraction is field-independent: each
//! field has its own extractor that either finds its value or returns `None`,
//! and the parser composes whatever was found. Parsing never fails; a line
//! with no recognizable fields is still returned with its `raw_line`.
//!
//! Recognized conventions:
//! - an ISO-8601 timestamp (`2024-01-01T10:00:00`, `2024-01-01 10:00:00,123`, `...Z`, `...+03:00`)
//! - a quoted request line (`"GET /users/42 HTTP/1.1"`) followed by the status code
//! - a dotted-quad client address (`172.18.0.1:54321`)
//! - a `completed in <N>ms` marker
//!
//! # Examples
//!
//! ```rust
//! use logwarden::logs::log_parsers::{AccessLineParser, LogParser};
//!
//! let parser = AccessLineParser::new().unwrap();
//! let event = parser.parse(r#"2024-01-01T10:00:00 INFO 10.0.0.7 "GET /users HTTP/1.1" 200 completed in 50ms"#);
//! assert_eq!(event.status_code, Some(200));
//! assert_eq!(event.response_time_ms, Some(50));
//! ```

use crate::logs::ParserType;
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    #[default]
    Unknown,
}

impl HttpMethod {
    /// Map a method token to a known method, anything else is `Unknown`
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "PATCH" => HttpMethod::Patch,
            _ => HttpMethod::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed log line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Parsed timestamp (if available)
    pub timestamp: Option<DateTime<Utc>>,
    /// Request method, `Unknown` when no request line was found
    pub http_method: HttpMethod,
    /// Request path, verbatim
    pub endpoint: Option<String>,
    /// HTTP status code (100-599)
    pub status_code: Option<u16>,
    /// Response time in milliseconds
    pub response_time_ms: Option<u64>,
    /// Dotted-quad client address
    pub client_ip: Option<String>,
    /// Original line, always retained
    pub raw_line: String,
}

impl LogEvent {
    /// Create an event with no derived fields
    pub fn new(raw_line: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            http_method: HttpMethod::Unknown,
            endpoint: None,
            status_code: None,
            response_time_ms: None,
            client_ip: None,
            raw_line: raw_line.into(),
        }
    }

    /// An event counts as a request once it carries a status code
    pub fn is_request(&self) -> bool {
        self.status_code.is_some()
    }

    /// Status code 400 or above
    pub fn is_error(&self) -> bool {
        matches!(self.status_code, Some(code) if code >= 400)
    }

    /// True when no typed field could be extracted
    pub fn is_unparsed(&self) -> bool {
        self.timestamp.is_none()
            && self.http_method == HttpMethod::Unknown
            && self.endpoint.is_none()
            && self.status_code.is_none()
            && self.response_time_ms.is_none()
            && self.client_ip.is_none()
    }
}

/// Trait for log parsers
pub trait LogParser: Send + Sync {
    /// Parse a log line; never fails
    fn parse(&self, line: &str) -> LogEvent;

    /// Get the parser type
    fn parser_type(&self) -> ParserType;
}

/// Independent per-field extractors
#[derive(Debug, Clone)]
pub struct FieldExtractors {
    timestamp: Regex,
    request_line: Regex,
    status_field: Regex,
    client_ip: Regex,
    response_time: Regex,
}

impl FieldExtractors {
    /// Compile the extractor patterns
    pub fn new() -> Result<Self> {
        Ok(Self {
            timestamp: compile(
                r"(?P<date>\d{4}-\d{2}-\d{2})[T ](?P<time>\d{2}:\d{2}:\d{2})(?:[.,](?P<frac>\d{1,9}))?(?P<offset>Z|[+-]\d{2}:?\d{2})?",
            )?,
            request_line: compile(
                r#""(?P<method>[A-Z]+) (?P<path>[^\s"]+) HTTP/[0-9.]+"(?:\s+(?P<status>\d{3})\b)?"#,
            )?,
            status_field: compile(r"\bstatus(?:_code)?[=:]\s*(?P<status>\d{3})\b")?,
            client_ip: compile(r"\b(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})\b")?,
            response_time: compile(r"completed in (?P<ms>\d+)(?:\.\d+)?\s*ms")?,
        })
    }

    /// Method and path from a quoted request line
    pub fn request(&self, line: &str) -> Option<(HttpMethod, String)> {
        let caps = self.request_line.captures(line)?;
        Some((
            HttpMethod::from_token(&caps["method"]),
            caps["path"].to_string(),
        ))
    }

    /// Status code following the request line, or a `status=NNN` field
    pub fn status_code(&self, line: &str) -> Option<u16> {
        let trailing = self
            .request_line
            .captures(line)
            .and_then(|caps| caps.name("status").map(|m| m.as_str().to_string()));

        let raw = match trailing {
            Some(status) => status,
            None => self.status_field.captures(line)?["status"].to_string(),
        };

        raw.parse::<u16>()
            .ok()
            .filter(|code| (100..=599).contains(code))
    }

    /// First ISO-8601 timestamp in the line; offset-less times are taken as UTC
    pub fn timestamp(&self, line: &str) -> Option<DateTime<Utc>> {
        let caps = self.timestamp.captures(line)?;
        let naive = NaiveDateTime::parse_from_str(
            &format!("{} {}", &caps["date"], &caps["time"]),
            "%Y-%m-%d %H:%M:%S",
        )
        .ok()?;

        let naive = match caps.name("frac") {
            Some(frac) => {
                let nanos: u32 = format!("{:0<9}", frac.as_str()).parse().ok()?;
                naive.with_nanosecond(nanos)?
            }
            None => naive,
        };

        match caps.name("offset").map(|m| m.as_str()) {
            None | Some("Z") => Some(Utc.from_utc_datetime(&naive)),
            Some(offset) => parse_offset(offset)?
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    /// First valid dotted-quad address
    pub fn client_ip(&self, line: &str) -> Option<String> {
        self.client_ip.captures_iter(line).find_map(|caps| {
            let valid = (1..=4).all(|i| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse::<u16>().ok())
                    .map(|octet| octet <= 255)
                    .unwrap_or(false)
            });
            valid.then(|| caps[0].to_string())
        })
    }

    /// Milliseconds from a `completed in <N>ms` marker
    pub fn response_time_ms(&self, line: &str) -> Option<u64> {
        self.response_time.captures(line)?["ms"].parse().ok()
    }

    /// Run every extractor and compose the event
    pub fn extract(&self, line: &str) -> LogEvent {
        let mut event = LogEvent::new(line);
        self.fill_missing(&mut event, line);
        event
    }

    /// Fill only the fields that are still absent, reading from `text`
    fn fill_missing(&self, event: &mut LogEvent, text: &str) {
        if event.timestamp.is_none() {
            event.timestamp = self.timestamp(text);
        }
        if event.endpoint.is_none() {
            if let Some((method, path)) = self.request(text) {
                event.http_method = method;
                event.endpoint = Some(path);
            }
        }
        if event.status_code.is_none() {
            event.status_code = self.status_code(text);
        }
        if event.client_ip.is_none() {
            event.client_ip = self.client_ip(text);
        }
        if event.response_time_ms.is_none() {
            event.response_time_ms = self.response_time_ms(text);
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("Failed to compile extractor regex: {}", pattern))
}

fn parse_offset(offset: &str) -> Option<FixedOffset> {
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let digits: String = offset.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 4 {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Free-text access line parser
#[derive(Debug, Clone)]
pub struct AccessLineParser {
    extractors: FieldExtractors,
}

impl AccessLineParser {
    /// Create a new access line parser
    pub fn new() -> Result<Self> {
        Ok(Self {
            extractors: FieldExtractors::new()?,
        })
    }
}

impl LogParser for AccessLineParser {
    fn parse(&self, line: &str) -> LogEvent {
        self.extractors.extract(line)
    }

    fn parser_type(&self) -> ParserType {
        ParserType::Access
    }
}

/// JSON-per-line parser
///
/// Reads well-known keys from the object and falls back to the text
/// extractors, first on the `message` field and then on the whole line.
#[derive(Debug, Clone)]
pub struct JsonLineParser {
    extractors: FieldExtractors,
}

impl JsonLineParser {
    /// Create a new JSON line parser
    pub fn new() -> Result<Self> {
        Ok(Self {
            extractors: FieldExtractors::new()?,
        })
    }

    fn from_object(&self, line: &str, map: &serde_json::Map<String, Value>) -> LogEvent {
        let mut event = LogEvent::new(line);

        event.timestamp = first_str(map, &["timestamp", "time", "@timestamp", "ts"]).and_then(
            |ts| match DateTime::parse_from_rfc3339(ts) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(_) => self.extractors.timestamp(ts),
            },
        );

        if let Some(method) = first_str(map, &["method", "http_method"]) {
            event.http_method = HttpMethod::from_token(method);
        }
        event.endpoint =
            first_str(map, &["path", "uri", "endpoint", "url"]).map(str::to_string);
        event.status_code = first_u64(map, &["status", "status_code"])
            .and_then(|code| u16::try_from(code).ok())
            .filter(|code| (100..=599).contains(code));
        event.response_time_ms = first_u64(
            map,
            &["duration_ms", "latency_ms", "response_time_ms", "elapsed_ms"],
        );
        event.client_ip = first_str(map, &["client_ip", "remote_addr", "client", "ip"])
            .and_then(|addr| self.extractors.client_ip(addr));

        if let Some(message) = first_str(map, &["message", "msg"]) {
            self.extractors.fill_missing(&mut event, message);
        }

        event
    }
}

impl LogParser for JsonLineParser {
    fn parse(&self, line: &str) -> LogEvent {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => self.from_object(line, &map),
            // Not a JSON object, keep whatever the text extractors find
            _ => self.extractors.extract(line),
        }
    }

    fn parser_type(&self) -> ParserType {
        ParserType::Json
    }
}

/// Picks the JSON parser for lines that look like objects
#[derive(Debug, Clone)]
pub struct AutoParser {
    access: AccessLineParser,
    json: JsonLineParser,
}

impl AutoParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            access: AccessLineParser::new()?,
            json: JsonLineParser::new()?,
        })
    }
}

impl LogParser for AutoParser {
    fn parse(&self, line: &str) -> LogEvent {
        if line.trim_start().starts_with('{') {
            self.json.parse(line)
        } else {
            self.access.parse(line)
        }
    }

    fn parser_type(&self) -> ParserType {
        ParserType::Auto
    }
}

fn first_str<'a>(map: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| map.get(*key).and_then(Value::as_str))
}

fn first_u64(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}

/// Create a parser instance based on configuration
pub fn create_parser(parser_type: ParserType) -> Result<Box<dyn LogParser>> {
    match parser_type {
        ParserType::Auto => Ok(Box::new(AutoParser::new()?)),
        ParserType::Access => Ok(Box::new(AccessLineParser::new()?)),
        ParserType::Json => Ok(Box::new(JsonLineParser::new()?)),
    }
}
