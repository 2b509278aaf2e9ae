//! Statistics aggregation over access events
//!
//! [`StatsAggregator::ingest`] folds one [`LogEvent`] into running state and
//! [`StatsAggregator::snapshot`] produces a [`StatsSnapshot`] at any point.
//!
//! Percentiles use the nearest-rank method: with `N` samples sorted
//! ascending and fraction `p`, the 1-based rank is `floor(N * p)` clamped to
//! `[1, N]`. No interpolation. Ranked tables sort by count descending and
//! keep first-seen order between equal counts.

use crate::logs::{HttpMethod, LogEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Absorbs binary rounding in `N * p` (e.g. `100 * 0.29`)
const RANK_EPSILON: f64 = 1e-9;

/// 1-based nearest-rank index for `n` samples, `None` when there are no samples
pub fn percentile_index(n: usize, p: f64) -> Option<usize> {
    if n == 0 {
        return None;
    }
    // `as usize` saturates: negative and NaN products become 0 and clamp to 1
    let rank = (n as f64 * p + RANK_EPSILON).floor() as usize;
    Some(rank.clamp(1, n))
}

/// Nearest-rank percentile of ascending `sorted` samples
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    percentile_index(sorted.len(), p).map(|rank| sorted[rank - 1])
}

/// Error rate in percent, `0` when there were no requests
pub fn error_rate(total_errors: u64, total_requests: u64) -> f64 {
    if total_requests == 0 {
        return 0.0;
    }
    (total_errors as f64 / total_requests as f64 * 100.0).clamp(0.0, 100.0)
}

/// One row of a ranked table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedEntry {
    pub key: String,
    pub count: u64,
}

/// Frequency table that remembers first-seen order
#[derive(Debug, Clone, Default)]
pub struct FrequencyTable {
    index: HashMap<String, usize>,
    entries: Vec<(String, u64)>,
}

impl FrequencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: &str) {
        match self.index.get(key) {
            Some(&i) => self.entries[i].1 += 1,
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push((key.to_string(), 1));
            }
        }
    }

    pub fn count(&self, key: &str) -> u64 {
        self.index.get(key).map(|&i| self.entries[i].1).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top `n` keys by count; ties keep first-seen order
    pub fn top(&self, n: usize) -> Vec<RankedEntry> {
        let mut ranked: Vec<&(String, u64)> = self.entries.iter().collect();
        // sort_by is stable, entries are already in first-seen order
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
            .into_iter()
            .take(n)
            .map(|(key, count)| RankedEntry {
                key: key.clone(),
                count: *count,
            })
            .collect()
    }
}

/// A request at or above the slow threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowRequest {
    pub http_method: HttpMethod,
    pub endpoint: Option<String>,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Aggregation settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorOptions {
    /// Size of ranked tables
    pub top_n: usize,
    /// Requests at or above this many milliseconds are slow
    pub slow_threshold_ms: Option<u64>,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            top_n: 10,
            slow_threshold_ms: None,
        }
    }
}

/// Error-rate tier used by reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTier {
    /// Error rate up to 5%
    Nominal,
    /// Above 5% up to 10%
    Elevated,
    /// Above 10%
    Critical,
}

impl HealthTier {
    pub fn from_error_rate(rate: f64) -> Self {
        if rate <= 5.0 {
            HealthTier::Nominal
        } else if rate <= 10.0 {
            HealthTier::Elevated
        } else {
            HealthTier::Critical
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HealthTier::Nominal => "NOMINAL",
            HealthTier::Elevated => "ELEVATED",
            HealthTier::Critical => "CRITICAL",
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            HealthTier::Nominal => "Error rate is within normal limits.",
            HealthTier::Elevated => "Error rate is elevated; review recent 4xx/5xx responses.",
            HealthTier::Critical => "Error rate is critical; investigate failing endpoints now.",
        }
    }
}

/// Running statistics over a sequence of events
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    options: AggregatorOptions,
    total_lines: u64,
    unparsed_lines: u64,
    total_requests: u64,
    total_errors: u64,
    status_codes: BTreeMap<u16, u64>,
    methods: FrequencyTable,
    endpoints: FrequencyTable,
    client_ips: FrequencyTable,
    response_times: Vec<u64>,
    slow_requests: Vec<SlowRequest>,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl StatsAggregator {
    pub fn new(options: AggregatorOptions) -> Self {
        Self {
            options,
            total_lines: 0,
            unparsed_lines: 0,
            total_requests: 0,
            total_errors: 0,
            status_codes: BTreeMap::new(),
            methods: FrequencyTable::new(),
            endpoints: FrequencyTable::new(),
            client_ips: FrequencyTable::new(),
            response_times: Vec::new(),
            slow_requests: Vec::new(),
            first_timestamp: None,
            last_timestamp: None,
        }
    }

    /// Fold one event into the running state
    pub fn ingest(&mut self, event: &LogEvent) {
        self.total_lines += 1;

        if event.is_unparsed() {
            self.unparsed_lines += 1;
            return;
        }

        if let Some(ts) = event.timestamp {
            if self.first_timestamp.is_none() {
                self.first_timestamp = Some(ts);
            }
            self.last_timestamp = Some(ts);
        }

        if let Some(code) = event.status_code {
            self.total_requests += 1;
            if event.is_error() {
                self.total_errors += 1;
            }
            *self.status_codes.entry(code).or_insert(0) += 1;
        }

        if event.endpoint.is_some() {
            self.methods.record(event.http_method.as_str());
        }
        if let Some(endpoint) = &event.endpoint {
            self.endpoints.record(endpoint);
        }
        if let Some(ip) = &event.client_ip {
            self.client_ips.record(ip);
        }

        if let Some(ms) = event.response_time_ms {
            self.response_times.push(ms);

            if matches!(self.options.slow_threshold_ms, Some(threshold) if ms >= threshold) {
                self.slow_requests.push(SlowRequest {
                    http_method: event.http_method,
                    endpoint: event.endpoint.clone(),
                    status_code: event.status_code,
                    response_time_ms: ms,
                    timestamp: event.timestamp,
                });
            }
        }
    }

    /// Fold a sequence of events
    pub fn ingest_all<'a>(&mut self, events: impl IntoIterator<Item = &'a LogEvent>) {
        for event in events {
            self.ingest(event);
        }
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// Produce a snapshot of the current state
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut samples = self.response_times.clone();
        samples.sort_unstable();

        let mut slowest = self.slow_requests.clone();
        slowest.sort_by(|a, b| b.response_time_ms.cmp(&a.response_time_ms));
        slowest.truncate(self.options.top_n);

        StatsSnapshot {
            total_lines: self.total_lines,
            unparsed_lines: self.unparsed_lines,
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            status_code_counts: self.status_codes.clone(),
            method_counts: self.methods.top(self.methods.len()),
            top_endpoints: self.endpoints.top(self.options.top_n),
            top_client_ips: self.client_ips.top(self.options.top_n),
            unique_endpoints: self.endpoints.len(),
            unique_client_ips: self.client_ips.len(),
            response_time_samples: samples,
            slow_threshold_ms: self.options.slow_threshold_ms,
            slow_request_count: self.slow_requests.len() as u64,
            slow_requests: slowest,
            first_timestamp: self.first_timestamp,
            last_timestamp: self.last_timestamp,
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(AggregatorOptions::default())
    }
}

/// Aggregate view over a bounded set of events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_lines: u64,
    /// Lines with no extractable field
    pub unparsed_lines: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub status_code_counts: BTreeMap<u16, u64>,
    pub method_counts: Vec<RankedEntry>,
    pub top_endpoints: Vec<RankedEntry>,
    pub top_client_ips: Vec<RankedEntry>,
    pub unique_endpoints: usize,
    pub unique_client_ips: usize,
    /// Ascending
    pub response_time_samples: Vec<u64>,
    pub slow_threshold_ms: Option<u64>,
    pub slow_request_count: u64,
    /// Slowest first
    pub slow_requests: Vec<SlowRequest>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// No lines were seen at all
    pub fn is_empty(&self) -> bool {
        self.total_lines == 0
    }

    pub fn error_rate(&self) -> f64 {
        error_rate(self.total_errors, self.total_requests)
    }

    pub fn health(&self) -> HealthTier {
        HealthTier::from_error_rate(self.error_rate())
    }

    pub fn percentile(&self, p: f64) -> Option<u64> {
        percentile(&self.response_time_samples, p)
    }

    pub fn min_response_ms(&self) -> Option<u64> {
        self.response_time_samples.first().copied()
    }

    pub fn max_response_ms(&self) -> Option<u64> {
        self.response_time_samples.last().copied()
    }

    pub fn mean_response_ms(&self) -> Option<f64> {
        if self.response_time_samples.is_empty() {
            return None;
        }
        let sum: u128 = self
            .response_time_samples
            .iter()
            .map(|&ms| u128::from(ms))
            .sum();
        Some(sum as f64 / self.response_time_samples.len() as f64)
    }

    /// Count of responses in a status class (2 for 2xx, 4 for 4xx, ...)
    pub fn status_class_count(&self, class: u16) -> u64 {
        self.status_code_counts
            .iter()
            .filter(|(code, _)| **code / 100 == class)
            .map(|(_, count)| *count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::log_parsers::{AccessLineParser, LogParser};

    fn parse_all(lines: &[&str]) -> Vec<LogEvent> {
        let parser = AccessLineParser::new().unwrap();
        lines.iter().map(|line| parser.parse(line)).collect()
    }

    fn request(ip: &str, method: &str, path: &str, status: u16, ms: u64) -> String {
        format!(
            r#"2024-01-01T10:00:00 {} "{} {} HTTP/1.1" {} completed in {}ms"#,
            ip, method, path, status, ms
        )
    }

    #[test]
    fn test_two_line_status_and_error_rate() {
        let events = parse_all(&[
            r#"2024-01-01T10:00:00 INFO "GET /users HTTP/1.1" 200 OK completed in 50ms"#,
            r#"2024-01-01T10:00:05 ERROR "GET /users HTTP/1.1" 500 Internal completed in 4000ms"#,
        ]);

        let mut agg = StatsAggregator::default();
        agg.ingest_all(&events);
        let snap = agg.snapshot();

        assert_eq!(snap.total_lines, 2);
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.status_code_counts.get(&200), Some(&1));
        assert_eq!(snap.status_code_counts.get(&500), Some(&1));
        assert_eq!(snap.status_code_counts.len(), 2);
        assert_eq!(snap.error_rate(), 50.0);
        assert_eq!(snap.response_time_samples, vec![50, 4000]);
        assert!(snap.first_timestamp < snap.last_timestamp);
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let samples: Vec<u64> = (1..=10).map(|i| i * 10).collect();

        assert_eq!(percentile_index(10, 0.50), Some(5));
        assert_eq!(percentile(&samples, 0.50), Some(50));
        assert_eq!(percentile_index(10, 0.95), Some(9));
        assert_eq!(percentile(&samples, 0.95), Some(90));
        assert_eq!(percentile(&samples, 0.99), Some(90));
    }

    #[test]
    fn test_percentile_bounds() {
        for n in 1..=50usize {
            let samples: Vec<u64> = (0..n as u64).map(|i| i * 3 + 7).collect();
            for p in [0.0, 0.01, 0.25, 0.5, 0.9, 0.95, 0.99, 1.0] {
                let rank = percentile_index(n, p).unwrap();
                assert!((1..=n).contains(&rank), "rank {} out of range for n={}", rank, n);
            }
            assert_eq!(percentile(&samples, 1.0), samples.last().copied());
            assert_eq!(percentile(&samples, 0.0), samples.first().copied());
        }
    }

    #[test]
    fn test_small_sample_rank_clamped_to_one() {
        // floor(3 * 0.1) = 0 before clamping
        assert_eq!(percentile_index(3, 0.1), Some(1));
        assert_eq!(percentile(&[7, 8, 9], 0.1), Some(7));
        assert_eq!(percentile(&[42], 0.5), Some(42));
    }

    #[test]
    fn test_rank_survives_float_rounding() {
        // 100 * 0.29 is 28.999999999999996 in f64
        assert_eq!(percentile_index(100, 0.29), Some(29));
    }

    #[test]
    fn test_percentile_of_empty_is_none() {
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile_index(0, 0.5), None);
    }

    #[test]
    fn test_error_rate_bounds() {
        assert_eq!(error_rate(0, 0), 0.0);
        assert_eq!(error_rate(3, 0), 0.0);
        assert_eq!(error_rate(1, 4), 25.0);
        assert_eq!(error_rate(4, 4), 100.0);
    }

    #[test]
    fn test_empty_input_snapshot() {
        let snap = StatsAggregator::default().snapshot();

        assert!(snap.is_empty());
        assert_eq!(snap.total_lines, 0);
        assert_eq!(snap.total_requests, 0);
        assert!(snap.status_code_counts.is_empty());
        assert!(snap.top_endpoints.is_empty());
        assert_eq!(snap.error_rate(), 0.0);
        assert_eq!(snap.percentile(0.95), None);
        assert_eq!(snap.health(), HealthTier::Nominal);
    }

    #[test]
    fn test_unparsed_lines_counted_but_excluded() {
        let events = parse_all(&["garbage", "more garbage", &request("10.0.0.1", "GET", "/a", 200, 5)]);
        let mut agg = StatsAggregator::default();
        agg.ingest_all(&events);
        let snap = agg.snapshot();

        assert_eq!(snap.total_lines, 3);
        assert_eq!(snap.unparsed_lines, 2);
        assert_eq!(snap.total_requests, 1);
    }

    #[test]
    fn test_top_n_ties_keep_first_seen_order() {
        let lines = vec![
            request("10.0.0.3", "GET", "/c", 200, 1),
            request("10.0.0.1", "GET", "/a", 200, 1),
            request("10.0.0.2", "GET", "/b", 200, 1),
            request("10.0.0.1", "GET", "/a", 200, 1),
            request("10.0.0.2", "POST", "/b", 201, 1),
            request("10.0.0.3", "GET", "/c", 200, 1),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let events = parse_all(&refs);

        let mut agg = StatsAggregator::new(AggregatorOptions {
            top_n: 2,
            slow_threshold_ms: None,
        });
        agg.ingest_all(&events);
        let snap = agg.snapshot();

        let keys: Vec<&str> = snap.top_endpoints.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["/c", "/a"]);
        let ips: Vec<&str> = snap.top_client_ips.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.1"]);
        assert_eq!(snap.unique_client_ips, 3);
        assert_eq!(snap.method_counts[0].key, "GET");
        assert_eq!(snap.method_counts[0].count, 5);
    }

    #[test]
    fn test_rankings_stable_across_runs() {
        let lines: Vec<String> = (0..40)
            .map(|i| request(&format!("10.0.{}.1", i % 7), "GET", &format!("/r{}", i % 5), 200, i))
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let events = parse_all(&refs);

        let mut first = StatsAggregator::default();
        first.ingest_all(&events);
        let mut second = StatsAggregator::default();
        second.ingest_all(&events);

        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn test_slow_requests() {
        let lines = vec![
            request("10.0.0.1", "GET", "/fast", 200, 20),
            request("10.0.0.1", "GET", "/slow", 200, 1500),
            request("10.0.0.1", "POST", "/slower", 500, 3000),
            request("10.0.0.1", "GET", "/edge", 200, 1000),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let events = parse_all(&refs);

        let mut agg = StatsAggregator::new(AggregatorOptions {
            top_n: 2,
            slow_threshold_ms: Some(1000),
        });
        agg.ingest_all(&events);
        let snap = agg.snapshot();

        assert_eq!(snap.slow_request_count, 3);
        assert_eq!(snap.slow_requests.len(), 2);
        assert_eq!(snap.slow_requests[0].endpoint.as_deref(), Some("/slower"));
        assert_eq!(snap.slow_requests[0].response_time_ms, 3000);
        assert_eq!(snap.slow_requests[1].endpoint.as_deref(), Some("/slow"));
    }

    #[test]
    fn test_health_tiers() {
        assert_eq!(HealthTier::from_error_rate(0.0), HealthTier::Nominal);
        assert_eq!(HealthTier::from_error_rate(5.0), HealthTier::Nominal);
        assert_eq!(HealthTier::from_error_rate(7.5), HealthTier::Elevated);
        assert_eq!(HealthTier::from_error_rate(10.0), HealthTier::Elevated);
        assert_eq!(HealthTier::from_error_rate(10.1), HealthTier::Critical);
    }

    #[test]
    fn test_response_time_summary() {
        let lines = vec![
            request("10.0.0.1", "GET", "/a", 200, 30),
            request("10.0.0.1", "GET", "/a", 404, 10),
            request("10.0.0.1", "GET", "/a", 200, 20),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut agg = StatsAggregator::default();
        agg.ingest_all(&parse_all(&refs));
        let snap = agg.snapshot();

        assert_eq!(snap.min_response_ms(), Some(10));
        assert_eq!(snap.max_response_ms(), Some(30));
        assert_eq!(snap.mean_response_ms(), Some(20.0));
        assert_eq!(snap.status_class_count(2), 2);
        assert_eq!(snap.status_class_count(4), 1);
        assert_eq!(snap.total_errors, 1);
    }

    #[test]
    fn test_mean_of_huge_response_times_does_not_overflow() {
        let lines = vec![
            request("10.0.0.1", "GET", "/a", 200, u64::MAX),
            request("10.0.0.2", "GET", "/a", 200, u64::MAX),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut agg = StatsAggregator::default();
        agg.ingest_all(&parse_all(&refs));
        let snap = agg.snapshot();

        assert_eq!(snap.response_time_samples.len(), 2);
        assert_eq!(snap.mean_response_ms(), Some(u64::MAX as f64));
    }
}
