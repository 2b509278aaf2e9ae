//! Report rendering
//!
//! [`render`] turns one [`StatsSnapshot`] into a text, JSON or HTML report.
//! All three formats are built from the snapshot alone.

use crate::logs::stats_aggregation::{HealthTier, RankedEntry, SlowRequest};
use crate::logs::StatsSnapshot;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

const HTML_TEMPLATE_NAME: &str = "report.html";

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Log report: {{ service }}</title>
<style>
body { font-family: sans-serif; margin: 2em; color: #222; }
table { border-collapse: collapse; margin-bottom: 1.5em; }
th, td { border: 1px solid #ccc; padding: 4px 10px; text-align: left; }
th { background: #f0f0f0; }
.nominal { color: #2e7d32; } .elevated { color: #f9a825; } .critical { color: #c62828; }
</style>
</head>
<body>
<h1>Log report: {{ service }}</h1>
<p>Generated {{ timestamp }}</p>

<h2>Summary</h2>
<table>
<tr><th>Total lines</th><td>{{ metrics.totalLines }}</td></tr>
<tr><th>Requests</th><td>{{ metrics.requests }}</td></tr>
<tr><th>Errors</th><td>{{ metrics.errors }}</td></tr>
<tr><th>Error rate</th><td>{{ rate_display }}%</td></tr>
<tr><th>Unique IPs</th><td>{{ metrics.uniqueIps }}</td></tr>
<tr><th>Status</th><td class="{{ metrics.health }}">{{ health_label }}</td></tr>
</table>
<p>{{ recommendation }}</p>

<h2>HTTP status codes</h2>
{% if httpCodes %}
<table>
<tr><th>Code</th><th>Count</th></tr>
{% for code, count in httpCodes|items %}<tr><td>{{ code }}</td><td>{{ count }}</td></tr>
{% endfor %}</table>
{% else %}<p>No requests.</p>{% endif %}

<h2>Top client IPs</h2>
{% if topIps %}
<table>
<tr><th>#</th><th>IP</th><th>Requests</th></tr>
{% for row in topIps %}<tr><td>{{ loop.index }}</td><td>{{ row.ip }}</td><td>{{ row.count }}</td></tr>
{% endfor %}</table>
{% else %}<p>No client addresses.</p>{% endif %}

<h2>Top endpoints</h2>
{% if topEndpoints %}
<table>
<tr><th>#</th><th>Endpoint</th><th>Requests</th></tr>
{% for row in topEndpoints %}<tr><td>{{ loop.index }}</td><td>{{ row.endpoint }}</td><td>{{ row.count }}</td></tr>
{% endfor %}</table>
{% else %}<p>No endpoints.</p>{% endif %}

<h2>Response times</h2>
{% if responseTimes.samples > 0 %}
<table>
<tr><th>Samples</th><td>{{ responseTimes.samples }}</td></tr>
<tr><th>Min</th><td>{{ responseTimes.minMs }} ms</td></tr>
<tr><th>Mean</th><td>{{ mean_display }} ms</td></tr>
<tr><th>p50</th><td>{{ responseTimes.p50Ms }} ms</td></tr>
<tr><th>p95</th><td>{{ responseTimes.p95Ms }} ms</td></tr>
<tr><th>p99</th><td>{{ responseTimes.p99Ms }} ms</td></tr>
<tr><th>Max</th><td>{{ responseTimes.maxMs }} ms</td></tr>
</table>
{% else %}<p>No response times.</p>{% endif %}

{% if slowRequests.thresholdMs is not none %}
<h2>Slow requests (&ge; {{ slowRequests.thresholdMs }} ms): {{ slowRequests.count }}</h2>
{% if slowRequests.slowest %}
<table>
<tr><th>Time (ms)</th><th>Method</th><th>Endpoint</th><th>Status</th></tr>
{% for req in slowRequests.slowest %}<tr><td>{{ req.responseTimeMs }}</td><td>{{ req.httpMethod }}</td><td>{{ req.endpoint or "-" }}</td><td>{{ req.statusCode or "-" }}</td></tr>
{% endfor %}</table>
{% endif %}
{% endif %}

<h2>Time range</h2>
<p>{{ timeRange.first or "unknown" }} &ndash; {{ timeRange.last or "unknown" }}</p>
</body>
</html>
"#;

/// Output format of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
    Html,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportFormat::Text => "text",
            ReportFormat::Json => "json",
            ReportFormat::Html => "html",
        })
    }
}

/// What a report is about and when it was made
#[derive(Debug, Clone, PartialEq)]
pub struct ReportContext {
    pub service: String,
    pub generated_at: DateTime<Local>,
}

impl ReportContext {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            generated_at: Local::now(),
        }
    }
}

/// Render `snapshot` in `format`
pub fn render(snapshot: &StatsSnapshot, format: ReportFormat, context: &ReportContext) -> Result<String> {
    match format {
        ReportFormat::Text => Ok(render_text(snapshot, context)),
        ReportFormat::Json => {
            let report = JsonReport::new(snapshot, context);
            serde_json::to_string_pretty(&report).context("Failed to serialize report")
        }
        ReportFormat::Html => render_html(snapshot, context),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    timestamp: String,
    service: &'a str,
    metrics: Metrics,
    http_codes: &'a BTreeMap<u16, u64>,
    top_ips: Vec<IpRow<'a>>,
    top_endpoints: Vec<EndpointRow<'a>>,
    methods: &'a [RankedEntry],
    response_times: ResponseTimes,
    slow_requests: SlowRequests<'a>,
    time_range: TimeRange,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Metrics {
    requests: u64,
    errors: u64,
    /// Error rate in percent, two decimals
    rate: f64,
    unique_ips: usize,
    total_lines: u64,
    unparsed_lines: u64,
    unique_endpoints: usize,
    health: HealthTier,
}

#[derive(Debug, Serialize)]
struct IpRow<'a> {
    ip: &'a str,
    count: u64,
}

#[derive(Debug, Serialize)]
struct EndpointRow<'a> {
    endpoint: &'a str,
    count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseTimes {
    samples: usize,
    min_ms: Option<u64>,
    max_ms: Option<u64>,
    mean_ms: Option<f64>,
    p50_ms: Option<u64>,
    p95_ms: Option<u64>,
    p99_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SlowRequests<'a> {
    threshold_ms: Option<u64>,
    count: u64,
    slowest: &'a [SlowRequest],
}

#[derive(Debug, Serialize)]
struct TimeRange {
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl<'a> JsonReport<'a> {
    fn new(snapshot: &'a StatsSnapshot, context: &'a ReportContext) -> Self {
        Self {
            timestamp: context.generated_at.to_rfc3339(),
            service: &context.service,
            metrics: Metrics {
                requests: snapshot.total_requests,
                errors: snapshot.total_errors,
                rate: round2(snapshot.error_rate()),
                unique_ips: snapshot.unique_client_ips,
                total_lines: snapshot.total_lines,
                unparsed_lines: snapshot.unparsed_lines,
                unique_endpoints: snapshot.unique_endpoints,
                health: snapshot.health(),
            },
            http_codes: &snapshot.status_code_counts,
            top_ips: snapshot
                .top_client_ips
                .iter()
                .map(|e| IpRow {
                    ip: &e.key,
                    count: e.count,
                })
                .collect(),
            top_endpoints: snapshot
                .top_endpoints
                .iter()
                .map(|e| EndpointRow {
                    endpoint: &e.key,
                    count: e.count,
                })
                .collect(),
            methods: &snapshot.method_counts,
            response_times: ResponseTimes {
                samples: snapshot.response_time_samples.len(),
                min_ms: snapshot.min_response_ms(),
                max_ms: snapshot.max_response_ms(),
                mean_ms: snapshot.mean_response_ms().map(round2),
                p50_ms: snapshot.percentile(0.50),
                p95_ms: snapshot.percentile(0.95),
                p99_ms: snapshot.percentile(0.99),
            },
            slow_requests: SlowRequests {
                threshold_ms: snapshot.slow_threshold_ms,
                count: snapshot.slow_request_count,
                slowest: &snapshot.slow_requests,
            },
            time_range: TimeRange {
                first: snapshot.first_timestamp,
                last: snapshot.last_timestamp,
            },
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn ms(value: Option<u64>) -> String {
    value
        .map(|v| format!("{} ms", v))
        .unwrap_or_else(|| "-".to_string())
}

fn render_text(snapshot: &StatsSnapshot, context: &ReportContext) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Log report: {}\n\
         Generated {}\n\
         ==========================================\n\n",
        context.service,
        context.generated_at.format("%Y-%m-%d %H:%M:%S")
    ));

    out.push_str(&format!(
        "Lines: {} (unparsed: {}) | requests: {} | errors: {}\n\n",
        snapshot.total_lines, snapshot.unparsed_lines, snapshot.total_requests, snapshot.total_errors
    ));

    out.push_str("HTTP status codes\n-----------------\n");
    if snapshot.status_code_counts.is_empty() {
        out.push_str("  <no requests>\n");
    } else {
        for (code, count) in &snapshot.status_code_counts {
            let pct = *count as f64 / snapshot.total_requests.max(1) as f64 * 100.0;
            out.push_str(&format!("  {:<6} {:>8} {:>6.1}%\n", code, count, pct));
        }
    }
    out.push('\n');

    if !snapshot.method_counts.is_empty() {
        out.push_str("Methods: ");
        let methods: Vec<String> = snapshot
            .method_counts
            .iter()
            .map(|m| format!("{}={}", m.key, m.count))
            .collect();
        out.push_str(&methods.join(" "));
        out.push_str("\n\n");
    }

    push_ranked(&mut out, "Top client IPs", &snapshot.top_client_ips, "<no client addresses>");
    push_ranked(&mut out, "Top endpoints", &snapshot.top_endpoints, "<no endpoints>");

    out.push_str("Response times\n--------------\n");
    if snapshot.response_time_samples.is_empty() {
        out.push_str("  <no samples>\n");
    } else {
        out.push_str(&format!(
            "  samples: {} | min: {} | mean: {:.1} ms | max: {}\n  p50: {} | p95: {} | p99: {}\n",
            snapshot.response_time_samples.len(),
            ms(snapshot.min_response_ms()),
            snapshot.mean_response_ms().unwrap_or(0.0),
            ms(snapshot.max_response_ms()),
            ms(snapshot.percentile(0.50)),
            ms(snapshot.percentile(0.95)),
            ms(snapshot.percentile(0.99)),
        ));
    }
    out.push('\n');

    if let Some(threshold) = snapshot.slow_threshold_ms {
        out.push_str(&format!(
            "Slow requests (>= {} ms): {}\n",
            threshold, snapshot.slow_request_count
        ));
        for req in &snapshot.slow_requests {
            out.push_str(&format!(
                "  {:>8} ms  {} {}{}\n",
                req.response_time_ms,
                req.http_method,
                req.endpoint.as_deref().unwrap_or("-"),
                req.status_code
                    .map(|code| format!(" ({})", code))
                    .unwrap_or_default()
            ));
        }
        out.push('\n');
    }

    out.push_str("Time range\n----------\n");
    match (snapshot.first_timestamp, snapshot.last_timestamp) {
        (Some(first), Some(last)) => out.push_str(&format!(
            "  {} -> {}\n\n",
            first.format("%Y-%m-%d %H:%M:%S"),
            last.format("%Y-%m-%d %H:%M:%S")
        )),
        _ => out.push_str("  <no timestamps>\n\n"),
    }

    let health = snapshot.health();
    let lines = [
        format!("Error rate: {:.2}%", snapshot.error_rate()),
        format!("Status: {}", health.label()),
        health.recommendation().to_string(),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    out.push_str(&format!("+{}+\n", "-".repeat(width + 2)));
    for line in &lines {
        out.push_str(&format!("| {:<width$} |\n", line, width = width));
    }
    out.push_str(&format!("+{}+\n", "-".repeat(width + 2)));

    out
}

fn push_ranked(out: &mut String, title: &str, rows: &[RankedEntry], empty: &str) {
    out.push_str(title);
    out.push('\n');
    out.push_str(&"-".repeat(title.len()));
    out.push('\n');
    if rows.is_empty() {
        out.push_str(&format!("  {}\n", empty));
    }
    for (rank, row) in rows.iter().enumerate() {
        out.push_str(&format!("  {:>2}. {:<40} {:>8}\n", rank + 1, row.key, row.count));
    }
    out.push('\n');
}

fn render_html(snapshot: &StatsSnapshot, context: &ReportContext) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    // The .html name turns on autoescaping
    env.add_template(HTML_TEMPLATE_NAME, HTML_TEMPLATE)
        .context("Failed to load report template")?;

    let report = JsonReport::new(snapshot, context);
    let health = snapshot.health();
    let ctx = minijinja::context! {
        service => report.service,
        timestamp => context.generated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        metrics => minijinja::Value::from_serialize(&report.metrics),
        httpCodes => minijinja::Value::from_serialize(report.http_codes),
        topIps => minijinja::Value::from_serialize(&report.top_ips),
        topEndpoints => minijinja::Value::from_serialize(&report.top_endpoints),
        responseTimes => minijinja::Value::from_serialize(&report.response_times),
        slowRequests => minijinja::Value::from_serialize(&report.slow_requests),
        timeRange => minijinja::Value::from_serialize(&report.time_range),
        rate_display => format!("{:.2}", snapshot.error_rate()),
        mean_display => format!("{:.1}", snapshot.mean_response_ms().unwrap_or(0.0)),
        health_label => health.label(),
        recommendation => health.recommendation(),
    };

    env.get_template(HTML_TEMPLATE_NAME)
        .and_then(|tmpl| tmpl.render(ctx))
        .context("Failed to render HTML report")
}
