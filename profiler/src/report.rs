//! Renders profiles and sessions as JSON, HTML, Markdown or plain text.
//!
//! JSON is the structural serialization of the profile. The three textual
//! formats are rendered from one intermediate [`Section`] per dimension, so
//! every format reports the same figures for the same profile.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde_json::{Map, Value, json};

use crate::{
    error::ProfilerResult,
    network::analyze_requests,
    schema::{
        CpuProfile, MemoryProfile, Milliseconds, NetworkProfile, NetworkRequest, ProfileReport,
        ProfilerSession, ReportFormat,
    },
    tree::{CallTree, build_flame_graph},
};

/// Call tree nodes below this share of samples are folded into their parent.
const CALL_TREE_PRUNE_PERCENT: f64 = 1.0;

const TEXT_DIVIDER: &str = "\n\n========================================\n\n";
const MARKDOWN_DIVIDER: &str = "\n\n---\n\n";
const HTML_DIVIDER: &str = "\n<hr>\n";

const HTML_STYLE: &str = "body { font-family: sans-serif; margin: 2rem; } \
table { border-collapse: collapse; margin-bottom: 1rem; } \
th, td { border: 1px solid #ccc; padding: 4px 8px; text-align: left; } \
pre { background: #f6f6f6; padding: 1rem; }";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    pub format: ReportFormat,
    pub include_metadata: bool,
    /// Reserved; no format renders charts.
    pub include_charts: bool,
    /// Row cap for every table.
    pub max_entries: usize,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            format: ReportFormat::default(),
            include_metadata: true,
            include_charts: false,
            max_entries: 10,
        }
    }
}

impl ReportOptions {
    pub fn new(format: ReportFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }
}

struct Table {
    title: &'static str,
    headers: &'static [&'static str],
    rows: Vec<Vec<String>>,
}

struct Section {
    title: String,
    facts: Vec<(&'static str, String)>,
    tables: Vec<Table>,
    preformatted: Option<(&'static str, String)>,
}

impl Section {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            facts: Vec::new(),
            tables: Vec::new(),
            preformatted: None,
        }
    }

    fn fact(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.facts.push((name, value.into()));
        self
    }

    fn table(
        mut self,
        title: &'static str,
        headers: &'static [&'static str],
        rows: Vec<Vec<String>>,
    ) -> Self {
        self.tables.push(Table {
            title,
            headers,
            rows,
        });
        self
    }

    fn with_metadata(self, options: &ReportOptions, metadata: &Map<String, Value>) -> Self {
        if !options.include_metadata {
            return self;
        }
        let rows = metadata
            .iter()
            .map(|(key, value)| vec![key.clone(), metadata_value(value)])
            .collect();
        self.table("Metadata", &["Key", "Value"], rows)
    }
}

pub fn generate_cpu_report(
    profile: &CpuProfile,
    options: &ReportOptions,
) -> ProfilerResult<ProfileReport> {
    let title = "CPU Profile Report";
    let metadata = cpu_metadata(profile);
    let content = render(
        options,
        title,
        || json_with_metadata(cpu_json(profile)?, options, &metadata),
        || vec![cpu_section(profile, options).with_metadata(options, &metadata)],
    )?;

    Ok(report(title, options, content, metadata))
}

pub fn generate_memory_report(
    profile: &MemoryProfile,
    options: &ReportOptions,
) -> ProfilerResult<ProfileReport> {
    let title = "Memory Profile Report";
    let metadata = memory_metadata(profile);
    let content = render(
        options,
        title,
        || json_with_metadata(serde_json::to_value(profile)?, options, &metadata),
        || vec![memory_section(profile, options).with_metadata(options, &metadata)],
    )?;

    Ok(report(title, options, content, metadata))
}

pub fn generate_network_report(
    profile: &NetworkProfile,
    options: &ReportOptions,
) -> ProfilerResult<ProfileReport> {
    let title = "Network Profile Report";
    let metadata = network_metadata(profile);
    let content = render(
        options,
        title,
        || json_with_metadata(serde_json::to_value(profile)?, options, &metadata),
        || vec![network_section(profile, options).with_metadata(options, &metadata)],
    )?;

    Ok(report(title, options, content, metadata))
}

/// Combined report over every dimension the session recorded.
pub fn generate_session_report(
    session: &ProfilerSession,
    options: &ReportOptions,
) -> ProfilerResult<ProfileReport> {
    let title = format!("Profiling Session {}", session.id);
    let metadata = session_metadata(session);

    let json = || -> ProfilerResult<Value> {
        let mut object = Map::new();
        object.insert(
            "session".to_string(),
            json!({
                "id": session.id,
                "startTime": session.start_time,
                "endTime": session.end_time,
                "duration": session.duration,
            }),
        );
        if let Some(cpu) = &session.cpu_profile {
            object.insert("cpu".to_string(), cpu_json(cpu)?);
        }
        if let Some(memory) = &session.memory_profile {
            object.insert("memory".to_string(), serde_json::to_value(memory)?);
        }
        if let Some(network) = &session.network_profile {
            object.insert("network".to_string(), serde_json::to_value(network)?);
        }
        json_with_metadata(Value::Object(object), options, &metadata)
    };

    let sections = || {
        let mut sections = vec![session_section(session).with_metadata(options, &metadata)];
        if let Some(cpu) = &session.cpu_profile {
            sections.push(cpu_section(cpu, options));
        }
        if let Some(memory) = &session.memory_profile {
            sections.push(memory_section(memory, options));
        }
        if let Some(network) = &session.network_profile {
            sections.push(network_section(network, options));
        }
        sections
    };

    let content = render(options, &title, json, sections)?;
    Ok(report(&title, options, content, metadata))
}

fn report(
    title: &str,
    options: &ReportOptions,
    content: String,
    metadata: Map<String, Value>,
) -> ProfileReport {
    ProfileReport {
        title: title.to_string(),
        timestamp: Utc::now(),
        format: options.format,
        content,
        metadata,
    }
}

fn render(
    options: &ReportOptions,
    title: &str,
    json: impl FnOnce() -> ProfilerResult<Value>,
    sections: impl FnOnce() -> Vec<Section>,
) -> ProfilerResult<String> {
    let content = match options.format {
        ReportFormat::Json => serde_json::to_string_pretty(&json()?)?,
        ReportFormat::Text => {
            let body = sections().iter().map(render_text).join(TEXT_DIVIDER);
            format!("{}\n{}\n\n{body}\n", title, "=".repeat(title.chars().count()))
        }
        ReportFormat::Markdown => {
            let body = sections().iter().map(render_markdown).join(MARKDOWN_DIVIDER);
            format!("# {}\n\n{body}\n", escape_markdown(title))
        }
        ReportFormat::Html => {
            let body = sections().iter().map(render_html).join(HTML_DIVIDER);
            html_document(title, &body)
        }
    };

    Ok(content)
}

/// The profile with its flame graph under `flameGraph`.
fn cpu_json(profile: &CpuProfile) -> ProfilerResult<Value> {
    let mut value = serde_json::to_value(profile)?;
    if let Value::Object(object) = &mut value {
        object.insert(
            "flameGraph".to_string(),
            serde_json::to_value(build_flame_graph(profile))?,
        );
    }
    Ok(value)
}

fn json_with_metadata(
    mut value: Value,
    options: &ReportOptions,
    metadata: &Map<String, Value>,
) -> ProfilerResult<Value> {
    if options.include_metadata {
        if let Value::Object(object) = &mut value {
            object.insert("metadata".to_string(), Value::Object(metadata.clone()));
        }
    }
    Ok(value)
}

fn metadata<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn cpu_metadata(profile: &CpuProfile) -> Map<String, Value> {
    metadata([
        ("duration", json!(profile.duration)),
        ("sampleInterval", json!(profile.sample_interval)),
        ("sampleCount", json!(profile.samples.len())),
        ("nodeCount", json!(profile.nodes.len())),
    ])
}

fn memory_metadata(profile: &MemoryProfile) -> Map<String, Value> {
    metadata([
        ("duration", json!(profile.duration)),
        ("snapshotCount", json!(profile.snapshots.len())),
        ("peakMemory", json!(profile.peak_memory)),
        ("averageMemory", json!(profile.average_memory)),
        ("leakCount", json!(profile.memory_leaks.len())),
    ])
}

fn network_metadata(profile: &NetworkProfile) -> Map<String, Value> {
    metadata([
        ("duration", json!(profile.duration)),
        ("totalRequests", json!(profile.total_requests)),
        ("failedRequests", json!(profile.failed_requests)),
        ("totalBytesTransferred", json!(profile.total_bytes_transferred)),
    ])
}

fn session_metadata(session: &ProfilerSession) -> Map<String, Value> {
    metadata([
        ("sessionId", json!(session.id)),
        ("duration", json!(session.duration)),
        ("profileCount", json!(session.profile_count())),
    ])
}

fn metadata_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn session_section(session: &ProfilerSession) -> Section {
    Section::new("Session")
        .fact("Id", session.id.clone())
        .fact("Started", format_timestamp(session.start_time))
        .fact("Ended", format_timestamp(session.end_time))
        .fact("Duration", format_ms(session.duration))
        .fact("Profiles", session.profile_count().to_string())
}

fn cpu_section(profile: &CpuProfile, options: &ReportOptions) -> Section {
    let rows = profile
        .nodes
        .iter()
        .sorted_by(|a, b| b.total_time.total_cmp(&a.total_time))
        .take(options.max_entries)
        .enumerate()
        .map(|(rank, node)| {
            vec![
                (rank + 1).to_string(),
                node.function_name.clone(),
                format!("{}:{}", node.file, node.line),
                format!("{:.2}", node.total_time),
                format!("{:.2}", node.self_time),
                node.hit_count.to_string(),
            ]
        })
        .collect();

    let flame_graph = build_flame_graph(profile)
        .children
        .into_iter()
        .take(options.max_entries)
        .map(|node| {
            vec![
                node.name,
                node.value.to_string(),
                format!("{:.2}", node.self_time),
                format!("{:.2}", node.total_time),
                format!("{:.1}", node.percentage),
            ]
        })
        .collect();

    let mut section = Section::new("CPU Profile")
        .fact("Duration", format_ms(profile.duration))
        .fact("Sample interval", format_ms(profile.sample_interval))
        .fact("Samples", profile.samples.len().to_string())
        .fact("Call sites", profile.nodes.len().to_string())
        .table(
            "Top functions",
            &["#", "Function", "Location", "Total (ms)", "Self (ms)", "Hits"],
            rows,
        )
        .table(
            "Flame graph",
            &["Frame", "Samples", "Self (ms)", "Total (ms)", "Share (%)"],
            flame_graph,
        );

    if !profile.sample_stacks.is_empty() {
        let mut tree = CallTree::from_profile(profile);
        tree.prune(CALL_TREE_PRUNE_PERCENT);
        section.preformatted = Some(("Call tree", tree.to_string()));
    }

    section
}

fn memory_section(profile: &MemoryProfile, options: &ReportOptions) -> Section {
    let leaks = profile
        .memory_leaks
        .iter()
        .take(options.max_entries)
        .map(|allocation| {
            vec![
                allocation.id.clone(),
                allocation.allocation_type.clone(),
                format_bytes(allocation.size as f64),
                format!("{:.0}", allocation.timestamp),
                allocation
                    .stack
                    .last()
                    .map(|frame| frame.function_name.clone())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    Section::new("Memory Profile")
        .fact("Duration", format_ms(profile.duration))
        .fact("Snapshots", profile.snapshots.len().to_string())
        .fact("Peak memory", format_bytes(profile.peak_memory as f64))
        .fact("Average memory", format_bytes(profile.average_memory))
        .fact("Growth rate", format!("{}/s", format_bytes(profile.growth_rate)))
        .fact("Leak candidates", profile.memory_leaks.len().to_string())
        .table(
            "Leak candidates",
            &["Id", "Type", "Size", "Allocated at (ms)", "Innermost frame"],
            leaks,
        )
}

fn network_section(profile: &NetworkProfile, options: &ReportOptions) -> Section {
    let analysis = analyze_requests(&profile.requests);

    let domains = analysis
        .by_domain
        .iter()
        .sorted_by(|(a_name, a), (b_name, b)| {
            b.count.cmp(&a.count).then_with(|| a_name.cmp(b_name))
        })
        .take(options.max_entries)
        .map(|(domain, stats)| {
            vec![
                domain.clone(),
                stats.count.to_string(),
                stats.failed.to_string(),
                format!("{:.2}", stats.average_time),
            ]
        })
        .collect();

    let slow = analysis
        .slow_requests
        .iter()
        .take(options.max_entries)
        .map(|request| {
            vec![
                request.method.clone(),
                request.url.clone(),
                request.status.to_string(),
                format!("{:.2}", request.timings.total),
            ]
        })
        .collect();

    let throughput = if profile.duration > 0.0 {
        profile.total_bytes_transferred as f64 / (profile.duration / 1000.0)
    } else {
        0.0
    };

    Section::new("Network Profile")
        .fact("Duration", format_ms(profile.duration))
        .fact("Requests", profile.total_requests.to_string())
        .fact("Failed requests", profile.failed_requests.to_string())
        .fact("Transferred", format_bytes(profile.total_bytes_transferred as f64))
        .fact("Throughput", format!("{}/s", format_bytes(throughput)))
        .fact("Average request time", format_ms(profile.average_request_time))
        .fact("Slowest request", describe_request(profile.slowest_request.as_ref()))
        .fact("Fastest request", describe_request(profile.fastest_request.as_ref()))
        .table("Domains", &["Domain", "Requests", "Failed", "Average (ms)"], domains)
        .table("Slow requests", &["Method", "URL", "Status", "Total (ms)"], slow)
}

fn describe_request(request: Option<&NetworkRequest>) -> String {
    match request {
        Some(request) => format!(
            "{} {} ({})",
            request.method,
            request.url,
            format_ms(request.timings.total)
        ),
        None => "-".to_string(),
    }
}

fn render_text(section: &Section) -> String {
    let mut lines = vec![
        section.title.clone(),
        "-".repeat(section.title.chars().count()),
    ];

    let width = section
        .facts
        .iter()
        .map(|(name, _)| name.chars().count() + 1)
        .max()
        .unwrap_or(0);
    for (name, value) in &section.facts {
        lines.push(format!("{:<width$} {value}", format!("{name}:")));
    }

    for table in &section.tables {
        lines.push(String::new());
        lines.push(format!("{}:", table.title));
        if table.rows.is_empty() {
            lines.push("  (none)".to_string());
            continue;
        }

        let widths = (0..table.headers.len())
            .map(|column| {
                table
                    .rows
                    .iter()
                    .map(|row| row[column].chars().count())
                    .chain([table.headers[column].chars().count()])
                    .max()
                    .unwrap_or(0)
            })
            .collect::<Vec<_>>();
        let format_row = |cells: &mut dyn Iterator<Item = &str>| {
            let row = cells
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .join("  ");
            format!("  {}", row.trim_end())
        };

        lines.push(format_row(&mut table.headers.iter().copied()));
        for row in &table.rows {
            lines.push(format_row(&mut row.iter().map(String::as_str)));
        }
    }

    if let Some((title, body)) = &section.preformatted {
        lines.push(String::new());
        lines.push(format!("{title}:"));
        lines.push(body.trim_end().to_string());
    }

    lines.join("\n")
}

fn render_markdown(section: &Section) -> String {
    let mut lines = vec![format!("## {}", escape_markdown(&section.title)), String::new()];

    for (name, value) in &section.facts {
        lines.push(format!("- **{name}:** {}", escape_markdown(value)));
    }

    for table in &section.tables {
        lines.push(String::new());
        lines.push(format!("### {}", table.title));
        lines.push(String::new());
        if table.rows.is_empty() {
            lines.push("_None._".to_string());
            continue;
        }

        lines.push(format!("| {} |", table.headers.join(" | ")));
        lines.push(format!("|{}", " --- |".repeat(table.headers.len())));
        for row in &table.rows {
            lines.push(format!(
                "| {} |",
                row.iter().map(|cell| escape_markdown(cell)).join(" | ")
            ));
        }
    }

    if let Some((title, body)) = &section.preformatted {
        lines.push(String::new());
        lines.push(format!("### {title}"));
        lines.push(String::new());
        lines.push("```text".to_string());
        lines.push(body.trim_end().to_string());
        lines.push("```".to_string());
    }

    lines.join("\n")
}

fn render_html(section: &Section) -> String {
    let mut lines = vec![
        "<section>".to_string(),
        format!("<h2>{}</h2>", escape_html(&section.title)),
    ];

    if !section.facts.is_empty() {
        lines.push("<ul>".to_string());
        for (name, value) in &section.facts {
            lines.push(format!(
                "<li><strong>{}:</strong> {}</li>",
                escape_html(name),
                escape_html(value)
            ));
        }
        lines.push("</ul>".to_string());
    }

    for table in &section.tables {
        lines.push(format!("<h3>{}</h3>", escape_html(table.title)));
        if table.rows.is_empty() {
            lines.push("<p>None.</p>".to_string());
            continue;
        }

        lines.push("<table>".to_string());
        lines.push(format!(
            "<thead><tr>{}</tr></thead>",
            table
                .headers
                .iter()
                .map(|header| format!("<th>{}</th>", escape_html(header)))
                .join("")
        ));
        lines.push("<tbody>".to_string());
        for row in &table.rows {
            lines.push(format!(
                "<tr>{}</tr>",
                row.iter()
                    .map(|cell| format!("<td>{}</td>", escape_html(cell)))
                    .join("")
            ));
        }
        lines.push("</tbody>".to_string());
        lines.push("</table>".to_string());
    }

    if let Some((title, body)) = &section.preformatted {
        lines.push(format!("<h3>{}</h3>", escape_html(title)));
        lines.push(format!("<pre>{}</pre>", escape_html(body.trim_end())));
    }

    lines.push("</section>".to_string());
    lines.join("\n")
}

fn html_document(title: &str, body: &str) -> String {
    let title = escape_html(title);
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title}</title>\n<style>{HTML_STYLE}</style>\n</head>\n<body>\n\
         <h1>{title}</h1>\n{body}\n</body>\n</html>\n"
    )
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn escape_markdown(text: &str) -> String {
    text.replace('|', "\\|")
}

fn format_ms(ms: Milliseconds) -> String {
    format!("{ms:.2} ms")
}

fn format_timestamp(ms: Milliseconds) -> String {
    DateTime::from_timestamp_millis(ms as i64)
        .map(|timestamp| timestamp.to_rfc3339())
        .unwrap_or_else(|| format!("{ms:.0}"))
}

/// Human-readable byte count in binary units. Negative values keep their
/// sign.
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let sign = if bytes < 0.0 { "-" } else { "" };
    let mut value = bytes.abs();
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{sign}{value:.0} {}", UNITS[unit])
    } else {
        format!("{sign}{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use test_case::test_case;

    use super::*;
    use crate::{
        cpu::{StackSample, build_cpu_profile},
        network::build_network_profile,
        schema::{HeapSnapshot, MemoryAllocation, NetworkTimings},
        stack::CallFrame,
    };

    fn cpu_profile() -> CpuProfile {
        let frame = |name: &str, line| CallFrame::new(name, "src/app.rs", line, 1, 0.0);
        let samples = (0..5)
            .map(|idx| StackSample {
                timestamp: 1_000.0 + (idx + 1) as f64 * 10.0,
                frames: if idx < 3 {
                    vec![frame("main", 3), frame("handle<T>", 10)]
                } else {
                    vec![frame("main", 3), frame("serialize", 20)]
                },
            })
            .collect::<Vec<_>>();
        build_cpu_profile(1_000.0, 1_050.0, 10.0, &samples)
    }

    fn memory_profile() -> MemoryProfile {
        let snapshot = |timestamp, used| HeapSnapshot {
            timestamp,
            total_heap_size: 4_096,
            used_heap_size: used,
            total_physical_size: used,
            external_memory: 0,
            malloced_memory: 0,
            allocations: Vec::new(),
        };
        MemoryProfile {
            start_time: 0.0,
            end_time: 2_000.0,
            duration: 2_000.0,
            snapshots: vec![snapshot(0.0, 1_024), snapshot(2_000.0, 3_072)],
            peak_memory: 3_072,
            average_memory: 2_048.0,
            memory_leaks: vec![MemoryAllocation {
                id: "cache".to_string(),
                size: 2_048,
                allocation_type: "Buffer".to_string(),
                timestamp: 0.0,
                stack: vec![CallFrame::new("fill_cache", "src/cache.rs", 8, 5, 0.0)],
            }],
            growth_rate: 1_024.0,
        }
    }

    fn network_profile() -> NetworkProfile {
        let request = |id: &str, url: &str, status, total| NetworkRequest {
            id: id.to_string(),
            method: "GET".to_string(),
            url: url.to_string(),
            status,
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            request_size: 10,
            response_size: 90,
            timings: NetworkTimings {
                total,
                ..Default::default()
            },
            timestamp: 0.0,
            error: None,
        };
        build_network_profile(
            0.0,
            1_000.0,
            vec![
                request("a", "https://api.test/users", 200, 120.0),
                request("b", "https://api.test/slow?a=1&b=2", 503, 2_500.0),
            ],
        )
    }

    fn session() -> ProfilerSession {
        ProfilerSession {
            id: "5b8c".to_string(),
            start_time: 1_000.0,
            end_time: 1_050.0,
            duration: 50.0,
            cpu_profile: Some(cpu_profile()),
            memory_profile: None,
            network_profile: Some(network_profile()),
        }
    }

    #[test]
    fn json_and_html_agree() {
        let profile = cpu_profile();

        let json = generate_cpu_report(&profile, &ReportOptions::new(ReportFormat::Json)).unwrap();
        let html = generate_cpu_report(&profile, &ReportOptions::new(ReportFormat::Html)).unwrap();

        let parsed: Value = serde_json::from_str(&json.content).unwrap();
        let duration = parsed["duration"].as_f64().unwrap();
        assert_eq!(duration, 50.0);
        assert!(html.content.contains(&format!("{duration:.2} ms")));

        let names = parsed["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|node| node["functionName"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["main", "handle<T>", "serialize"]);
        for name in names {
            assert!(html.content.contains(&escape_html(&name)), "{name} missing");
        }
        assert_eq!(json.metadata, html.metadata);
    }

    #[test_case(ReportFormat::Json)]
    #[test_case(ReportFormat::Html)]
    #[test_case(ReportFormat::Markdown)]
    #[test_case(ReportFormat::Text)]
    fn every_format_reports_the_duration(format: ReportFormat) {
        let report = generate_cpu_report(&cpu_profile(), &ReportOptions::new(format)).unwrap();

        assert_eq!(report.format, format);
        assert_eq!(report.title, "CPU Profile Report");
        assert_eq!(report.metadata["duration"], json!(50.0));
        assert_eq!(report.metadata["sampleCount"], json!(5));
        match format {
            ReportFormat::Json => assert!(report.content.contains("\"duration\": 50.0")),
            _ => assert!(report.content.contains("50.00 ms")),
        }
    }

    #[test]
    fn reports_carry_the_flame_graph() {
        let profile = cpu_profile();

        let json = generate_cpu_report(&profile, &ReportOptions::new(ReportFormat::Json)).unwrap();
        let parsed: Value = serde_json::from_str(&json.content).unwrap();
        let flame_graph = &parsed["flameGraph"];
        assert_eq!(flame_graph["name"], "root");
        assert_eq!(flame_graph["value"], json!(5));
        assert_eq!(flame_graph["children"][0]["name"], "handle<T> (src/app.rs:10)");
        assert_eq!(flame_graph["children"][0]["percentage"], json!(60.0));
        assert_eq!(flame_graph["children"][1]["name"], "serialize (src/app.rs:20)");

        let combined = generate_session_report(&session(), &ReportOptions::default()).unwrap();
        let parsed: Value = serde_json::from_str(&combined.content).unwrap();
        assert_eq!(parsed["cpu"]["flameGraph"]["value"], json!(5));

        let text = generate_cpu_report(&profile, &ReportOptions::new(ReportFormat::Text))
            .unwrap()
            .content;
        assert!(text.contains("Flame graph:"));
        assert!(text.contains("  handle<T> (src/app.rs:10)  3"));

        let markdown = generate_cpu_report(&profile, &ReportOptions::new(ReportFormat::Markdown))
            .unwrap()
            .content;
        assert!(markdown.contains("### Flame graph"));
        assert!(markdown.contains("| serialize (src/app.rs:20) | 2 | 20.00 | 20.00 | 40.0 |"));

        let html = generate_cpu_report(&profile, &ReportOptions::new(ReportFormat::Html))
            .unwrap()
            .content;
        assert!(html.contains("<h3>Flame graph</h3>"));
        assert!(html.contains("<td>handle&lt;T&gt; (src/app.rs:10)</td>"));
    }

    #[test]
    fn max_entries_caps_tables() {
        let options = ReportOptions {
            format: ReportFormat::Text,
            max_entries: 1,
            ..Default::default()
        };

        let content = generate_cpu_report(&cpu_profile(), &options).unwrap().content;

        assert!(content.contains("  1  main"));
        assert!(!content.contains("  2  handle<T>"));
    }

    #[test]
    fn text_report_includes_the_call_tree() {
        let content = generate_cpu_report(&cpu_profile(), &ReportOptions::new(ReportFormat::Text))
            .unwrap()
            .content;

        assert!(content.starts_with("CPU Profile Report\n==================\n"));
        assert!(content.contains("Call tree:"));
        assert!(content.contains("│ 100.0 │ 5       │ 0       │ main"));
        assert!(content.contains("├─ handle<T>"));
    }

    #[test]
    fn metadata_can_be_left_out_of_the_content() {
        let options = ReportOptions {
            include_metadata: false,
            ..Default::default()
        };

        let report = generate_cpu_report(&cpu_profile(), &options).unwrap();
        let parsed: Value = serde_json::from_str(&report.content).unwrap();

        assert!(parsed.get("metadata").is_none());
        assert_eq!(report.metadata["nodeCount"], json!(3));

        let included = generate_cpu_report(&cpu_profile(), &ReportOptions::default()).unwrap();
        let parsed: Value = serde_json::from_str(&included.content).unwrap();
        assert_eq!(parsed["metadata"]["nodeCount"], json!(3));
    }

    #[test]
    fn html_escapes_user_strings() {
        let report =
            generate_network_report(&network_profile(), &ReportOptions::new(ReportFormat::Html)).unwrap();

        assert!(report.content.starts_with("<!DOCTYPE html>"));
        assert!(report.content.contains("https://api.test/slow?a=1&amp;b=2"));
        assert!(!report.content.contains("a=1&b=2"));
    }

    #[test]
    fn memory_report_lists_leaks() {
        let content =
            generate_memory_report(&memory_profile(), &ReportOptions::new(ReportFormat::Markdown))
                .unwrap()
                .content;

        assert!(content.starts_with("# Memory Profile Report"));
        assert!(content.contains("- **Peak memory:** 3.00 KB"));
        assert!(content.contains("- **Growth rate:** 1.00 KB/s"));
        assert!(content.contains("| cache | Buffer | 2.00 KB | 0 | fill_cache |"));
    }

    #[test]
    fn network_report_lists_domains_and_slow_requests() {
        let content = generate_network_report(&network_profile(), &ReportOptions::new(ReportFormat::Text))
            .unwrap()
            .content;

        assert!(content.contains("Requests:"));
        assert!(content.contains("Failed requests:"));
        assert!(content.contains("  api.test  2         1       1310.00"));
        assert!(content.contains("Slow requests:"));
        assert!(content.contains("GET     https://api.test/slow?a=1&b=2  503     2500.00"));
    }

    #[test]
    fn combined_json_is_one_object() {
        let report = generate_session_report(&session(), &ReportOptions::default()).unwrap();

        let parsed: Value = serde_json::from_str(&report.content).unwrap();
        assert_eq!(parsed["session"]["id"], "5b8c");
        assert_eq!(parsed["cpu"]["duration"], json!(50.0));
        assert!(parsed.get("memory").is_none());
        assert_eq!(parsed["network"]["totalRequests"], json!(2));
        assert_eq!(parsed["metadata"]["profileCount"], json!(2));
        assert_eq!(report.metadata["sessionId"], "5b8c");
    }

    #[test_case(ReportFormat::Text, TEXT_DIVIDER)]
    #[test_case(ReportFormat::Markdown, MARKDOWN_DIVIDER)]
    #[test_case(ReportFormat::Html, HTML_DIVIDER)]
    fn combined_text_joins_present_sections(format: ReportFormat, divider: &str) {
        let content = generate_session_report(&session(), &ReportOptions::new(format))
            .unwrap()
            .content;

        assert_eq!(content.matches(divider).count(), 2);
        assert!(content.contains("CPU Profile"));
        assert!(content.contains("Network Profile"));
        assert!(!content.contains("Memory Profile"));
    }

    #[test]
    fn empty_profiles_render() {
        let profile = build_cpu_profile(0.0, 0.0, 1.0, &[]);

        for format in [ReportFormat::Text, ReportFormat::Markdown, ReportFormat::Html] {
            let content = generate_cpu_report(&profile, &ReportOptions::new(format))
                .unwrap()
                .content;
            assert!(content.contains("0.00 ms"));
            assert!(!content.contains("Call tree"));
        }
    }

    #[test_case(0.0 => "0 B")]
    #[test_case(512.0 => "512 B")]
    #[test_case(1_536.0 => "1.50 KB")]
    #[test_case(5.0 * 1024.0 * 1024.0 => "5.00 MB")]
    #[test_case(-2_048.0 => "-2.00 KB")]
    fn bytes(value: f64) -> String {
        format_bytes(value)
    }
}
