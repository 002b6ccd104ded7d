//! Value types produced by the profilers and consumed by the reporter.
//!
//! Everything here is plain data: the sub-profilers build these values when
//! they stop, and nothing mutates them afterwards. Field names serialize in
//! camelCase so that persisted sessions and JSON reports share one layout.
//!
//! # Data Model
//!
//! A CPU profile is organized as a node registry plus indices, in the spirit
//! of sampled-profile formats. Each sample stores the id of its leaf node and
//! an index into the stack table, whose `prefix` column links every stack to
//! its caller:
//!
//! ```no_run
//! # use profiler::schema::CpuProfile;
//! # let profile: CpuProfile = todo!();
//! # let sample_idx = 3;
//! let stack_idx = profile.sample_stacks[sample_idx];
//! let leaf_id = profile.stack_table.node[stack_idx];
//! let caller_stack = profile.stack_table.prefix[stack_idx];
//! let name = &profile.node(leaf_id).unwrap().function_name;
//! ```

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stack::CallFrame;

pub type Milliseconds = f64;
pub type Bytes = u64;

pub type NodeId = u32;
pub type IndexIntoStackTable = usize;

/// One distinct call site observed across the samples of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfileNode {
    pub id: NodeId,
    pub function_name: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// Number of samples where this node was the leaf frame.
    pub hit_count: u64,
    /// Callees observed directly below this node, in first-seen order.
    pub children: Vec<NodeId>,
    pub self_time: Milliseconds,
    /// Time of the samples this node appeared in, leaf or not.
    pub total_time: Milliseconds,
}

impl CpuProfileNode {
    /// Flame graph label: `function (file:line)`.
    pub fn label(&self) -> String {
        format!("{} ({}:{})", self.function_name, self.file, self.line)
    }
}

/// Tree of sampled stacks. Root stacks have no prefix, every other stack has
/// the index of its caller's stack as prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTable {
    pub length: usize,
    pub node: Vec<NodeId>,
    pub prefix: Vec<Option<IndexIntoStackTable>>,
}

impl StackTable {
    /// Node ids of the stack, outermost first.
    pub fn frames(&self, stack_idx: IndexIntoStackTable) -> Vec<NodeId> {
        let mut frames = Vec::new();
        let mut current = Some(stack_idx);
        while let Some(idx) = current {
            let (Some(&node), Some(&prefix)) = (self.node.get(idx), self.prefix.get(idx)) else {
                break;
            };
            frames.push(node);
            current = prefix;
        }
        frames.reverse();
        frames
    }
}

/// Finalized CPU measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfile {
    pub start_time: Milliseconds,
    pub end_time: Milliseconds,
    pub duration: Milliseconds,
    pub sample_interval: Milliseconds,
    pub nodes: Vec<CpuProfileNode>,
    /// Leaf node id of each sample.
    pub samples: Vec<NodeId>,
    /// Time since the previous sample (or since the start, for the first).
    pub time_deltas: Vec<Milliseconds>,
    pub stack_table: StackTable,
    /// Full stack of each sample, as an index into `stack_table`.
    pub sample_stacks: Vec<IndexIntoStackTable>,
}

impl CpuProfile {
    pub fn node(&self, id: NodeId) -> Option<&CpuProfileNode> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.nodes.get(idx)
    }

    /// Nodes that were sampled as leaves, by descending total time.
    pub fn hot_nodes(&self) -> Vec<&CpuProfileNode> {
        let mut nodes = self
            .nodes
            .iter()
            .filter(|node| node.hit_count > 0)
            .collect::<Vec<_>>();
        nodes.sort_by(|a, b| b.total_time.total_cmp(&a.total_time));
        nodes
    }
}

/// Hierarchical time-weighted view derived from a [`CpuProfile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlameGraphNode {
    pub name: String,
    /// Sample count.
    pub value: u64,
    pub children: Vec<FlameGraphNode>,
    pub self_time: Milliseconds,
    pub total_time: Milliseconds,
    /// Share of the profile duration, in percent.
    pub percentage: f64,
}

/// A caller-declared logical allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAllocation {
    pub id: String,
    pub size: Bytes,
    #[serde(rename = "type")]
    pub allocation_type: String,
    pub timestamp: Milliseconds,
    pub stack: Vec<CallFrame>,
}

/// Point-in-time memory state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapSnapshot {
    pub timestamp: Milliseconds,
    pub total_heap_size: Bytes,
    pub used_heap_size: Bytes,
    pub total_physical_size: Bytes,
    pub external_memory: Bytes,
    /// Bytes held by the tracked allocations at this instant.
    pub malloced_memory: Bytes,
    pub allocations: Vec<MemoryAllocation>,
}

/// Finalized memory measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryProfile {
    pub start_time: Milliseconds,
    pub end_time: Milliseconds,
    pub duration: Milliseconds,
    pub snapshots: Vec<HeapSnapshot>,
    pub peak_memory: Bytes,
    pub average_memory: f64,
    pub memory_leaks: Vec<MemoryAllocation>,
    /// Heap growth between the first and last snapshot, in bytes per second.
    pub growth_rate: f64,
}

/// Phase breakdown of one request, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTimings {
    pub dns_lookup: Milliseconds,
    pub tcp_connection: Milliseconds,
    pub tls_handshake: Milliseconds,
    pub first_byte: Milliseconds,
    pub content_download: Milliseconds,
    pub total: Milliseconds,
}

/// One recorded HTTP exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub id: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub request_size: Bytes,
    pub response_size: Bytes,
    pub timings: NetworkTimings,
    pub timestamp: Milliseconds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NetworkRequest {
    pub fn is_failed(&self) -> bool {
        self.status >= 400 || self.error.is_some()
    }
}

/// Finalized network measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    pub start_time: Milliseconds,
    pub end_time: Milliseconds,
    pub duration: Milliseconds,
    pub requests: Vec<NetworkRequest>,
    pub total_requests: usize,
    pub failed_requests: usize,
    pub total_bytes_transferred: Bytes,
    pub average_request_time: Milliseconds,
    pub slowest_request: Option<NetworkRequest>,
    pub fastest_request: Option<NetworkRequest>,
}

/// One `start()`/`stop()` cycle. A `None` profile means that dimension was
/// disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerSession {
    pub id: String,
    pub start_time: Milliseconds,
    pub end_time: Milliseconds,
    pub duration: Milliseconds,
    pub cpu_profile: Option<CpuProfile>,
    pub memory_profile: Option<MemoryProfile>,
    pub network_profile: Option<NetworkProfile>,
}

impl ProfilerSession {
    pub fn profile_count(&self) -> usize {
        [
            self.cpu_profile.is_some(),
            self.memory_profile.is_some(),
            self.network_profile.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Html,
    Markdown,
    Text,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportFormat::Json => "json",
            ReportFormat::Html => "html",
            ReportFormat::Markdown => "markdown",
            ReportFormat::Text => "text",
        };
        f.write_str(name)
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "html" => Ok(ReportFormat::Html),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            "text" | "txt" => Ok(ReportFormat::Text),
            other => Err(format!(
                "invalid report format `{other}`, it should be one of: json, html, markdown, text"
            )),
        }
    }
}

/// Rendered output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileReport {
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub format: ReportFormat,
    pub content: String,
    pub metadata: Map<String, Value>,
}
