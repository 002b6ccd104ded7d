//! Event-driven recording of HTTP request timings.
//!
//! The profiler performs no I/O of its own: an HTTP client reports each
//! exchange either in one go ([`NetworkProfiler::record_request`]) or in two
//! phases ([`NetworkProfiler::start_request`] when the request is sent,
//! [`NetworkProfiler::complete_request`] when it settles).

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    clock::Clock,
    error::{ProfilerError, ProfilerKind, ProfilerResult},
    schema::{Bytes, Milliseconds, NetworkProfile, NetworkRequest, NetworkTimings},
};

/// Requests slower than this are reported by [`NetworkProfiler::analyze_performance`].
pub const SLOW_REQUEST_THRESHOLD_MS: Milliseconds = 1_000.0;

/// Outcome of an in-flight request, reported to [`NetworkProfiler::complete_request`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestCompletion {
    pub status: u16,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub request_size: Bytes,
    pub response_size: Bytes,
    /// When omitted, the total is measured from `start_request`.
    pub timings: Option<NetworkTimings>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    method: String,
    url: String,
    started_at: Milliseconds,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStats {
    pub count: usize,
    pub failed: usize,
    pub total_time: Milliseconds,
    pub average_time: Milliseconds,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAnalysis {
    pub by_domain: BTreeMap<String, DomainStats>,
    pub by_method: BTreeMap<String, usize>,
    pub by_status: BTreeMap<u16, usize>,
    /// Requests above [`SLOW_REQUEST_THRESHOLD_MS`], slowest first.
    pub slow_requests: Vec<NetworkRequest>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bandwidth {
    pub upload: Bytes,
    pub download: Bytes,
    pub total: Bytes,
    pub average_bytes_per_second: f64,
}

pub struct NetworkProfiler {
    clock: Arc<dyn Clock>,
    requests: Vec<NetworkRequest>,
    pending: HashMap<String, PendingRequest>,
    /// Ids recorded or in flight during the current session.
    seen_ids: HashSet<String>,
    start_time: Option<Milliseconds>,
    end_time: Option<Milliseconds>,
}

impl NetworkProfiler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            requests: Vec::new(),
            pending: HashMap::new(),
            seen_ids: HashSet::new(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_none()
    }

    pub fn start(&mut self) -> ProfilerResult<()> {
        if self.is_running() {
            return Err(ProfilerError::AlreadyRunning(ProfilerKind::Network));
        }

        self.requests.clear();
        self.pending.clear();
        self.seen_ids.clear();
        self.start_time = Some(self.clock.now_ms());
        self.end_time = None;
        debug!("network profiler started");

        Ok(())
    }

    pub fn stop(&mut self) -> ProfilerResult<NetworkProfile> {
        let start_time = match self.start_time {
            Some(start_time) if self.end_time.is_none() => start_time,
            _ => return Err(ProfilerError::NotRunning(ProfilerKind::Network)),
        };

        let end_time = self.clock.now_ms();
        self.end_time = Some(end_time);
        if !self.pending.is_empty() {
            debug!(
                pending = self.pending.len(),
                "network profiler stopped with requests in flight"
            );
        }

        let profile = build_network_profile(start_time, end_time, self.requests.clone());
        debug!(
            requests = profile.total_requests,
            failed = profile.failed_requests,
            "network profiler stopped"
        );

        Ok(profile)
    }

    /// Records an exchange whose timings were measured elsewhere. Ignored
    /// while idle, and when the id was already used in this session.
    pub fn record_request(&mut self, request: NetworkRequest) {
        if !self.is_running() {
            debug!(id = %request.id, "network profiler idle, request ignored");
            return;
        }
        if !self.seen_ids.insert(request.id.clone()) {
            debug!(id = %request.id, "duplicate request id ignored");
            return;
        }
        self.requests.push(request);
    }

    /// Marks a request as in flight. Ignored while idle, and when the id was
    /// already used in this session.
    pub fn start_request(&mut self, id: impl Into<String>, method: impl Into<String>, url: impl Into<String>) {
        let id = id.into();
        if !self.is_running() {
            debug!(id = %id, "network profiler idle, request start ignored");
            return;
        }
        if !self.seen_ids.insert(id.clone()) {
            debug!(id = %id, "duplicate request id ignored");
            return;
        }

        let pending = PendingRequest {
            method: method.into(),
            url: url.into(),
            started_at: self.clock.now_ms(),
        };
        self.pending.insert(id, pending);
    }

    /// Settles a request started with [`NetworkProfiler::start_request`].
    /// Unknown ids (never started, or already completed) and completions
    /// while idle are ignored.
    pub fn complete_request(&mut self, id: &str, completion: RequestCompletion) {
        if !self.is_running() {
            debug!(id, "network profiler idle, completion ignored");
            return;
        }
        let Some(pending) = self.pending.remove(id) else {
            debug!(id, "completion for unknown request ignored");
            return;
        };

        let timings = completion.timings.unwrap_or_else(|| NetworkTimings {
            total: (self.clock.now_ms() - pending.started_at).max(0.0),
            ..Default::default()
        });

        self.requests.push(NetworkRequest {
            id: id.to_string(),
            method: pending.method,
            url: pending.url,
            status: completion.status,
            request_headers: completion.request_headers,
            response_headers: completion.response_headers,
            request_size: completion.request_size,
            response_size: completion.response_size,
            timings,
            timestamp: pending.started_at,
            error: completion.error,
        });
    }

    pub fn requests(&self) -> &[NetworkRequest] {
        &self.requests
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn analyze_performance(&self) -> NetworkAnalysis {
        analyze_requests(&self.requests)
    }

    /// Bytes moved over the elapsed session time (until now, while running).
    pub fn calculate_bandwidth(&self) -> Bandwidth {
        let upload = saturating_total(self.requests.iter().map(|r| r.request_size));
        let download = saturating_total(self.requests.iter().map(|r| r.response_size));
        let total = upload.saturating_add(download);

        let elapsed_seconds = match self.start_time {
            Some(start) => (self.end_time.unwrap_or_else(|| self.clock.now_ms()) - start) / 1000.0,
            None => 0.0,
        };
        let average_bytes_per_second = if elapsed_seconds > 0.0 {
            total as f64 / elapsed_seconds
        } else {
            0.0
        };

        Bandwidth {
            upload,
            download,
            total,
            average_bytes_per_second,
        }
    }
}

/// Aggregates recorded requests. Extremes keep the first request on ties.
pub fn build_network_profile(
    start_time: Milliseconds,
    end_time: Milliseconds,
    requests: Vec<NetworkRequest>,
) -> NetworkProfile {
    let total_requests = requests.len();
    let failed_requests = requests.iter().filter(|r| r.is_failed()).count();
    let total_bytes_transferred = saturating_total(
        requests
            .iter()
            .map(|r| r.request_size.saturating_add(r.response_size)),
    );
    let average_request_time = if requests.is_empty() {
        0.0
    } else {
        requests.iter().map(|r| r.timings.total).sum::<f64>() / total_requests as f64
    };

    let mut slowest: Option<&NetworkRequest> = None;
    let mut fastest: Option<&NetworkRequest> = None;
    for request in &requests {
        if slowest.is_none_or(|s| request.timings.total > s.timings.total) {
            slowest = Some(request);
        }
        if fastest.is_none_or(|f| request.timings.total < f.timings.total) {
            fastest = Some(request);
        }
    }
    let slowest_request = slowest.cloned();
    let fastest_request = fastest.cloned();

    NetworkProfile {
        start_time,
        end_time,
        duration: (end_time - start_time).max(0.0),
        requests,
        total_requests,
        failed_requests,
        total_bytes_transferred,
        average_request_time,
        slowest_request,
        fastest_request,
    }
}

fn saturating_total(sizes: impl Iterator<Item = Bytes>) -> Bytes {
    sizes.fold(0, Bytes::saturating_add)
}

/// Hostname of `url`, or `"unknown"` when it does not parse.
pub fn request_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn analyze_requests(requests: &[NetworkRequest]) -> NetworkAnalysis {
    let mut analysis = NetworkAnalysis::default();

    for request in requests {
        let domain = analysis
            .by_domain
            .entry(request_domain(&request.url))
            .or_default();
        domain.count += 1;
        domain.total_time += request.timings.total;
        if request.is_failed() {
            domain.failed += 1;
        }

        *analysis
            .by_method
            .entry(request.method.to_uppercase())
            .or_default() += 1;
        *analysis.by_status.entry(request.status).or_default() += 1;
    }

    for stats in analysis.by_domain.values_mut() {
        stats.average_time = stats.total_time / stats.count as f64;
    }

    analysis.slow_requests = requests
        .iter()
        .filter(|r| r.timings.total > SLOW_REQUEST_THRESHOLD_MS)
        .cloned()
        .collect();
    analysis
        .slow_requests
        .sort_by(|a, b| b.timings.total.total_cmp(&a.timings.total));

    analysis
}
