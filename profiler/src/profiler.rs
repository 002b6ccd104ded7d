//! The orchestrator: one profiling session at a time across the CPU, memory
//! and network dimensions, with a history of completed sessions.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    config::ProfilerConfig,
    cpu::CpuProfiler,
    error::{ProfilerError, ProfilerKind, ProfilerResult},
    memory::{MemoryProfiler, MemorySource, SystemMemorySource},
    network::{NetworkProfiler, RequestCompletion},
    report::{ReportOptions, generate_session_report},
    scheduler::{Scheduler, ThreadScheduler},
    schema::{
        Bytes, FlameGraphNode, HeapSnapshot, MemoryAllocation, Milliseconds, NetworkRequest,
        ProfileReport, ProfilerSession,
    },
    stack::{BacktraceSampler, ShadowStack, StackSampler},
    tree::build_flame_graph,
};

/// Collaborators shared by the sub-profilers.
#[derive(Clone)]
pub struct ProfilerRuntime {
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
    /// Shadow stack handed out by [`Profiler::stack`] for instrumentation.
    pub stack: ShadowStack,
    /// Stack read on every CPU sampling tick. The system runtime reads `stack`.
    pub cpu_sampler: Arc<dyn StackSampler>,
    /// Stack recorded with every tracked allocation.
    pub allocation_sampler: Arc<dyn StackSampler>,
    pub memory_source: Arc<dyn MemorySource>,
}

impl Default for ProfilerRuntime {
    fn default() -> Self {
        let stack = ShadowStack::new();
        Self {
            clock: Arc::new(SystemClock::new()),
            scheduler: Arc::new(ThreadScheduler),
            cpu_sampler: Arc::new(stack.clone()),
            stack,
            allocation_sampler: Arc::new(BacktraceSampler::default()),
            memory_source: Arc::new(SystemMemorySource::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerStats {
    pub total_sessions: usize,
    /// Dimension profiles produced across all sessions.
    pub total_profiles: usize,
    pub reports_generated: usize,
    pub total_profiling_time: Milliseconds,
    pub average_session_duration: Milliseconds,
}

#[derive(Debug)]
struct ActiveSession {
    id: String,
    start_time: Milliseconds,
}

pub struct Profiler {
    config: ProfilerConfig,
    clock: Arc<dyn Clock>,
    stack: ShadowStack,
    cpu: Option<CpuProfiler>,
    memory: Option<MemoryProfiler>,
    network: Option<NetworkProfiler>,
    current: Option<ActiveSession>,
    sessions: Vec<ProfilerSession>,
    stats: ProfilerStats,
    last_report: Option<ProfileReport>,
}

impl Profiler {
    pub fn new(config: ProfilerConfig) -> ProfilerResult<Self> {
        Self::with_runtime(config, ProfilerRuntime::default())
    }

    pub fn with_runtime(config: ProfilerConfig, runtime: ProfilerRuntime) -> ProfilerResult<Self> {
        config.validate()?;

        let cpu = config.enable_cpu.then(|| {
            CpuProfiler::new(
                config.cpu_interval(),
                runtime.clock.clone(),
                runtime.scheduler.clone(),
                runtime.cpu_sampler.clone(),
            )
        });
        let memory = config.enable_memory.then(|| {
            MemoryProfiler::new(
                config.memory_interval(),
                runtime.clock.clone(),
                runtime.scheduler.clone(),
                runtime.memory_source.clone(),
                runtime.allocation_sampler.clone(),
            )
        });
        let network = config
            .enable_network
            .then(|| NetworkProfiler::new(runtime.clock.clone()));

        Ok(Self {
            config,
            clock: runtime.clock,
            stack: runtime.stack,
            cpu,
            memory,
            network,
            current: None,
            sessions: Vec::new(),
            stats: ProfilerStats::default(),
            last_report: None,
        })
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Stack that instrumented code enters frames on, e.g. with
    /// [`profile_scope!`](crate::profile_scope).
    pub fn stack(&self) -> &ShadowStack {
        &self.stack
    }

    /// Starts every enabled dimension and returns the new session id.
    pub fn start(&mut self) -> ProfilerResult<String> {
        if self.current.is_some() {
            return Err(ProfilerError::AlreadyRunning(ProfilerKind::Session));
        }

        let id = Uuid::new_v4().to_string();
        let start_time = self.clock.now_ms();

        let started = self
            .cpu
            .as_mut()
            .map_or(Ok(()), CpuProfiler::start)
            .and_then(|()| self.memory.as_mut().map_or(Ok(()), MemoryProfiler::start))
            .and_then(|()| self.network.as_mut().map_or(Ok(()), NetworkProfiler::start));
        if let Err(err) = started {
            warn!(session_id = %id, error = %err, "failed to start profiling session");
            self.stop_running_dimensions();
            return Err(err);
        }

        info!(
            session_id = %id,
            cpu = self.cpu.is_some(),
            memory = self.memory.is_some(),
            network = self.network.is_some(),
            "profiling session started"
        );
        self.current = Some(ActiveSession {
            id: id.clone(),
            start_time,
        });

        Ok(id)
    }

    fn stop_running_dimensions(&mut self) {
        if let Some(cpu) = self.cpu.as_mut().filter(|cpu| cpu.is_running()) {
            if let Err(err) = cpu.stop() {
                debug!(error = %err, "failed to roll back the CPU profiler");
            }
        }
        if let Some(memory) = self.memory.as_mut().filter(|memory| memory.is_running()) {
            if let Err(err) = memory.stop() {
                debug!(error = %err, "failed to roll back the memory profiler");
            }
        }
        if let Some(network) = self.network.as_mut().filter(|network| network.is_running()) {
            if let Err(err) = network.stop() {
                debug!(error = %err, "failed to roll back the network profiler");
            }
        }
    }

    /// Stops every enabled dimension and records the finished session.
    pub fn stop(&mut self) -> ProfilerResult<ProfilerSession> {
        let active = self
            .current
            .take()
            .ok_or(ProfilerError::NotRunning(ProfilerKind::Session))?;

        let cpu_profile = self.cpu.as_mut().map(CpuProfiler::stop).transpose();
        let memory_profile = self.memory.as_mut().map(MemoryProfiler::stop).transpose();
        let network_profile = self.network.as_mut().map(NetworkProfiler::stop).transpose();
        let (cpu_profile, memory_profile, network_profile) =
            (cpu_profile?, memory_profile?, network_profile?);

        let (start_time, end_time, duration) = cpu_profile
            .as_ref()
            .map(|p| (p.start_time, p.end_time, p.duration))
            .or_else(|| {
                memory_profile
                    .as_ref()
                    .map(|p| (p.start_time, p.end_time, p.duration))
            })
            .or_else(|| {
                network_profile
                    .as_ref()
                    .map(|p| (p.start_time, p.end_time, p.duration))
            })
            .unwrap_or_else(|| {
                let end_time = self.clock.now_ms();
                (
                    active.start_time,
                    end_time,
                    (end_time - active.start_time).max(0.0),
                )
            });

        let session = ProfilerSession {
            id: active.id,
            start_time,
            end_time,
            duration,
            cpu_profile,
            memory_profile,
            network_profile,
        };

        self.stats.total_sessions += 1;
        self.stats.total_profiles += session.profile_count();
        self.stats.total_profiling_time += session.duration;
        self.stats.average_session_duration =
            self.stats.total_profiling_time / self.stats.total_sessions as f64;

        info!(
            session_id = %session.id,
            duration_ms = session.duration,
            profiles = session.profile_count(),
            "profiling session stopped"
        );

        if self.config.auto_report {
            let options = ReportOptions::new(self.config.report_format);
            match generate_session_report(&session, &options) {
                Ok(report) => self.keep_report(report),
                Err(err) => warn!(session_id = %session.id, error = %err, "automatic report failed"),
            }
        }

        self.sessions.push(session.clone());
        Ok(session)
    }

    /// Runs `f` inside a fresh session. The session is stopped whether `f`
    /// returns `Ok`, returns `Err` or panics; errors and panics from `f` are
    /// passed on unchanged.
    pub fn profile<T, E, F>(&mut self, f: F) -> Result<(T, ProfilerSession), E>
    where
        F: FnOnce(&mut Profiler) -> Result<T, E>,
        E: From<ProfilerError>,
    {
        self.start()?;

        match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(Ok(value)) => {
                let session = self.stop()?;
                Ok((value, session))
            }
            Ok(Err(err)) => {
                self.stop_after_failure();
                Err(err)
            }
            Err(payload) => {
                self.stop_after_failure();
                panic::resume_unwind(payload)
            }
        }
    }

    fn stop_after_failure(&mut self) {
        if let Err(err) = self.stop() {
            debug!(error = %err, "profiled work failed and the session could not be stopped");
        }
    }

    pub fn is_profiling_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current.as_ref().map(|active| active.id.as_str())
    }

    /// Combined report of `session_id`, or of the newest session, in the
    /// configured format.
    pub fn generate_report(&mut self, session_id: Option<&str>) -> ProfilerResult<ProfileReport> {
        let options = ReportOptions::new(self.config.report_format);
        self.generate_report_with(session_id, &options)
    }

    pub fn generate_report_with(
        &mut self,
        session_id: Option<&str>,
        options: &ReportOptions,
    ) -> ProfilerResult<ProfileReport> {
        let session = match session_id {
            Some(id) => self
                .get_session(id)
                .ok_or_else(|| ProfilerError::SessionNotFound(id.to_string()))?,
            None => self.sessions.last().ok_or(ProfilerError::NoSessions)?,
        };

        let report = generate_session_report(session, options)?;
        self.keep_report(report.clone());
        Ok(report)
    }

    fn keep_report(&mut self, report: ProfileReport) {
        self.stats.reports_generated += 1;
        self.last_report = Some(report);
    }

    pub fn last_report(&self) -> Option<&ProfileReport> {
        self.last_report.as_ref()
    }

    /// Flame graph of the newest session that recorded CPU samples.
    pub fn generate_flame_graph(&self) -> ProfilerResult<FlameGraphNode> {
        if self.cpu.is_none() {
            return Err(ProfilerError::Disabled(ProfilerKind::Cpu));
        }

        self.sessions
            .iter()
            .rev()
            .find_map(|session| session.cpu_profile.as_ref())
            .map(build_flame_graph)
            .ok_or(ProfilerError::NoSessions)
    }

    /// Takes one CPU sample immediately.
    pub fn capture_cpu_sample(&self) -> ProfilerResult<()> {
        self.cpu
            .as_ref()
            .ok_or(ProfilerError::Disabled(ProfilerKind::Cpu))?
            .capture_sample()
    }

    fn memory(&self) -> ProfilerResult<&MemoryProfiler> {
        self.memory
            .as_ref()
            .ok_or(ProfilerError::Disabled(ProfilerKind::Memory))
    }

    fn network(&mut self) -> ProfilerResult<&mut NetworkProfiler> {
        self.network
            .as_mut()
            .ok_or(ProfilerError::Disabled(ProfilerKind::Network))
    }

    pub fn take_memory_snapshot(&self) -> ProfilerResult<HeapSnapshot> {
        Ok(self.memory()?.take_snapshot())
    }

    pub fn track_allocation(
        &self,
        id: impl Into<String>,
        size: Bytes,
        allocation_type: impl Into<String>,
    ) -> ProfilerResult<MemoryAllocation> {
        Ok(self.memory()?.track_allocation(id, size, allocation_type))
    }

    pub fn untrack_allocation(&self, id: &str) -> ProfilerResult<Option<MemoryAllocation>> {
        Ok(self.memory()?.untrack_allocation(id))
    }

    pub fn detect_leaks(&self) -> ProfilerResult<Vec<MemoryAllocation>> {
        Ok(self.memory()?.detect_leaks())
    }

    pub fn record_network_request(&mut self, request: NetworkRequest) -> ProfilerResult<()> {
        self.network()?.record_request(request);
        Ok(())
    }

    pub fn start_network_request(
        &mut self,
        id: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> ProfilerResult<()> {
        self.network()?.start_request(id, method, url);
        Ok(())
    }

    pub fn complete_network_request(
        &mut self,
        id: &str,
        completion: RequestCompletion,
    ) -> ProfilerResult<()> {
        self.network()?.complete_request(id, completion);
        Ok(())
    }

    pub fn get_sessions(&self) -> &[ProfilerSession] {
        &self.sessions
    }

    pub fn get_session(&self, id: &str) -> Option<&ProfilerSession> {
        self.sessions.iter().find(|session| session.id == id)
    }

    pub fn get_stats(&self) -> ProfilerStats {
        self.stats
    }

    /// Forgets completed sessions. Statistics are kept.
    pub fn clear_sessions(&mut self) {
        self.sessions.clear();
    }

    /// Writes the session history as pretty JSON.
    pub fn save_sessions(&self, path: impl AsRef<Path>) -> ProfilerResult<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.sessions)?;
        Ok(())
    }
}

/// Reads a session history written by [`Profiler::save_sessions`].
pub fn load_sessions(path: impl AsRef<Path>) -> ProfilerResult<Vec<ProfilerSession>> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io};

    use parking_lot::Mutex;
    use pretty_assertions_sorted::assert_eq_sorted;
    use serde_json::Value;

    use super::*;
    use crate::{
        clock::ManualClock,
        memory::MemoryUsage,
        scheduler::{ManualScheduler, Task, TimerHandle},
        schema::{NetworkTimings, ReportFormat},
    };

    struct FixedSource(Bytes);

    impl MemorySource for FixedSource {
        fn usage(&self) -> MemoryUsage {
            MemoryUsage {
                total_heap_size: self.0 * 2,
                used_heap_size: self.0,
                total_physical_size: self.0,
                external_memory: 0,
            }
        }
    }

    /// Hands out `allowed` timers, then fails.
    struct LimitedScheduler {
        inner: ManualScheduler,
        allowed: Mutex<usize>,
    }

    impl Scheduler for LimitedScheduler {
        fn schedule_repeating(
            &self,
            interval: std::time::Duration,
            task: Task,
        ) -> ProfilerResult<TimerHandle> {
            let mut allowed = self.allowed.lock();
            if *allowed == 0 {
                return Err(io::Error::other("no timers left").into());
            }
            *allowed -= 1;
            self.inner.schedule_repeating(interval, task)
        }
    }

    struct Harness {
        scheduler: ManualScheduler,
        stack: ShadowStack,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::new(1_000.0);
            Self {
                scheduler: ManualScheduler::new(clock),
                stack: ShadowStack::new(),
            }
        }

        fn runtime(&self) -> ProfilerRuntime {
            ProfilerRuntime {
                clock: Arc::new(self.scheduler.clock().clone()),
                scheduler: Arc::new(self.scheduler.clone()),
                stack: self.stack.clone(),
                cpu_sampler: Arc::new(self.stack.clone()),
                allocation_sampler: Arc::new(self.stack.clone()),
                memory_source: Arc::new(FixedSource(4_096)),
            }
        }

        fn profiler(&self, config: ProfilerConfig) -> Profiler {
            Profiler::with_runtime(config, self.runtime()).unwrap()
        }
    }

    fn request(id: &str, status: u16) -> NetworkRequest {
        NetworkRequest {
            id: id.to_string(),
            method: "GET".to_string(),
            url: "https://api.test/items".to_string(),
            status,
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            request_size: 64,
            response_size: 256,
            timings: NetworkTimings {
                total: 12.0,
                ..Default::default()
            },
            timestamp: 1_000.0,
            error: None,
        }
    }

    #[test]
    fn session_lifecycle() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig::default());

        let id = profiler.start().unwrap();
        assert!(profiler.is_profiling_active());
        assert_eq!(profiler.current_session_id(), Some(id.as_str()));
        assert!(matches!(
            profiler.start(),
            Err(ProfilerError::AlreadyRunning(ProfilerKind::Session))
        ));

        {
            let _main = harness.stack.enter("main", "src/main.rs", 1, 1);
            harness.scheduler.advance(10.0);
        }
        let session = profiler.stop().unwrap();

        assert_eq!(session.id, id);
        assert_eq!(session.start_time, 1_000.0);
        assert_eq!(session.duration, 10.0);
        assert_eq!(session.profile_count(), 3);

        let cpu = session.cpu_profile.as_ref().unwrap();
        assert_eq!(cpu.samples.len(), 10);
        assert_eq!(cpu.nodes[0].function_name, "main");
        assert_eq!(session.memory_profile.as_ref().unwrap().snapshots.len(), 2);
        assert_eq!(harness.scheduler.active_timers(), 0);

        assert!(!profiler.is_profiling_active());
        assert_eq!(profiler.current_session_id(), None);
        assert!(matches!(
            profiler.stop(),
            Err(ProfilerError::NotRunning(ProfilerKind::Session))
        ));
        assert_eq!(profiler.get_sessions(), &[session]);
    }

    #[test]
    fn stats_accumulate() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig::default());

        for ms in [10.0, 30.0] {
            profiler.start().unwrap();
            harness.scheduler.advance(ms);
            profiler.stop().unwrap();
        }

        assert_eq_sorted!(
            profiler.get_stats(),
            ProfilerStats {
                total_sessions: 2,
                total_profiles: 6,
                reports_generated: 0,
                total_profiling_time: 40.0,
                average_session_duration: 20.0,
            }
        );
    }

    #[test]
    fn disabled_dimensions() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig {
            enable_cpu: false,
            enable_memory: false,
            enable_network: false,
            ..Default::default()
        });

        assert!(matches!(
            profiler.generate_flame_graph(),
            Err(ProfilerError::Disabled(ProfilerKind::Cpu))
        ));
        assert!(matches!(
            profiler.take_memory_snapshot(),
            Err(ProfilerError::Disabled(ProfilerKind::Memory))
        ));
        assert!(matches!(
            profiler.track_allocation("a", 1, "Buffer"),
            Err(ProfilerError::Disabled(ProfilerKind::Memory))
        ));
        assert!(matches!(
            profiler.record_network_request(request("r1", 200)),
            Err(ProfilerError::Disabled(ProfilerKind::Network))
        ));

        profiler.start().unwrap();
        harness.scheduler.advance(25.0);
        let session = profiler.stop().unwrap();

        assert_eq!(session.profile_count(), 0);
        assert!(session.cpu_profile.is_none());
        assert_eq!(session.duration, 25.0);
    }

    #[test]
    fn session_timing_falls_back_to_memory() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig {
            enable_cpu: false,
            ..Default::default()
        });

        profiler.start().unwrap();
        harness.scheduler.advance(250.0);
        let session = profiler.stop().unwrap();

        let memory = session.memory_profile.as_ref().unwrap();
        assert_eq!(session.duration, memory.duration);
        assert_eq!(memory.snapshots.len(), 4);
    }

    #[test]
    fn failed_start_rolls_back() {
        let harness = Harness::new();
        let runtime = ProfilerRuntime {
            scheduler: Arc::new(LimitedScheduler {
                inner: harness.scheduler.clone(),
                allowed: Mutex::new(1),
            }),
            ..harness.runtime()
        };
        let mut profiler = Profiler::with_runtime(ProfilerConfig::default(), runtime).unwrap();

        assert!(matches!(profiler.start(), Err(ProfilerError::IoError(_))));
        assert!(!profiler.is_profiling_active());
        assert_eq!(harness.scheduler.active_timers(), 0);
        assert!(matches!(
            profiler.stop(),
            Err(ProfilerError::NotRunning(ProfilerKind::Session))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let harness = Harness::new();
        let config = ProfilerConfig {
            memory_sample_interval: 0,
            ..Default::default()
        };

        assert!(matches!(
            Profiler::with_runtime(config, harness.runtime()),
            Err(ProfilerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn profile_returns_the_value_and_session() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig::default());

        let (value, session) = profiler
            .profile(|profiler| {
                profiler.record_network_request(request("r1", 200))?;
                profiler.start_network_request("r2", "POST", "https://api.test/items")?;
                harness.scheduler.advance(5.0);
                profiler.complete_network_request(
                    "r2",
                    RequestCompletion {
                        status: 201,
                        ..Default::default()
                    },
                )?;
                Ok::<_, ProfilerError>(42)
            })
            .unwrap();

        assert_eq!(value, 42);
        assert!(!profiler.is_profiling_active());
        let network = session.network_profile.unwrap();
        assert_eq!(network.total_requests, 2);
        assert_eq!(network.requests[1].timings.total, 5.0);
    }

    #[test]
    fn profile_stops_when_the_work_fails() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig::default());

        let result = profiler.profile(|_| -> Result<(), ProfilerError> {
            Err(ProfilerError::SessionNotFound("from the work".to_string()))
        });

        assert!(matches!(result, Err(ProfilerError::SessionNotFound(id)) if id == "from the work"));
        assert!(!profiler.is_profiling_active());
        assert_eq!(profiler.get_sessions().len(), 1);
        assert_eq!(harness.scheduler.active_timers(), 0);
    }

    #[test]
    fn profile_stops_when_the_work_panics() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig::default());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            profiler.profile(|_| -> Result<(), ProfilerError> { panic!("instrumented work panicked") })
        }));

        assert!(outcome.is_err());
        assert!(!profiler.is_profiling_active());
        assert_eq!(profiler.get_sessions().len(), 1);
    }

    #[test]
    fn profile_refuses_to_nest() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig::default());

        let result = profiler.profile(|profiler| profiler.profile(|_| Ok::<_, ProfilerError>(())));

        assert!(matches!(
            result,
            Err(ProfilerError::AlreadyRunning(ProfilerKind::Session))
        ));
        assert!(!profiler.is_profiling_active());
    }

    #[test]
    fn auto_report_and_explicit_reports_agree() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig {
            auto_report: true,
            report_format: ReportFormat::Html,
            ..Default::default()
        });

        profiler.start().unwrap();
        {
            let _handler = harness.stack.enter("handle_request", "src/server.rs", 40, 5);
            harness.scheduler.advance(20.0);
        }
        let session = profiler.stop().unwrap();

        let html = profiler.last_report().unwrap().clone();
        assert_eq!(html.format, ReportFormat::Html);
        assert_eq!(profiler.get_stats().reports_generated, 1);

        let json = profiler
            .generate_report_with(Some(&session.id), &ReportOptions::new(ReportFormat::Json))
            .unwrap();
        let parsed: Value = serde_json::from_str(&json.content).unwrap();
        let duration = parsed["cpu"]["duration"].as_f64().unwrap();
        let function = parsed["cpu"]["nodes"][0]["functionName"].as_str().unwrap();

        assert_eq!(duration, 20.0);
        assert!(html.content.contains(&format!("{duration:.2} ms")));
        assert!(html.content.contains(function));
        assert_eq!(profiler.get_stats().reports_generated, 2);
        assert_eq!(profiler.last_report(), Some(&json));
    }

    #[test]
    fn reports_need_a_session() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig::default());

        assert!(matches!(
            profiler.generate_report(None),
            Err(ProfilerError::NoSessions)
        ));
        assert!(matches!(
            profiler.generate_flame_graph(),
            Err(ProfilerError::NoSessions)
        ));

        profiler.start().unwrap();
        harness.scheduler.advance(3.0);
        profiler.stop().unwrap();

        assert!(matches!(
            profiler.generate_report(Some("missing")),
            Err(ProfilerError::SessionNotFound(id)) if id == "missing"
        ));
        assert!(profiler.generate_report(None).is_ok());

        let graph = profiler.generate_flame_graph().unwrap();
        assert_eq!(graph.value, 3);
        assert_eq!(graph.percentage, 100.0);

        profiler.clear_sessions();
        assert!(profiler.get_sessions().is_empty());
        assert_eq!(profiler.get_stats().total_sessions, 1);
    }

    #[test]
    fn leaks_through_the_facade() {
        let harness = Harness::new();
        let profiler = harness.profiler(ProfilerConfig::default());

        profiler.track_allocation("a", 1_024, "Buffer").unwrap();
        harness.scheduler.clock().advance(61_000.0);

        let leaks = profiler.detect_leaks().unwrap();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].id, "a");

        let removed = profiler.untrack_allocation("a").unwrap();
        assert_eq!(removed.map(|a| a.size), Some(1_024));
        assert!(profiler.detect_leaks().unwrap().is_empty());

        let snapshot = profiler.take_memory_snapshot().unwrap();
        assert_eq!(snapshot.used_heap_size, 4_096);
    }

    #[test]
    fn sessions_survive_a_round_trip_to_disk() {
        let harness = Harness::new();
        let mut profiler = harness.profiler(ProfilerConfig::default());

        profiler.start().unwrap();
        {
            let _main = harness.stack.enter("main", "src/main.rs", 1, 1);
            harness.scheduler.advance(4.0);
        }
        profiler.record_network_request(request("r1", 404)).unwrap();
        profiler.stop().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        profiler.save_sessions(&path).unwrap();

        let loaded = load_sessions(&path).unwrap();
        assert_eq_sorted!(loaded.as_slice(), profiler.get_sessions());
    }

    #[test]
    fn default_runtime_samples_the_profiler_stack() {
        let mut profiler = Profiler::new(ProfilerConfig {
            cpu_sample_interval: 1,
            enable_memory: false,
            enable_network: false,
            ..Default::default()
        })
        .unwrap();

        let (_, session) = profiler
            .profile(|profiler| {
                crate::profile_scope!(profiler.stack(), "busy_loop");
                let started = std::time::Instant::now();
                let mut acc = 0u64;
                while started.elapsed() < std::time::Duration::from_millis(50) {
                    acc = acc.wrapping_add(1);
                    if acc % 100_000 == 0 {
                        std::thread::yield_now();
                    }
                }
                Ok::<_, ProfilerError>(())
            })
            .unwrap();

        let cpu = session.cpu_profile.unwrap();
        let busy = cpu
            .nodes
            .iter()
            .find(|node| node.function_name == "busy_loop")
            .unwrap();
        assert!(busy.hit_count > 0);
        assert_eq!(profiler.stack().depth(), 0);
    }

    #[test]
    fn independent_profilers_do_not_share_state() {
        let harness = Harness::new();
        let mut first = harness.profiler(ProfilerConfig::default());
        let mut second = harness.profiler(ProfilerConfig::default());

        first.start().unwrap();
        second.start().unwrap();
        first.record_network_request(request("r1", 200)).unwrap();
        harness.scheduler.advance(2.0);

        let first = first.stop().unwrap();
        let second = second.stop().unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.network_profile.unwrap().total_requests, 1);
        assert_eq!(second.network_profile.unwrap().total_requests, 0);
    }
}
