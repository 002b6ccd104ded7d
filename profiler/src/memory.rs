//! Periodic heap snapshots, tracked logical allocations and leak candidates.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use crate::{
    clock::Clock,
    error::{ProfilerError, ProfilerKind, ProfilerResult},
    scheduler::{Scheduler, TimerHandle},
    schema::{Bytes, HeapSnapshot, MemoryAllocation, MemoryProfile, Milliseconds},
    stack::StackSampler,
};

/// Allocations alive for longer than this are reported as leak candidates.
pub const LEAK_THRESHOLD_MS: Milliseconds = 60_000.0;

/// Heap figures reported by a [`MemorySource`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub total_heap_size: Bytes,
    pub used_heap_size: Bytes,
    pub total_physical_size: Bytes,
    pub external_memory: Bytes,
}

pub trait MemorySource: Send + Sync {
    fn usage(&self) -> MemoryUsage;
}

/// Reads the current process's memory through `sysinfo`: resident memory is
/// reported as used heap and physical size, virtual memory as total heap.
pub struct SystemMemorySource {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemorySource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SystemMemorySource {
    fn usage(&self) -> MemoryUsage {
        let Some(pid) = self.pid else {
            return MemoryUsage::default();
        };

        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );

        system
            .process(pid)
            .map(|process| MemoryUsage {
                total_heap_size: process.virtual_memory(),
                used_heap_size: process.memory(),
                total_physical_size: process.memory(),
                external_memory: 0,
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct MemoryState {
    snapshots: Vec<HeapSnapshot>,
    allocations: HashMap<String, MemoryAllocation>,
}

impl MemoryState {
    fn live_allocations(&self) -> Vec<MemoryAllocation> {
        let mut allocations = self.allocations.values().cloned().collect::<Vec<_>>();
        allocations.sort_by(|a, b| {
            a.timestamp
                .total_cmp(&b.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        allocations
    }
}

/// Everything the snapshot timer task needs, shared with the profiler.
#[derive(Clone)]
struct SnapshotContext {
    clock: Arc<dyn Clock>,
    source: Arc<dyn MemorySource>,
    state: Arc<Mutex<MemoryState>>,
}

impl SnapshotContext {
    fn snapshot(&self, record: bool) -> HeapSnapshot {
        let usage = self.source.usage();
        let now = self.clock.now_ms();

        let mut state = self.state.lock();
        let timestamp = state
            .snapshots
            .last()
            .map_or(now, |last| now.max(last.timestamp));
        let allocations = state.live_allocations();

        let snapshot = HeapSnapshot {
            timestamp,
            total_heap_size: usage.total_heap_size,
            used_heap_size: usage.used_heap_size,
            total_physical_size: usage.total_physical_size,
            external_memory: usage.external_memory,
            malloced_memory: allocations.iter().map(|allocation| allocation.size).sum(),
            allocations,
        };

        if record {
            state.snapshots.push(snapshot.clone());
        }
        snapshot
    }
}

struct Running {
    start_time: Milliseconds,
    timer: TimerHandle,
}

pub struct MemoryProfiler {
    snapshot_interval: Duration,
    context: SnapshotContext,
    scheduler: Arc<dyn Scheduler>,
    stack_sampler: Arc<dyn StackSampler>,
    running: Option<Running>,
}

impl MemoryProfiler {
    pub fn new(
        snapshot_interval: Duration,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        source: Arc<dyn MemorySource>,
        stack_sampler: Arc<dyn StackSampler>,
    ) -> Self {
        Self {
            snapshot_interval,
            context: SnapshotContext {
                clock,
                source,
                state: Default::default(),
            },
            scheduler,
            stack_sampler,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn snapshot_interval(&self) -> Duration {
        self.snapshot_interval
    }

    pub fn start(&mut self) -> ProfilerResult<()> {
        if self.running.is_some() {
            return Err(ProfilerError::AlreadyRunning(ProfilerKind::Memory));
        }

        self.context.state.lock().snapshots.clear();
        let start_time = self.context.clock.now_ms();
        self.context.snapshot(true);

        let task = {
            let context = self.context.clone();
            Box::new(move || {
                context.snapshot(true);
            })
        };
        let timer = self
            .scheduler
            .schedule_repeating(self.snapshot_interval, task)?;

        debug!(
            interval_ms = self.snapshot_interval.as_secs_f64() * 1000.0,
            "memory profiler started"
        );
        self.running = Some(Running { start_time, timer });

        Ok(())
    }

    pub fn stop(&mut self) -> ProfilerResult<MemoryProfile> {
        let Running { start_time, timer } = self
            .running
            .take()
            .ok_or(ProfilerError::NotRunning(ProfilerKind::Memory))?;

        timer.cancel();
        self.context.snapshot(true);
        let end_time = self.context.clock.now_ms();

        let snapshots = std::mem::take(&mut self.context.state.lock().snapshots);
        let used = snapshots
            .iter()
            .map(|snapshot| snapshot.used_heap_size)
            .collect::<Vec<_>>();
        let peak_memory = used.iter().copied().max().unwrap_or(0);
        let average_memory = if used.is_empty() {
            0.0
        } else {
            used.iter().map(|&bytes| bytes as f64).sum::<f64>() / used.len() as f64
        };

        let profile = MemoryProfile {
            start_time,
            end_time,
            duration: (end_time - start_time).max(0.0),
            peak_memory,
            average_memory,
            memory_leaks: self.detect_leaks(),
            growth_rate: growth_rate(&snapshots),
            snapshots,
        };

        debug!(
            snapshots = profile.snapshots.len(),
            peak_memory = profile.peak_memory,
            leaks = profile.memory_leaks.len(),
            "memory profiler stopped"
        );

        Ok(profile)
    }

    /// Takes a snapshot now. While running, it becomes part of the session.
    pub fn take_snapshot(&self) -> HeapSnapshot {
        self.context.snapshot(self.running.is_some())
    }

    /// Records a logical allocation, replacing any previous one with the
    /// same id. Works whether or not the profiler is running.
    pub fn track_allocation(
        &self,
        id: impl Into<String>,
        size: Bytes,
        allocation_type: impl Into<String>,
    ) -> MemoryAllocation {
        let timestamp = self.context.clock.now_ms();
        let allocation = MemoryAllocation {
            id: id.into(),
            size,
            allocation_type: allocation_type.into(),
            timestamp,
            stack: self.stack_sampler.sample(timestamp),
        };

        self.context
            .state
            .lock()
            .allocations
            .insert(allocation.id.clone(), allocation.clone());

        allocation
    }

    pub fn untrack_allocation(&self, id: &str) -> Option<MemoryAllocation> {
        self.context.state.lock().allocations.remove(id)
    }

    /// Live allocations, oldest first.
    pub fn tracked_allocations(&self) -> Vec<MemoryAllocation> {
        self.context.state.lock().live_allocations()
    }

    /// Tracked allocations older than [`LEAK_THRESHOLD_MS`], oldest first.
    pub fn detect_leaks(&self) -> Vec<MemoryAllocation> {
        let now = self.context.clock.now_ms();
        self.tracked_allocations()
            .into_iter()
            .filter(|allocation| now - allocation.timestamp > LEAK_THRESHOLD_MS)
            .collect()
    }

    /// Growth rate over the snapshots recorded so far in this session.
    pub fn growth_rate(&self) -> f64 {
        growth_rate(&self.context.state.lock().snapshots)
    }
}

/// Bytes per second between the first and last snapshot's used heap. Zero
/// with fewer than two snapshots or no elapsed time.
pub fn growth_rate(snapshots: &[HeapSnapshot]) -> f64 {
    let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
        return 0.0;
    };
    if snapshots.len() < 2 {
        return 0.0;
    }

    let elapsed_seconds = (last.timestamp - first.timestamp) / 1000.0;
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }

    (last.used_heap_size as f64 - first.used_heap_size as f64) / elapsed_seconds
}
