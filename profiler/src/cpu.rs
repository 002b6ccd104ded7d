//! Timer-driven CPU sampling and call-site aggregation.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    clock::Clock,
    error::{ProfilerError, ProfilerKind, ProfilerResult},
    scheduler::{Scheduler, TimerHandle},
    schema::{CpuProfile, CpuProfileNode, IndexIntoStackTable, Milliseconds, NodeId, StackTable},
    stack::{CallFrame, StackSampler},
};

/// A raw observation of the call stack, before aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSample {
    pub timestamp: Milliseconds,
    /// Outermost frame first.
    pub frames: Vec<CallFrame>,
}

struct Running {
    start_time: Milliseconds,
    timer: TimerHandle,
}

pub struct CpuProfiler {
    sample_interval: Duration,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    sampler: Arc<dyn StackSampler>,
    samples: Arc<Mutex<Vec<StackSample>>>,
    running: Option<Running>,
}

impl CpuProfiler {
    pub fn new(
        sample_interval: Duration,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        sampler: Arc<dyn StackSampler>,
    ) -> Self {
        Self {
            sample_interval,
            clock,
            scheduler,
            sampler,
            samples: Default::default(),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn start(&mut self) -> ProfilerResult<()> {
        if self.running.is_some() {
            return Err(ProfilerError::AlreadyRunning(ProfilerKind::Cpu));
        }

        self.samples.lock().clear();
        let start_time = self.clock.now_ms();

        let task = {
            let clock = self.clock.clone();
            let sampler = self.sampler.clone();
            let samples = self.samples.clone();
            Box::new(move || {
                let sample = take_sample(clock.as_ref(), sampler.as_ref());
                samples.lock().push(sample);
            })
        };
        let timer = self.scheduler.schedule_repeating(self.sample_interval, task)?;

        debug!(
            interval_ms = self.sample_interval.as_secs_f64() * 1000.0,
            "cpu profiler started"
        );
        self.running = Some(Running { start_time, timer });

        Ok(())
    }

    /// Takes one sample right away, outside of the timer.
    pub fn capture_sample(&self) -> ProfilerResult<()> {
        if self.running.is_none() {
            return Err(ProfilerError::NotRunning(ProfilerKind::Cpu));
        }

        let sample = take_sample(self.clock.as_ref(), self.sampler.as_ref());
        self.samples.lock().push(sample);

        Ok(())
    }

    pub fn stop(&mut self) -> ProfilerResult<CpuProfile> {
        let Running { start_time, timer } = self
            .running
            .take()
            .ok_or(ProfilerError::NotRunning(ProfilerKind::Cpu))?;

        // The timer task locks the sample buffer, so cancel before locking.
        timer.cancel();
        let end_time = self.clock.now_ms();

        let samples = std::mem::take(&mut *self.samples.lock());
        let profile = build_cpu_profile(
            start_time,
            end_time,
            self.sample_interval.as_secs_f64() * 1000.0,
            &samples,
        );

        debug!(
            samples = profile.samples.len(),
            nodes = profile.nodes.len(),
            duration_ms = profile.duration,
            "cpu profiler stopped"
        );

        Ok(profile)
    }
}

fn take_sample(clock: &dyn Clock, sampler: &dyn StackSampler) -> StackSample {
    let timestamp = clock.now_ms();
    StackSample {
        timestamp,
        frames: sampler.sample(timestamp),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FrameKey {
    function_name: String,
    file: String,
    line: u32,
    column: u32,
}

impl From<&CallFrame> for FrameKey {
    fn from(frame: &CallFrame) -> Self {
        Self {
            function_name: frame.function_name.clone(),
            file: frame.file.clone(),
            line: frame.line,
            column: frame.column,
        }
    }
}

/// Append-only node arena, with a key index for stable ids.
#[derive(Default)]
struct NodeRegistry {
    nodes: Vec<CpuProfileNode>,
    index: HashMap<FrameKey, usize>,
}

impl NodeRegistry {
    fn intern(&mut self, frame: &CallFrame) -> usize {
        let key = FrameKey::from(frame);
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }

        let idx = self.nodes.len();
        self.nodes.push(CpuProfileNode {
            id: node_id(idx),
            function_name: key.function_name.clone(),
            file: key.file.clone(),
            line: key.line,
            column: key.column,
            hit_count: 0,
            children: Vec::new(),
            self_time: 0.0,
            total_time: 0.0,
        });
        self.index.insert(key, idx);

        idx
    }

    fn link(&mut self, parent: usize, child: usize) {
        let child_id = self.nodes[child].id;
        let children = &mut self.nodes[parent].children;
        if !children.contains(&child_id) {
            children.push(child_id);
        }
    }
}

fn node_id(idx: usize) -> NodeId {
    NodeId::try_from(idx + 1).unwrap_or(NodeId::MAX)
}

#[derive(Default)]
struct StackInterner {
    table: StackTable,
    index: HashMap<(Option<IndexIntoStackTable>, NodeId), IndexIntoStackTable>,
}

impl StackInterner {
    fn intern(
        &mut self,
        prefix: Option<IndexIntoStackTable>,
        node: NodeId,
    ) -> IndexIntoStackTable {
        *self.index.entry((prefix, node)).or_insert_with(|| {
            self.table.node.push(node);
            self.table.prefix.push(prefix);
            self.table.length += 1;
            self.table.length - 1
        })
    }
}

/// Aggregates raw samples into a [`CpuProfile`].
///
/// Every sample is attributed to its innermost frame: that node gains one
/// hit and `sample_interval` of self and total time. Each distinct caller in
/// the stack gains `sample_interval` of total time once per sample. Samples
/// with an empty stack are attributed to an `(idle)` node.
pub fn build_cpu_profile(
    start_time: Milliseconds,
    end_time: Milliseconds,
    sample_interval: Milliseconds,
    samples: &[StackSample],
) -> CpuProfile {
    let mut registry = NodeRegistry::default();
    let mut stacks = StackInterner::default();

    let mut sample_ids = Vec::with_capacity(samples.len());
    let mut sample_stacks = Vec::with_capacity(samples.len());
    let mut time_deltas = Vec::with_capacity(samples.len());
    let mut previous_timestamp = start_time;

    for sample in samples {
        let idle;
        let frames: &[CallFrame] = if sample.frames.is_empty() {
            idle = [CallFrame::idle(sample.timestamp)];
            &idle
        } else {
            &sample.frames
        };

        let mut seen = HashSet::new();
        let mut parent = None;
        let mut stack = None;
        for frame in frames {
            let node = registry.intern(frame);
            if let Some(parent) = parent {
                registry.link(parent, node);
            }
            if seen.insert(node) {
                registry.nodes[node].total_time += sample_interval;
            }
            stack = Some(stacks.intern(stack, registry.nodes[node].id));
            parent = Some(node);
        }

        // `frames` is never empty, so both are set.
        let (Some(leaf), Some(stack)) = (parent, stack) else {
            continue;
        };
        let leaf = &mut registry.nodes[leaf];
        leaf.hit_count += 1;
        leaf.self_time += sample_interval;

        sample_ids.push(leaf.id);
        sample_stacks.push(stack);
        time_deltas.push((sample.timestamp - previous_timestamp).max(0.0));
        previous_timestamp = sample.timestamp;
    }

    CpuProfile {
        start_time,
        end_time,
        duration: (end_time - start_time).max(0.0),
        sample_interval,
        nodes: registry.nodes,
        samples: sample_ids,
        time_deltas,
        stack_table: stacks.table,
        sample_stacks,
    }
}
