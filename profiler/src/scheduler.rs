//! Repeating timers behind a trait, so sub-profilers can be driven by real
//! threads in production and by an explicitly advanced clock in tests.

use std::{
    sync::{
        Arc, Weak,
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    clock::{Clock, ManualClock},
    error::ProfilerResult,
};

pub type Task = Box<dyn FnMut() + Send + 'static>;

/// Invokes a task every `interval` until the returned handle is cancelled.
pub trait Scheduler: Send + Sync {
    fn schedule_repeating(&self, interval: Duration, task: Task) -> ProfilerResult<TimerHandle>;
}

/// Owner of a scheduled task. Cancelling, or dropping the handle, stops the
/// task; once `cancel` returns the task is not running and never runs again.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

/// Runs every task on its own thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule_repeating(&self, interval: Duration, mut task: Task) -> ProfilerResult<TimerHandle> {
        let (stop_sender, stop_receiver) = mpsc::channel::<()>();

        let worker = thread::Builder::new()
            .name("profiler-timer".to_string())
            .spawn(move || {
                loop {
                    match stop_receiver.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => task(),
                        // A message or a disconnected sender both mean stop.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(TimerHandle::new(move || {
            drop(stop_sender);
            if worker.join().is_err() {
                debug!("profiler timer thread panicked");
            }
        }))
    }
}

struct ManualTimer {
    id: u64,
    interval_ms: f64,
    next_due_ms: f64,
    // Taken out while the task runs, so the lock is not held during the call.
    task: Option<Task>,
}

#[derive(Default)]
struct ManualTimers {
    next_id: u64,
    entries: Vec<ManualTimer>,
}

/// Scheduler whose timers only fire from [`ManualScheduler::advance`].
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    timers: Arc<Mutex<ManualTimers>>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            timers: Default::default(),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn active_timers(&self) -> usize {
        self.timers.lock().entries.len()
    }

    /// Moves the clock forward by `ms`, firing every timer that falls due
    /// in deadline order. The clock reads the deadline while a task runs.
    pub fn advance(&self, ms: f64) {
        let target = self.clock.now_ms() + ms;

        loop {
            let next = {
                let mut timers = self.timers.lock();
                let due = timers
                    .entries
                    .iter_mut()
                    .filter(|entry| entry.task.is_some() && entry.next_due_ms <= target)
                    .min_by(|a, b| a.next_due_ms.total_cmp(&b.next_due_ms));

                match due {
                    Some(entry) => {
                        let due_ms = entry.next_due_ms;
                        entry.next_due_ms += entry.interval_ms;
                        entry.task.take().map(|task| (entry.id, due_ms, task))
                    }
                    None => None,
                }
            };

            let Some((id, due_ms, mut task)) = next else {
                break;
            };

            self.clock.set(due_ms);
            task();

            let mut timers = self.timers.lock();
            if let Some(entry) = timers.entries.iter_mut().find(|entry| entry.id == id) {
                entry.task = Some(task);
            }
        }

        self.clock.set(target);
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, interval: Duration, task: Task) -> ProfilerResult<TimerHandle> {
        let interval_ms = match interval.as_secs_f64() * 1000.0 {
            ms if ms > 0.0 => ms,
            _ => 1.0,
        };

        let id = {
            let mut timers = self.timers.lock();
            let id = timers.next_id;
            timers.next_id += 1;
            timers.entries.push(ManualTimer {
                id,
                interval_ms,
                next_due_ms: self.clock.now_ms() + interval_ms,
                task: Some(task),
            });
            id
        };

        let timers: Weak<Mutex<ManualTimers>> = Arc::downgrade(&self.timers);
        Ok(TimerHandle::new(move || {
            if let Some(timers) = timers.upgrade() {
                timers.lock().entries.retain(|entry| entry.id != id);
            }
        }))
    }
}
