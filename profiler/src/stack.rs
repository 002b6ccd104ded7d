//! Call stack capture.
//!
//! Samplers return frames ordered from the outermost caller to the innermost
//! (leaf) frame. Two strategies are provided:
//!
//! - [`ShadowStack`]: a cooperative, logical call stack that instrumented code
//!   pushes onto with [`ShadowStack::enter`] (or [`profile_scope!`]). Because
//!   the stack is shared, a sampler running on a timer thread observes what
//!   the instrumented code is executing at that instant. Samples are only
//!   meaningful while one thread at a time enters frames on a given stack;
//!   give each instrumented thread its own stack otherwise.
//! - [`BacktraceSampler`]: walks the native stack of the *calling* thread. It
//!   is only meaningful when the caller is the code of interest, such as when
//!   recording where an allocation was tracked from.
//!
//! ```no_run
//! # use profiler::stack::ShadowStack;
//! let stack = ShadowStack::new();
//! {
//!     profiler::profile_scope!(stack, "parse_request");
//!     // ... work attributed to `parse_request` ...
//! }
//! ```

use std::{
    sync::{Arc, LazyLock},
    thread::{self, ThreadId},
};

use backtrace::Backtrace;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One stack frame observed at sample time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub function_name: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// When the frame was captured, in milliseconds since the Unix epoch.
    pub timestamp: f64,
}

impl CallFrame {
    pub fn new(
        function_name: impl Into<String>,
        file: impl Into<String>,
        line: u32,
        column: u32,
        timestamp: f64,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            file: file.into(),
            line,
            column,
            timestamp,
        }
    }

    /// Frame used to attribute samples taken while nothing was on the stack.
    pub fn idle(timestamp: f64) -> Self {
        Self::new("(idle)", "", 0, 0, timestamp)
    }
}

/// Captures the current logical call stack.
pub trait StackSampler: Send + Sync {
    /// Returns the frames live at `timestamp`, outermost first.
    fn sample(&self, timestamp: f64) -> Vec<CallFrame>;
}

#[derive(Debug, Clone)]
struct ShadowFrame {
    function_name: String,
    file: String,
    line: u32,
    column: u32,
    thread: ThreadId,
    seq: u64,
}

#[derive(Debug, Default)]
struct ShadowFrames {
    frames: Vec<ShadowFrame>,
    next_seq: u64,
}

/// Shared logical call stack maintained by instrumented code.
///
/// Clones share the same frames. Each frame remembers the thread that
/// entered it, so a guard only ever pops frames of its own thread; frames
/// entered concurrently by several threads are still sampled together, in
/// push order.
#[derive(Debug, Clone, Default)]
pub struct ShadowStack {
    frames: Arc<Mutex<ShadowFrames>>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a frame; it is popped when the returned guard drops.
    pub fn enter(
        &self,
        function_name: impl Into<String>,
        file: impl Into<String>,
        line: u32,
        column: u32,
    ) -> ShadowFrameGuard {
        let thread = thread::current().id();
        let mut shadow = self.frames.lock();
        let seq = shadow.next_seq;
        shadow.next_seq += 1;
        shadow.frames.push(ShadowFrame {
            function_name: function_name.into(),
            file: file.into(),
            line,
            column,
            thread,
            seq,
        });

        ShadowFrameGuard {
            frames: self.frames.clone(),
            thread,
            seq,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().frames.len()
    }
}

impl StackSampler for ShadowStack {
    fn sample(&self, timestamp: f64) -> Vec<CallFrame> {
        self.frames
            .lock()
            .frames
            .iter()
            .map(|frame| CallFrame {
                function_name: frame.function_name.clone(),
                file: frame.file.clone(),
                line: frame.line,
                column: frame.column,
                timestamp,
            })
            .collect()
    }
}

/// Pops its frame, and the frames its thread pushed after it, when dropped.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct ShadowFrameGuard {
    frames: Arc<Mutex<ShadowFrames>>,
    thread: ThreadId,
    seq: u64,
}

impl Drop for ShadowFrameGuard {
    fn drop(&mut self) {
        let (thread, seq) = (self.thread, self.seq);
        self.frames
            .lock()
            .frames
            .retain(|frame| frame.thread != thread || frame.seq < seq);
    }
}

/// Enters a [`ShadowStack`] frame named after the current source location,
/// for the rest of the enclosing block.
#[macro_export]
macro_rules! profile_scope {
    ($stack:expr, $name:expr) => {
        let _profile_scope_guard = $stack.enter($name, file!(), line!(), column!());
    };
}

static SYMBOL_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"::h[0-9a-f]{16}$").expect("hard-coded regex should be valid"));

// Frames belonging to the capture machinery itself.
static CAPTURE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<?(backtrace::|profiler::stack::|profiler::memory::MemoryProfiler|profiler::profiler::Profiler)")
        .expect("hard-coded regex should be valid")
});

/// Native stack sampler for the calling thread.
#[derive(Debug, Clone)]
pub struct BacktraceSampler {
    max_depth: usize,
}

impl BacktraceSampler {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Default for BacktraceSampler {
    fn default() -> Self {
        Self::new(32)
    }
}

impl StackSampler for BacktraceSampler {
    fn sample(&self, timestamp: f64) -> Vec<CallFrame> {
        let backtrace = Backtrace::new();

        let mut frames = backtrace
            .frames()
            .iter()
            .filter_map(|frame| frame.symbols().first())
            .map(|symbol| {
                let name = symbol
                    .name()
                    .map(|name| SYMBOL_HASH.replace(&name.to_string(), "").into_owned())
                    .unwrap_or_else(|| "<unknown>".to_string());
                let file = symbol
                    .filename()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();

                CallFrame {
                    function_name: name,
                    file,
                    line: symbol.lineno().unwrap_or(0),
                    column: symbol.colno().unwrap_or(0),
                    timestamp,
                }
            })
            .skip_while(|frame| CAPTURE_FRAME.is_match(&frame.function_name))
            .take(self.max_depth)
            .collect::<Vec<_>>();

        // Backtraces list the innermost frame first.
        frames.reverse();
        frames
    }
}
