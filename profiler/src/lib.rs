//! Sampling CPU profiler, heap snapshotter and network request recorder,
//! orchestrated into profiling sessions and rendered as reports.
//!
//! ```no_run
//! use profiler::{Profiler, ProfilerConfig, profile_scope};
//!
//! let mut profiler = Profiler::new(ProfilerConfig::default())?;
//!
//! let (_, session) = profiler.profile(|profiler| {
//!     profile_scope!(profiler.stack(), "busy_work");
//!     std::thread::sleep(std::time::Duration::from_millis(20));
//!     Ok::<_, profiler::ProfilerError>(())
//! })?;
//! println!("{}", profiler.generate_report(Some(&session.id))?.content);
//! # Ok::<_, profiler::ProfilerError>(())
//! ```

pub mod clock;
pub mod config;
pub mod cpu;
pub mod error;
pub mod memory;
pub mod network;
pub mod profiler;
pub mod report;
pub mod scheduler;
pub mod schema;
pub mod stack;
pub mod tree;

pub use config::ProfilerConfig;
pub use error::{ProfilerError, ProfilerKind, ProfilerResult};
pub use profiler::{Profiler, ProfilerRuntime, ProfilerStats, load_sessions};
pub use report::ReportOptions;
pub use schema::{ProfileReport, ProfilerSession, ReportFormat};
pub use stack::ShadowStack;
