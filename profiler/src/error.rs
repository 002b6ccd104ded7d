use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Component that raised a state-machine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfilerKind {
    Session,
    Cpu,
    Memory,
    Network,
}

impl fmt::Display for ProfilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProfilerKind::Session => "session",
            ProfilerKind::Cpu => "cpu",
            ProfilerKind::Memory => "memory",
            ProfilerKind::Network => "network",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("{0} profiler is already running")]
    AlreadyRunning(ProfilerKind),
    #[error("{0} profiler is not running")]
    NotRunning(ProfilerKind),
    #[error("{0} profiling is disabled in the configuration")]
    Disabled(ProfilerKind),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("no profiling session has been completed")]
    NoSessions,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type ProfilerResult<T> = Result<T, ProfilerError>;
