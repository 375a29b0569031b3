//! Traits at the seams to external collaborators.

use async_trait::async_trait;
use thiserror::Error;

use crate::{job::JobSpec, payload::TelemetryMessage};

/// Spawned job process handle.
pub struct SpawnedProcess {
    /// Child process group. Killed when dropped.
    pub child: command_group::AsyncGroupChild,
    /// OS process id, if still known.
    pub pid: Option<u32>,
}

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command build error: {0}")]
    CommandBuild(String),
}

/// Starts job processes.
///
/// The job supervisor owns exclusivity and output streaming; a launcher only
/// turns a [`JobSpec`] into a running process with piped stdout/stderr.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Spawn a process for the given job.
    async fn spawn(&self, spec: &JobSpec) -> Result<SpawnedProcess, ExecutorError>;
}

/// Telemetry decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Boundary to the external telemetry frame decoder.
///
/// One raw datagram may yield zero, one or several messages.
pub trait TelemetryDecoder: Send + Sync {
    /// Decode one raw frame.
    fn decode(&self, frame: &[u8]) -> Result<Vec<TelemetryMessage>, DecodeError>;
}
