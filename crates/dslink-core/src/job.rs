//! Remote job types shared by the job supervisor, session manager and uplink.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job identifier.
pub type JobId = Uuid;

/// Lifecycle state of the (single) remote job slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No job is running.
    #[default]
    Idle,
    /// A job process is alive.
    Running,
    /// The last job failed to spawn or was killed by a signal.
    Errored,
    /// The last job exited with a status code.
    Completed,
}

/// Snapshot of the job slot, reported to the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: Option<JobId>,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl JobStatus {
    /// The idle slot.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            id: None,
            state: JobState::Idle,
            exit_code: None,
        }
    }

    /// Whether a job is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Inline code, passed to the launcher as `--code <snippet>`.
    Snippet(String),
    /// Reference to stored code, passed as `--id <reference>`.
    Reference(String),
}

/// A request to run one remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub source: JobSource,

    /// Overrides the configured launcher script path.
    #[serde(default)]
    pub exec_path: Option<PathBuf>,
}

impl JobSpec {
    /// A job running an inline snippet.
    #[must_use]
    pub fn snippet(code: impl Into<String>) -> Self {
        Self {
            source: JobSource::Snippet(code.into()),
            exec_path: None,
        }
    }

    /// A job running a stored reference.
    #[must_use]
    pub fn reference(id: impl Into<String>) -> Self {
        Self {
            source: JobSource::Reference(id.into()),
            exec_path: None,
        }
    }
}

/// Events produced by a running job, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Process spawned.
    Started { id: JobId, pid: Option<u32> },
    /// One chunk of standard output.
    Stdout { id: JobId, chunk: String },
    /// One chunk of standard error.
    Stderr { id: JobId, chunk: String },
    /// Process exited with a status code.
    Completed { id: JobId, exit_code: i32 },
    /// Spawn failure or abnormal termination.
    Errored { id: JobId, message: String },
    /// A launch request was refused because a job is running.
    Declined { running: Option<JobId> },
}

