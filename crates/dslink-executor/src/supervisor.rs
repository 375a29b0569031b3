//! Remote job supervisor.
//!
//! Owns the single job slot. A launch is an atomic check-and-set on the slot;
//! once running, the job's output is streamed line by line over a bounded
//! channel, followed by exactly one terminal event. The slot then returns to
//! idle. The slot lock is never held while waiting for room in the channel.

use std::{io, process::ExitStatus, sync::Arc, time::Duration};

use dslink_core::{
    job::{JobEvent, JobId, JobSpec, JobState, JobStatus},
    traits::{ExecutorError, JobLauncher, SpawnedProcess},
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::{Mutex, mpsc},
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Launch refusal.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("A job is already running")]
    AlreadyRunning { running: Option<JobId> },
    #[error("Job failed to start: {0}")]
    Spawn(#[from] ExecutorError),
}

#[derive(Clone)]
struct ActiveJob {
    id: JobId,
    kill: CancellationToken,
    done: CancellationToken,
}

#[derive(Default)]
struct Slot {
    status: JobStatus,
    active: Option<ActiveJob>,
}

impl Slot {
    /// Record a state for `status.id`, unless another job owns the slot.
    fn settle(&mut self, status: JobStatus) {
        if self.status.id == status.id {
            self.status = status;
        }
    }

    /// Back to idle, unless another job owns the slot.
    fn release(&mut self, id: JobId) {
        if self.status.id == Some(id) {
            self.status = JobStatus::idle();
            self.active = None;
        }
    }
}

/// Handle to a launched job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    pid: Option<u32>,
    task: JoinHandle<()>,
}

impl JobHandle {
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait until the job has finished and its terminal event is queued.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::error!(job_id = %self.id, "Job task failed: {e}");
            }
        }
    }
}

/// Runs at most one job at a time.
pub struct JobSupervisor {
    launcher: Arc<dyn JobLauncher>,
    events: mpsc::Sender<JobEvent>,
    slot: Arc<Mutex<Slot>>,
}

impl JobSupervisor {
    #[must_use]
    pub fn new(launcher: Arc<dyn JobLauncher>, events: mpsc::Sender<JobEvent>) -> Self {
        Self {
            launcher,
            events,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Current job slot.
    pub async fn status(&self) -> JobStatus {
        self.slot.lock().await.status
    }

    /// Launch a job unless one is already running.
    ///
    /// On success a `Started` event has already been queued when this returns.
    /// A spawn failure is reported both as an `Errored` event and as the
    /// returned error; the slot passes through `Errored` and is idle again
    /// afterwards.
    ///
    /// # Errors
    /// Returns [`LaunchError::AlreadyRunning`] if the slot is busy, or
    /// [`LaunchError::Spawn`] if the process could not be started.
    pub async fn try_launch(&self, spec: JobSpec) -> Result<JobHandle, LaunchError> {
        // Room for the first event is taken before the slot lock.
        let permit = self.events.reserve().await.ok();

        let mut slot = self.slot.lock().await;
        if slot.status.is_running() {
            return Err(LaunchError::AlreadyRunning {
                running: slot.status.id,
            });
        }

        let id = Uuid::new_v4();
        let process = match self.launcher.spawn(&spec).await {
            Ok(process) => process,
            Err(e) => {
                tracing::warn!(job_id = %id, "Job spawn failed: {e}");
                slot.status = JobStatus {
                    id: Some(id),
                    state: JobState::Errored,
                    exit_code: None,
                };
                slot.active = None;
                drop(slot);

                let event = JobEvent::Errored {
                    id,
                    message: e.to_string(),
                };
                match permit {
                    Some(permit) => permit.send(event),
                    None => tracing::debug!(job_id = %id, "Job event receiver dropped"),
                }
                self.slot.lock().await.release(id);
                return Err(e.into());
            }
        };

        let pid = process.pid;
        let active = ActiveJob {
            id,
            kill: CancellationToken::new(),
            done: CancellationToken::new(),
        };
        slot.status = JobStatus {
            id: Some(id),
            state: JobState::Running,
            exit_code: None,
        };
        slot.active = Some(active.clone());
        match permit {
            Some(permit) => permit.send(JobEvent::Started { id, pid }),
            None => tracing::debug!(job_id = %id, "Job event receiver dropped"),
        }
        tracing::info!(job_id = %id, ?pid, "Job started");

        let task = tokio::spawn(run_job(
            process,
            self.events.clone(),
            Arc::clone(&self.slot),
            active,
        ));

        Ok(JobHandle { id, pid, task })
    }

    /// Report a refused launch on the event channel.
    pub async fn decline(&self, running: Option<JobId>) {
        if self.events.send(JobEvent::Declined { running }).await.is_err() {
            tracing::debug!("Job event receiver dropped");
        }
    }

    /// Kill the running job's process group, if any, and free the slot.
    pub async fn shutdown(&self) {
        let Some(active) = self.slot.lock().await.active.clone() else {
            return;
        };

        tracing::info!(job_id = %active.id, "Killing running job");
        active.kill.cancel();
        if timeout(KILL_TIMEOUT, active.done.cancelled()).await.is_err() {
            tracing::warn!(job_id = %active.id, "Job still running after kill");
        }
        self.slot.lock().await.release(active.id);
    }
}

impl Drop for JobSupervisor {
    fn drop(&mut self) {
        if let Ok(slot) = self.slot.try_lock() {
            if let Some(active) = &slot.active {
                active.kill.cancel();
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

async fn run_job(
    mut process: SpawnedProcess,
    events: mpsc::Sender<JobEvent>,
    slot: Arc<Mutex<Slot>>,
    active: ActiveJob,
) {
    let ActiveJob { id, kill, done } = active;
    let _done = done.drop_guard();

    let exited = tokio::select! {
        biased;

        () = kill.cancelled() => None,
        exited = stream_until_exit(id, &mut process, &events) => Some(exited),
    };

    let (terminal, state) = match exited {
        Some(exited) => terminal_for(id, exited),
        None => {
            if let Err(e) = process.child.kill().await {
                tracing::warn!(job_id = %id, "Failed to kill job: {e}");
            }
            (
                JobEvent::Errored {
                    id,
                    message: "App killed.".into(),
                },
                JobStatus {
                    id: Some(id),
                    state: JobState::Errored,
                    exit_code: None,
                },
            )
        }
    };

    slot.lock().await.settle(state);
    tracing::info!(job_id = %id, state = ?state.state, exit_code = ?state.exit_code, "Job finished");

    if kill.is_cancelled() {
        if events.try_send(terminal).is_err() {
            tracing::debug!(job_id = %id, "Dropping terminal event of killed job");
        }
    } else {
        tokio::select! {
            biased;

            () = kill.cancelled() => {
                tracing::debug!(job_id = %id, "Dropping terminal event of killed job");
            }
            sent = events.send(terminal) => {
                if sent.is_err() {
                    tracing::debug!(job_id = %id, "Job event receiver dropped");
                }
            }
        }
    }

    slot.lock().await.release(id);
}

/// Forward both pipes until they close, then reap the process.
async fn stream_until_exit(
    id: JobId,
    process: &mut SpawnedProcess,
    events: &mpsc::Sender<JobEvent>,
) -> io::Result<ExitStatus> {
    let mut readers = JoinSet::new();
    if let Some(stdout) = process.child.inner().stdout.take() {
        readers.spawn(forward_lines(id, Pipe::Stdout, stdout, events.clone()));
    }
    if let Some(stderr) = process.child.inner().stderr.take() {
        readers.spawn(forward_lines(id, Pipe::Stderr, stderr, events.clone()));
    }
    while readers.join_next().await.is_some() {}

    process.child.wait().await
}

fn terminal_for(id: JobId, exited: io::Result<ExitStatus>) -> (JobEvent, JobStatus) {
    let errored = JobStatus {
        id: Some(id),
        state: JobState::Errored,
        exit_code: None,
    };
    match exited {
        Ok(status) => match status.code() {
            Some(exit_code) => (
                JobEvent::Completed { id, exit_code },
                JobStatus {
                    id: Some(id),
                    state: JobState::Completed,
                    exit_code: Some(exit_code),
                },
            ),
            None => (
                JobEvent::Errored {
                    id,
                    message: format!("App terminated abnormally ({status})."),
                },
                errored,
            ),
        },
        Err(e) => (
            JobEvent::Errored {
                id,
                message: format!("Failed to wait for job: {e}"),
            },
            errored,
        ),
    }
}

async fn forward_lines<R>(id: JobId, pipe: Pipe, reader: R, events: mpsc::Sender<JobEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buffer).into_owned();
                let event = match pipe {
                    Pipe::Stdout => JobEvent::Stdout { id, chunk },
                    Pipe::Stderr => JobEvent::Stderr { id, chunk },
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %id, "Error reading job output: {e}");
                break;
            }
        }
    }
}
