//! Spawns job processes from the configured launcher script.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use dslink_core::{
    job::JobSpec,
    traits::{ExecutorError, JobLauncher, SpawnedProcess},
};
use tokio::process::Command;

use crate::command::{CommandBuildError, CommandBuilder};

/// Resolve an executable by name.
///
/// Explicit paths (absolute or containing a separator) are used as-is when
/// they point at a file; anything else is looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Launches jobs as `<launcher> <execPath> --code|--id <value>`.
///
/// Each job runs in its own process group; the job supervisor kills the
/// whole group on shutdown. Dropping the child kills the group leader.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    command: CommandBuilder,
}

impl ScriptLauncher {
    #[must_use]
    pub fn new(launcher: impl Into<String>, exec_path: impl Into<PathBuf>) -> Self {
        Self {
            command: CommandBuilder::new(launcher, exec_path),
        }
    }
}

#[async_trait]
impl JobLauncher for ScriptLauncher {
    async fn spawn(&self, spec: &JobSpec) -> Result<SpawnedProcess, ExecutorError> {
        let (program, args) = self
            .command
            .build(&spec.source, spec.exec_path.as_deref())
            .map_err(|e| ExecutorError::CommandBuild(e.to_string()))?
            .into_resolved()
            .await
            .map_err(|e| match e {
                CommandBuildError::NotFound(p) => ExecutorError::ExecutableNotFound(p),
                other => ExecutorError::CommandBuild(other.to_string()),
            })?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(program = %program.display(), ?args, "Spawning job process");
        let child = cmd
            .group_spawn()
            .map_err(|e| ExecutorError::SpawnFailed(format!("{}: {e}", program.display())))?;
        let pid = child.id();

        Ok(SpawnedProcess { child, pid })
    }
}
