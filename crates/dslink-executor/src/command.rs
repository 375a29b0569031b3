//! Job command building.

use std::path::{Path, PathBuf};

use dslink_core::job::JobSource;
use thiserror::Error;

use crate::launcher::resolve_executable_path;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Launcher command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Launcher command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builds `<launcher> <execPath> --code|--id <value>` command lines.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Launcher command line, e.g. `python` or `python3 -u`.
    pub base: String,
    /// Script handed to the launcher.
    pub exec_path: PathBuf,
}

impl CommandBuilder {
    #[must_use]
    pub fn new(base: impl Into<String>, exec_path: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            exec_path: exec_path.into(),
        }
    }

    /// Build the command for one job.
    ///
    /// `exec_override` replaces the configured script path for this job only.
    ///
    /// # Errors
    /// Returns error if the launcher command is invalid.
    pub fn build(
        &self,
        source: &JobSource,
        exec_override: Option<&Path>,
    ) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let exec_path = exec_override.unwrap_or(&self.exec_path);
        parts.push(exec_path.to_string_lossy().into_owned());
        parts.extend(job_args(source));

        let program = parts.remove(0);
        Ok(CommandParts {
            program,
            args: parts,
        })
    }
}

/// Launcher arguments selecting what the job runs.
#[must_use]
pub fn job_args(source: &JobSource) -> [String; 2] {
    match source {
        JobSource::Snippet(code) => ["--code".into(), code.clone()],
        JobSource::Reference(id) => ["--id".into(), id.clone()],
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
}
