//! Remote job execution for the dslink field agent.
//!
//! Provides:
//! - Command building for the job launcher script
//! - Process-group spawning with executable resolution
//! - The single-slot job supervisor with streamed output

pub mod command;
pub mod launcher;
pub mod supervisor;

pub use command::{CommandBuilder, CommandParts};
pub use launcher::{ScriptLauncher, resolve_executable_path};
pub use supervisor::{JobHandle, JobSupervisor, LaunchError};
