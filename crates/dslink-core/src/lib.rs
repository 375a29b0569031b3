//! Core building blocks of the dslink field agent.
//!
//! This crate provides:
//! - `envelope` - Binary envelope codec for the uplink protocol
//! - `payload` - JSON payload schemas carried in envelopes
//! - `job` - Remote job types and events
//! - `config` - Agent properties and the drone config store
//! - Launcher and telemetry decoder traits

pub mod config;
pub mod envelope;
pub mod job;
pub mod payload;
pub mod traits;

pub use config::{AgentProperties, ConfigError, ConfigStore, Credentials};
pub use envelope::{Envelope, Opcode, ProtocolError};
pub use job::{JobEvent, JobId, JobSpec, JobState, JobStatus};
pub use payload::TelemetryMessage;
pub use traits::{JobLauncher, TelemetryDecoder};
