//! The dslink field agent.
//!
//! Wires the session manager, uplink, telemetry ingest and job supervisor
//! together under a restart loop.

pub mod router;
pub mod supervisor;

pub use router::InboundRouter;
pub use supervisor::{AgentError, FaultSender, ProcessSupervisor, SupervisorState};
