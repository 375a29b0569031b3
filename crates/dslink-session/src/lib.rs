//! Session management for the dslink field agent.
//!
//! Provides:
//! - `SessionManager` - Session state machine and STATUS envelope builder

pub mod manager;

pub use manager::{DEFAULT_LIVENESS_THRESHOLD, SessionError, SessionManager, SessionState};
