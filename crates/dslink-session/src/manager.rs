//! Session manager: binds the agent to the remote monitor and tracks liveness.
//!
//! The session is `Unbound` until the monitor answers a credentials offer with
//! a token. Every tick counts as a miss; any inbound envelope clears the count.
//! When misses exceed the threshold the token is dropped and the next STATUS
//! offers credentials again.

use std::sync::Arc;

use dslink_core::{
    config::{ConfigError, ConfigStore},
    envelope::{Envelope, Opcode, ProtocolError},
    job::JobStatus,
    payload::StatusMsg,
};
use tokio::sync::Mutex;

/// Default number of silent ticks tolerated while bound.
pub const DEFAULT_LIVENESS_THRESHOLD: u32 = 5;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Observable session state.
///
/// A timeout is applied within a single tick and lands directly in `Unbound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Bound,
}

#[derive(Debug, Default)]
struct Session {
    token: String,
    liveness_misses: u32,
    credentials_offered: bool,
}

impl Session {
    fn state(&self) -> SessionState {
        if self.token.is_empty() {
            SessionState::Unbound
        } else {
            SessionState::Bound
        }
    }
}

/// Owns the session and builds the periodic STATUS envelope.
pub struct SessionManager {
    config: Arc<ConfigStore>,
    threshold: u32,
    session: Mutex<Session>,
}

impl SessionManager {
    /// Create an unbound session.
    #[must_use]
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self::with_threshold(config, DEFAULT_LIVENESS_THRESHOLD)
    }

    /// Create an unbound session with a custom liveness threshold.
    #[must_use]
    pub fn with_threshold(config: Arc<ConfigStore>, threshold: u32) -> Self {
        Self {
            config,
            threshold,
            session: Mutex::new(Session::default()),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state()
    }

    /// Current token; empty while unbound.
    pub async fn token(&self) -> String {
        self.session.lock().await.token.clone()
    }

    pub async fn liveness_misses(&self) -> u32 {
        self.session.lock().await.liveness_misses
    }

    /// Advance one tick and build the outbound STATUS envelope.
    ///
    /// While unbound the envelope offers credentials and the job slot; while
    /// bound it is a bare heartbeat.
    ///
    /// `job` is a snapshot the caller took under the job supervisor's own
    /// lock, not under this session's lock. A launch racing the tick may
    /// therefore show up one tick late in the offer.
    ///
    /// # Errors
    /// Returns error if credentials cannot be read or the offer cannot be
    /// serialized.
    pub async fn tick(&self, job: JobStatus) -> Result<Envelope, SessionError> {
        let mut session = self.session.lock().await;

        session.liveness_misses += 1;
        if session.liveness_misses > self.threshold {
            if session.state() == SessionState::Bound {
                tracing::warn!(
                    misses = session.liveness_misses,
                    "Session timed out, no traffic from monitor"
                );
            } else {
                tracing::debug!(misses = session.liveness_misses, "Monitor still silent");
            }
            session.token.clear();
            session.liveness_misses = 0;
        }

        match session.state() {
            SessionState::Bound => Ok(Envelope::from_payload(
                Opcode::Status,
                session.token.clone(),
                &StatusMsg::Status,
            )?),
            SessionState::Unbound => {
                let creds = self.config.credentials()?;
                let offer = StatusMsg::Connect {
                    email: creds.email,
                    password: creds.password,
                    serial_id: creds.serial_id,
                    code_status: job,
                };
                session.credentials_offered = true;
                Ok(Envelope::from_payload(Opcode::Status, String::new(), &offer)?)
            }
        }
    }

    /// Record an inbound envelope.
    ///
    /// Any envelope proves liveness. A token is adopted once credentials have
    /// been offered; a different token while bound replaces the current one.
    pub async fn on_envelope(&self, envelope: &Envelope) {
        let mut session = self.session.lock().await;
        session.liveness_misses = 0;

        if !envelope.has_token() || envelope.session_token == session.token {
            return;
        }

        match session.state() {
            SessionState::Bound => {
                tracing::warn!(
                    old = %session.token,
                    new = %envelope.session_token,
                    "Session changed"
                );
            }
            SessionState::Unbound if session.credentials_offered => {
                tracing::info!(token = %envelope.session_token, "Session established");
            }
            SessionState::Unbound => {
                tracing::debug!("Ignoring token received before credentials were offered");
                return;
            }
        }
        session.token.clone_from(&envelope.session_token);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use dslink_core::job::JobState;
    use serde_json::json;
    use tokio_test::assert_ok;

    use super::*;

    struct TempConfig(PathBuf);

    impl TempConfig {
        fn new() -> Self {
            let path = std::env::temp_dir()
                .join(format!("dslink-session-{}.json", uuid::Uuid::new_v4()));
            std::fs::write(
                &path,
                r#"{"email":"pilot@example.com","password":"pw","serialId":"1-rust"}"#,
            )
            .unwrap();
            Self(path)
        }

        fn store(&self) -> Arc<ConfigStore> {
            Arc::new(ConfigStore::open(&self.0).unwrap())
        }
    }

    impl Drop for TempConfig {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn inbound(token: &str) -> Envelope {
        Envelope::new(Opcode::Status, token, json!({"op": "status"}))
    }

    async fn bound(manager: &SessionManager, token: &str) {
        assert_ok!(manager.tick(JobStatus::idle()).await);
        manager.on_envelope(&inbound(token)).await;
        assert_eq!(manager.state().await, SessionState::Bound);
    }

    #[tokio::test]
    async fn unbound_tick_offers_credentials_then_binds() {
        let cfg = TempConfig::new();
        let manager = SessionManager::new(cfg.store());
        assert_eq!(manager.state().await, SessionState::Unbound);

        let status = assert_ok!(manager.tick(JobStatus::idle()).await);
        assert_eq!(status.opcode, Opcode::Status);
        assert!(!status.has_token());
        assert_eq!(status.payload["op"], "connect");
        assert_eq!(status.payload["email"], "pilot@example.com");
        assert_eq!(status.payload["serialId"], "1-rust");
        assert_eq!(status.payload["codeStatus"]["state"], "idle");

        manager.on_envelope(&inbound("abc123")).await;
        assert_eq!(manager.state().await, SessionState::Bound);
        assert_eq!(manager.token().await, "abc123");
    }

    #[tokio::test]
    async fn bound_tick_is_heartbeat() {
        let cfg = TempConfig::new();
        let manager = SessionManager::new(cfg.store());
        bound(&manager, "abc123").await;

        let status = assert_ok!(manager.tick(JobStatus::idle()).await);
        assert_eq!(status.session_token, "abc123");
        assert_eq!(status.payload, json!({"op": "status"}));
    }

    #[tokio::test]
    async fn times_out_on_sixth_silent_tick() {
        let cfg = TempConfig::new();
        let manager = SessionManager::new(cfg.store());
        bound(&manager, "abc123").await;

        for tick in 1..=5 {
            let status = assert_ok!(manager.tick(JobStatus::idle()).await);
            assert_eq!(manager.state().await, SessionState::Bound, "tick {tick}");
            assert_eq!(status.session_token, "abc123");
        }
        assert_eq!(manager.liveness_misses().await, 5);

        let status = assert_ok!(manager.tick(JobStatus::idle()).await);
        assert_eq!(manager.state().await, SessionState::Unbound);
        assert_eq!(manager.token().await, "");
        assert_eq!(manager.liveness_misses().await, 0);
        assert_eq!(status.payload["op"], "connect");
    }

    #[tokio::test]
    async fn any_opcode_resets_liveness() {
        let cfg = TempConfig::new();
        let manager = SessionManager::new(cfg.store());
        bound(&manager, "abc123").await;

        for opcode in [Opcode::Status, Opcode::Job, Opcode::Telemetry] {
            for _ in 0..4 {
                assert_ok!(manager.tick(JobStatus::idle()).await);
            }
            assert_eq!(manager.liveness_misses().await, 4);
            manager
                .on_envelope(&Envelope::new(opcode, "", json!({})))
                .await;
            assert_eq!(manager.liveness_misses().await, 0);
        }
        assert_eq!(manager.token().await, "abc123");
    }

    #[tokio::test]
    async fn token_before_offer_is_ignored() {
        let cfg = TempConfig::new();
        let manager = SessionManager::new(cfg.store());

        manager.on_envelope(&inbound("early")).await;
        assert_eq!(manager.state().await, SessionState::Unbound);
    }

    #[tokio::test]
    async fn new_token_replaces_current_one() {
        let cfg = TempConfig::new();
        let manager = SessionManager::new(cfg.store());
        bound(&manager, "abc123").await;

        manager.on_envelope(&inbound("def456")).await;
        assert_eq!(manager.token().await, "def456");
    }

    #[tokio::test]
    async fn offer_reports_running_job() {
        let cfg = TempConfig::new();
        let manager = SessionManager::with_threshold(cfg.store(), 2);
        let job = JobStatus {
            id: Some(uuid::Uuid::new_v4()),
            state: JobState::Running,
            exit_code: None,
        };

        let status = assert_ok!(manager.tick(job).await);
        assert_eq!(status.payload["codeStatus"]["state"], "running");
        assert_eq!(
            status.payload["codeStatus"]["id"],
            json!(job.id.map(|id| id.to_string()))
        );
    }
}
