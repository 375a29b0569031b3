//! Inbound envelope routing.

use std::sync::Arc;

use dslink_core::{
    config::ConfigStore,
    envelope::{Envelope, Opcode},
    payload::MonitorMsg,
};
use dslink_executor::{JobSupervisor, LaunchError};
use dslink_session::{SessionManager, SessionState};
use tokio::task::JoinSet;

/// Acts on monitor messages: persists drone metadata and launches jobs.
///
/// Requests are honoured only from a bound session and only when the envelope
/// carries the current token. Launches run on their own tasks so that the job
/// event channel keeps draining while a launch waits for room in it. Dropping
/// the router aborts launches still in flight.
pub struct InboundRouter {
    config: Arc<ConfigStore>,
    session: Arc<SessionManager>,
    jobs: Arc<JobSupervisor>,
    launches: JoinSet<()>,
}

impl InboundRouter {
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        session: Arc<SessionManager>,
        jobs: Arc<JobSupervisor>,
    ) -> Self {
        Self {
            config,
            session,
            jobs,
            launches: JoinSet::new(),
        }
    }

    /// Handle one inbound envelope.
    ///
    /// Only STATUS payloads carry monitor requests; other opcodes just prove
    /// liveness, which the session manager has already recorded.
    pub async fn route(&mut self, envelope: &Envelope) {
        while self.launches.try_join_next().is_some() {}

        if envelope.opcode != Opcode::Status {
            tracing::debug!(opcode = %envelope.opcode, "Ignoring inbound payload");
            return;
        }

        let msg: MonitorMsg = match envelope.payload_as() {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Invalid monitor message: {e}");
                return;
            }
        };

        let spec = msg.job_request();
        if msg.drone.is_none() && spec.is_none() {
            return;
        }
        if !self.authorized(envelope).await {
            tracing::warn!(
                token = %envelope.session_token,
                "Refusing monitor request outside the current session"
            );
            return;
        }

        if let Some(drone) = msg.drone {
            self.persist_drone(drone).await;
        }

        if let Some(spec) = spec {
            let jobs = Arc::clone(&self.jobs);
            self.launches.spawn(async move {
                match jobs.try_launch(spec).await {
                    Ok(handle) => {
                        tracing::info!(job_id = %handle.id(), pid = ?handle.pid(), "Job accepted");
                    }
                    Err(LaunchError::AlreadyRunning { running }) => {
                        tracing::info!(running = ?running, "Job request declined");
                        jobs.decline(running).await;
                    }
                    // Already reported on the job event channel.
                    Err(LaunchError::Spawn(_)) => {}
                }
            });
        }
    }

    async fn authorized(&self, envelope: &Envelope) -> bool {
        self.session.state().await == SessionState::Bound
            && envelope.session_token == self.session.token().await
    }

    async fn persist_drone(&self, drone: serde_json::Value) {
        let config = Arc::clone(&self.config);
        match tokio::task::spawn_blocking(move || config.update_drone(drone)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to persist drone metadata: {e}"),
            Err(e) => tracing::error!("Drone metadata task failed: {e}"),
        }
    }
}
