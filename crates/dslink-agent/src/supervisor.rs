//! Process supervisor: the agent's top-level restart loop.
//!
//! Each generation opens the config store, binds both sockets, starts the
//! session tick and wires inbound and outbound flows. A transport fault tears
//! the whole generation down, running job included; after a backoff the next
//! generation starts from scratch with a fresh, unbound session.

use std::sync::Arc;

use dslink_core::{
    config::{AgentProperties, ConfigError, ConfigStore},
    envelope::{Envelope, Opcode},
    payload::JobMsg,
    traits::JobLauncher,
};
use dslink_executor::{JobSupervisor, ScriptLauncher};
use dslink_session::{SessionError, SessionManager};
use dslink_transport::{TelemetryIngest, TransportError, Uplink, decoder_for};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::router::InboundRouter;

const FAULT_CHANNEL_CAPACITY: usize = 16;
const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// Agent error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Component task failed: {0}")]
    Task(String),
    #[error("Restart requested")]
    RestartRequested,
    #[error("Gave up after {restarts} consecutive restarts, last fault: {last}")]
    RestartLimit { restarts: u32, last: String },
}

impl AgentError {
    /// Whether the supervisor must stop instead of restarting.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::RestartLimit { .. })
    }
}

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    Restarting,
}

/// Asks the supervisor to tear down the current generation.
#[derive(Clone)]
pub struct FaultSender(mpsc::Sender<AgentError>);

impl FaultSender {
    /// Request a restart.
    pub fn raise(&self, fault: impl Into<AgentError>) {
        match self.0.try_send(fault.into()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(fault)) => {
                tracing::debug!("Restart already pending, dropping fault: {fault}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Supervisor gone, dropping fault");
            }
        }
    }
}

struct GenerationEnd {
    result: Result<(), AgentError>,
    saw_traffic: bool,
}

/// Runs generations of the agent until cancelled or a fatal error.
pub struct ProcessSupervisor {
    props: AgentProperties,
    launcher: Arc<dyn JobLauncher>,
    fault_tx: mpsc::Sender<AgentError>,
    fault_rx: mpsc::Receiver<AgentError>,
    state: watch::Sender<SupervisorState>,
}

impl ProcessSupervisor {
    /// Create a supervisor launching jobs with the configured script launcher.
    #[must_use]
    pub fn new(props: AgentProperties) -> Self {
        let launcher = Arc::new(ScriptLauncher::new(
            props.job.launcher.clone(),
            props.job.exec_path.clone(),
        ));
        Self::with_launcher(props, launcher)
    }

    #[must_use]
    pub fn with_launcher(props: AgentProperties, launcher: Arc<dyn JobLauncher>) -> Self {
        let (fault_tx, fault_rx) = mpsc::channel(FAULT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SupervisorState::Running);
        Self {
            props,
            launcher,
            fault_tx,
            fault_rx,
            state,
        }
    }

    #[must_use]
    pub fn fault_sender(&self) -> FaultSender {
        FaultSender(self.fault_tx.clone())
    }

    /// Observe lifecycle changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Run until cancelled.
    ///
    /// # Errors
    /// Returns error on a config failure or when the restart limit is reached.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), AgentError> {
        let mut restarts = 0u32;

        loop {
            self.state.send_replace(SupervisorState::Running);
            while self.fault_rx.try_recv().is_ok() {}

            let end = run_generation(
                &self.props,
                &self.launcher,
                &mut self.fault_rx,
                &cancel,
            )
            .await;
            if end.saw_traffic {
                restarts = 0;
            }

            let fault = match end.result {
                Ok(()) => {
                    tracing::info!("Agent stopped");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e,
            };

            if matches!(fault, AgentError::RestartRequested) {
                tracing::info!("Restart requested");
            } else {
                restarts += 1;
                tracing::error!(restarts, "Agent fault: {fault}");
                if let Some(limit) = self.props.restart_limit {
                    if restarts > limit {
                        return Err(AgentError::RestartLimit {
                            restarts: restarts - 1,
                            last: fault.to_string(),
                        });
                    }
                }
            }

            self.state.send_replace(SupervisorState::Restarting);
            let backoff = self.props.restart_backoff();
            tracing::info!(?backoff, "Restarting");
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Agent stopped during backoff");
                    return Ok(());
                }
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

async fn run_generation(
    props: &AgentProperties,
    launcher: &Arc<dyn JobLauncher>,
    faults: &mut mpsc::Receiver<AgentError>,
    cancel: &CancellationToken,
) -> GenerationEnd {
    let mut saw_traffic = false;

    let config = match ConfigStore::open(&props.config) {
        Ok(config) => Arc::new(config),
        Err(e) => return GenerationEnd { result: Err(e.into()), saw_traffic },
    };
    let session = Arc::new(SessionManager::with_threshold(
        Arc::clone(&config),
        props.liveness_threshold,
    ));

    let uplink = match Uplink::connect(&props.monitor.authority()).await {
        Ok(uplink) => Arc::new(uplink),
        Err(e) => return GenerationEnd { result: Err(e.into()), saw_traffic },
    };
    let ingest = match TelemetryIngest::bind(&props.mavlink, decoder_for(props.decoder)).await {
        Ok(ingest) => ingest,
        Err(e) => return GenerationEnd { result: Err(e.into()), saw_traffic },
    };

    let (job_tx, mut job_rx) = mpsc::channel(props.job_channel_capacity);
    let jobs = Arc::new(JobSupervisor::new(Arc::clone(launcher), job_tx));
    let mut router = InboundRouter::new(config, Arc::clone(&session), Arc::clone(&jobs));

    let generation = cancel.child_token();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let mut tasks = JoinSet::new();
    tasks.spawn(Arc::clone(&uplink).receive_loop(inbound_tx, generation.clone()));
    tasks.spawn(ingest.run(Arc::clone(&uplink), Arc::clone(&session), generation.clone()));

    let mut ticker = interval(props.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(monitor = %uplink.remote(), mavlink = %props.mavlink, "Agent running");

    let result = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break Ok(()),
            Some(joined) = tasks.join_next() => {
                break match joined {
                    Ok(Ok(())) => Err(AgentError::Task("component task exited".into())),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(AgentError::Task(e.to_string())),
                };
            }
            Some(fault) = faults.recv() => break Err(fault),
            _ = ticker.tick() => {
                let sent = match session.tick(jobs.status().await).await {
                    Ok(status) => send(&uplink, &status).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    break Err(e);
                }
            }
            Some(envelope) = inbound_rx.recv() => {
                saw_traffic = true;
                session.on_envelope(&envelope).await;
                router.route(&envelope).await;
            }
            Some(event) = job_rx.recv() => {
                let update = match Envelope::from_payload(
                    Opcode::Job,
                    session.token().await,
                    &JobMsg::from(&event),
                ) {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::warn!("Dropping job update: {e}");
                        continue;
                    }
                };
                if let Err(e) = send(&uplink, &update).await {
                    break Err(e);
                }
            }
        }
    };

    generation.cancel();
    drop(router);
    drop(job_rx);
    jobs.shutdown().await;
    tasks.shutdown().await;

    GenerationEnd { result, saw_traffic }
}

/// Send one envelope; only socket faults escalate.
async fn send(uplink: &Uplink, envelope: &Envelope) -> Result<(), AgentError> {
    match uplink.send(envelope).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_socket_fault() => Err(e.into()),
        Err(e) => {
            tracing::warn!(opcode = %envelope.opcode, "Dropping envelope: {e}");
            Ok(())
        }
    }
}
