//! dslink field agent binary.
//!
//! Relays local telemetry to the remote monitor, keeps the monitor session
//! alive and runs jobs the monitor asks for.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
#[cfg(unix)]
use dslink_agent::{AgentError, FaultSender};
use dslink_agent::ProcessSupervisor;
use dslink_core::config::{AgentProperties, MonitorAddr};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// dslink field agent.
#[derive(Parser, Debug)]
#[command(name = "dslink-agent")]
#[command(about = "Relay drone telemetry and remote jobs to a monitor")]
#[command(version)]
struct Cli {
    /// Path to the agent properties file.
    #[arg(short, long, value_name = "FILE", default_value = "properties.json")]
    properties: PathBuf,

    /// Path to the drone config file (overrides `config`).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Monitor address as HOST:PORT (overrides `monitor`).
    #[arg(long, value_name = "HOST:PORT")]
    monitor: Option<String>,

    /// Telemetry listen address (overrides `mavlink`).
    #[arg(long, value_name = "ADDR")]
    mavlink: Option<String>,
}

impl Cli {
    fn properties(&self) -> anyhow::Result<AgentProperties> {
        let mut props = AgentProperties::load(&self.properties)
            .with_context(|| format!("loading {}", self.properties.display()))?;

        if let Some(config) = &self.config {
            props.config.clone_from(config);
        }
        if let Some(monitor) = &self.monitor {
            props.monitor = parse_monitor(monitor)?;
        }
        if let Some(mavlink) = &self.mavlink {
            props.mavlink.clone_from(mavlink);
        }

        props.validate()?;
        Ok(props)
    }
}

fn parse_monitor(value: &str) -> anyhow::Result<MonitorAddr> {
    let Some((host, port)) = value.rsplit_once(':') else {
        bail!("monitor address must be HOST:PORT, got {value}");
    };
    let port = port
        .parse()
        .with_context(|| format!("invalid monitor port in {value}"))?;
    Ok(MonitorAddr {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let props = cli.properties()?;

    info!(
        monitor = %props.monitor.authority(),
        mavlink = %props.mavlink,
        config = %props.config.display(),
        decoder = ?props.decoder,
        "dslink agent starting"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown requested");
            cancel.cancel();
        }
    });

    let supervisor = ProcessSupervisor::new(props);
    #[cfg(unix)]
    tokio::spawn(restart_on_hangup(supervisor.fault_sender()));

    supervisor.run(cancel).await?;
    Ok(())
}

/// SIGHUP starts a fresh generation: config reopened, sockets rebound, session
/// unbound.
#[cfg(unix)]
async fn restart_on_hangup(faults: FaultSender) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!("SIGHUP received");
        faults.raise(AgentError::RestartRequested);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_monitor_address() {
        let addr = parse_monitor("monitor.example.com:4002").unwrap();
        assert_eq!(addr.host, "monitor.example.com");
        assert_eq!(addr.port, 4002);

        let addr = parse_monitor("[::1]:4002").unwrap();
        assert_eq!(addr.host, "::1");

        assert!(parse_monitor("monitor.example.com").is_err());
        assert!(parse_monitor("monitor:http").is_err());
    }

    #[test]
    fn cli_overrides_properties() {
        let cli = Cli::parse_from([
            "dslink-agent",
            "--properties",
            "/nonexistent/properties.json",
            "--monitor",
            "10.0.0.2:5000",
            "--mavlink",
            "0.0.0.0:14551",
        ]);
        let props = cli.properties().unwrap();
        assert_eq!(props.monitor.authority(), "10.0.0.2:5000");
        assert_eq!(props.mavlink, "0.0.0.0:14551");
        assert_eq!(props.liveness_threshold, 5);
    }
}
