//! JSON payload schemas carried inside envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobEvent, JobId, JobSource, JobSpec, JobState, JobStatus};

/// Outbound STATUS payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StatusMsg {
    /// Sent while unbound so the monitor can (re)authenticate the agent.
    #[serde(rename_all = "camelCase")]
    Connect {
        email: String,
        password: String,
        serial_id: String,
        code_status: JobStatus,
    },
    /// Lightweight heartbeat while bound.
    Status,
}

/// Inbound payload from the monitor.
///
/// Every field is optional; anything unknown is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorMsg {
    #[serde(default)]
    pub op: Option<String>,
    /// Updated drone metadata to persist.
    #[serde(default)]
    pub drone: Option<Value>,
    /// Inline code to run.
    #[serde(default)]
    pub code_buffer: Option<String>,
    /// Stored code reference to run.
    #[serde(default)]
    pub code_id: Option<String>,
    /// Launcher script override.
    #[serde(default)]
    pub code_path: Option<String>,
}

impl MonitorMsg {
    /// The job request carried by this message, if any.
    ///
    /// An inline snippet wins over a reference when both are present.
    #[must_use]
    pub fn job_request(&self) -> Option<JobSpec> {
        let source = match (&self.code_buffer, &self.code_id) {
            (Some(code), _) if !code.is_empty() => JobSource::Snippet(code.clone()),
            (_, Some(id)) if !id.is_empty() => JobSource::Reference(id.clone()),
            _ => return None,
        };
        Some(JobSpec {
            source,
            exec_path: self
                .code_path
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(Into::into),
        })
    }
}

/// What a JOB payload reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMsgKind {
    Started,
    Stdout,
    Stderr,
    Completed,
    Errored,
    Declined,
}

/// Outbound JOB payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMsg {
    pub op: String,
    pub kind: JobMsgKind,
    pub msg: String,
    pub status: JobStatus,
}

impl JobMsg {
    fn new(kind: JobMsgKind, msg: String, status: JobStatus) -> Self {
        Self {
            op: "code".to_string(),
            kind,
            msg,
            status,
        }
    }
}

impl From<&JobEvent> for JobMsg {
    fn from(event: &JobEvent) -> Self {
        let running = |id: JobId| JobStatus {
            id: Some(id),
            state: JobState::Running,
            exit_code: None,
        };
        match event {
            JobEvent::Started { id, pid } => {
                let pid = pid.map_or_else(|| "?".to_string(), |p| p.to_string());
                Self::new(JobMsgKind::Started, format!("Running job {pid}..."), running(*id))
            }
            JobEvent::Stdout { id, chunk } => {
                Self::new(JobMsgKind::Stdout, chunk.clone(), running(*id))
            }
            JobEvent::Stderr { id, chunk } => {
                Self::new(JobMsgKind::Stderr, chunk.clone(), running(*id))
            }
            JobEvent::Completed { id, exit_code } => Self::new(
                JobMsgKind::Completed,
                format!("App ended with exit code {exit_code}."),
                JobStatus {
                    id: Some(*id),
                    state: JobState::Completed,
                    exit_code: Some(*exit_code),
                },
            ),
            JobEvent::Errored { id, message } => Self::new(
                JobMsgKind::Errored,
                message.clone(),
                JobStatus {
                    id: Some(*id),
                    state: JobState::Errored,
                    exit_code: None,
                },
            ),
            JobEvent::Declined { running: current } => Self::new(
                JobMsgKind::Declined,
                "A job is already running; request declined.".to_string(),
                current.map_or_else(JobStatus::idle, running),
            ),
        }
    }
}

/// One decoded telemetry message.
///
/// Produced by a frame decoder and relayed as a TELEMETRY payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub header: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn connect_serializes_camel_case_fields() {
        let msg = StatusMsg::Connect {
            email: "pilot@example.com".into(),
            password: "hunter2".into(),
            serial_id: "1-rust".into(),
            code_status: JobStatus::idle(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["op"], "connect");
        assert_eq!(value["serialId"], "1-rust");
        assert_eq!(value["codeStatus"]["state"], "idle");
        assert!(value["codeStatus"]["id"].is_null());
    }

    #[test]
    fn heartbeat_is_op_only() {
        let value = serde_json::to_value(StatusMsg::Status).unwrap();
        assert_eq!(value, json!({"op": "status"}));
    }

    #[test]
    fn monitor_msg_ignores_unknown_fields() {
        let msg: MonitorMsg =
            serde_json::from_value(json!({"op": "status", "user": "x", "terminal": true})).unwrap();
        assert_eq!(msg.op.as_deref(), Some("status"));
        assert!(msg.job_request().is_none());
    }

    #[test]
    fn job_request_prefers_snippet() {
        let msg: MonitorMsg = serde_json::from_value(json!({
            "codeBuffer": "print(1)",
            "codeId": "abc",
            "codePath": "/opt/dslink/exec.py"
        }))
        .unwrap();
        let spec = msg.job_request().unwrap();
        assert_eq!(spec.source, JobSource::Snippet("print(1)".into()));
        assert_eq!(spec.exec_path.unwrap().to_str(), Some("/opt/dslink/exec.py"));
    }

    #[test]
    fn job_request_falls_back_to_reference() {
        let msg: MonitorMsg =
            serde_json::from_value(json!({"codeBuffer": "", "codeId": "flight-7"})).unwrap();
        assert_eq!(msg.job_request().unwrap().source, JobSource::Reference("flight-7".into()));
    }

    #[test]
    fn completed_event_reports_exit_code() {
        let id = Uuid::new_v4();
        let msg = JobMsg::from(&JobEvent::Completed { id, exit_code: 0 });
        assert_eq!(msg.op, "code");
        assert_eq!(msg.kind, JobMsgKind::Completed);
        assert_eq!(msg.status.state, JobState::Completed);
        assert_eq!(msg.status.exit_code, Some(0));
        assert_eq!(msg.status.id, Some(id));
    }

    #[test]
    fn stdout_chunk_passes_through_verbatim() {
        let id = Uuid::new_v4();
        let msg = JobMsg::from(&JobEvent::Stdout { id, chunk: "1\n".into() });
        assert_eq!(msg.msg, "1\n");
        assert!(msg.status.is_running());
    }
}
