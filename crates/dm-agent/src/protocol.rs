//! Agent wire protocol. Frames are JSON with a `type` tag; command frames
//! carry a correlation id tying the response back to the request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision the coordinator speaks.
pub const PROTO_VERSION: u32 = 1;

// ── Frames from agent → coordinator ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// First frame on every connection; anything else gets the socket closed.
    Register {
        token: String,
        engine_id: String,
        version: String,
        #[serde(default)]
        proto_version: u32,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        os: Option<String>,
        #[serde(default)]
        arch: Option<String>,
        #[serde(default)]
        hostname: Option<String>,
    },
    Ping,
    CommandResponse {
        correlation_id: String,
        success: bool,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Container state changes, digest observations, log lines.
    Event {
        event: Value,
    },
    /// Deployment/update progress keyed back to the waiting executor.
    Progress {
        #[serde(default)]
        deployment_id: Option<String>,
        #[serde(default)]
        update_id: Option<String>,
        progress: i64,
        #[serde(default)]
        stage: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        data: Option<Value>,
    },
    /// Terminal signal for an agent-driven container update.
    UpdateComplete {
        container_id: String,
        success: bool,
        #[serde(default)]
        new_container_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Full container inventory for the agent's host.
    Containers {
        containers: Vec<Value>,
    },
}

// ── Frames from coordinator → agent ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    RegisterAck {
        agent_id: String,
        host_id: String,
        proto_version: u32,
    },
    Pong,
    Command {
        command: String,
        correlation_id: String,
        payload: Value,
    },
    Error {
        message: String,
    },
}

/// Outcome of `execute_command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Error,
    Timeout,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub correlation_id: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn success(correlation_id: String, payload: Option<Value>) -> Self {
        Self {
            status: CommandStatus::Success,
            correlation_id,
            payload,
            error: None,
        }
    }

    pub fn failure(correlation_id: String, status: CommandStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            correlation_id,
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn ok(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_frame_serde() {
        let json = r#"{"type":"register","token":"t1","engine_id":"E1","version":"1.0.0",
                       "proto_version":1,"capabilities":["deploy"],"os":"linux","arch":"amd64"}"#;
        let frame: AgentFrame = serde_json::from_str(json).unwrap();
        match frame {
            AgentFrame::Register {
                token, engine_id, ..
            } => {
                assert_eq!(token, "t1");
                assert_eq!(engine_id, "E1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_command_frame_roundtrip() {
        let frame = ServerFrame::Command {
            command: "update_container".into(),
            correlation_id: "c0ffee".into(),
            payload: serde_json::json!({"container_id": "abc"}),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"command"#));
        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerFrame::Command { correlation_id, .. } => assert_eq!(correlation_id, "c0ffee"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_update_complete_defaults() {
        let json = r#"{"type":"update_complete","container_id":"abc","success":false}"#;
        let frame: AgentFrame = serde_json::from_str(json).unwrap();
        match frame {
            AgentFrame::UpdateComplete {
                success,
                new_container_id,
                error,
                ..
            } => {
                assert!(!success);
                assert!(new_container_id.is_none());
                assert!(error.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }
}
