//! Request and response bodies exchanged with the control plane.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A pending command as returned by `GET /self-host/next`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Command identifier, echoed back in the acknowledgment.
    pub id: String,

    /// Action name (`create`, `start`, `stop`, `delete`, `status`, `resize`).
    pub action: String,

    /// Action-specific fields. A missing or `null` payload is empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Map<String, Value>,

    /// When the control plane issued the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Outcome reported for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
}

impl std::fmt::Display for AckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckStatus::Ok => write!(f, "ok"),
            AckStatus::Error => write!(f, "error"),
        }
    }
}

/// Body of `POST /self-host/ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub id: String,
    pub status: AckStatus,
    pub result: Option<ObservedState>,
    pub error: Option<String>,
}

impl Acknowledgment {
    /// Acknowledge a command that completed.
    pub fn ok(id: impl Into<String>, result: ObservedState) -> Self {
        Self {
            id: id.into(),
            status: AckStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    /// Acknowledge a command that failed.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: AckStatus::Error,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Instance state as observed after running a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Instance name.
    pub name: String,

    /// Hypervisor state (e.g. `Running`), or `not_found` / `deleted`.
    pub state: String,

    /// IPv4 addresses, when the instance exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Vec<String>>,
}

impl ObservedState {
    /// State reported when no instance with the name exists.
    pub const NOT_FOUND: &'static str = "not_found";

    /// State reported after a delete.
    pub const DELETED: &'static str = "deleted";

    pub fn new(name: impl Into<String>, state: impl Into<String>, ipv4: Vec<String>) -> Self {
        Self {
            name: name.into(),
            state: state.into(),
            ipv4: Some(ipv4),
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Self::NOT_FOUND.to_string(),
            ipv4: None,
        }
    }

    pub fn deleted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Self::DELETED.to_string(),
            ipv4: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.state == Self::NOT_FOUND
    }
}

/// Body of `POST /self-host/pair`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequest {
    pub pairing_token: String,
    pub connector_info: ConnectorInfo,
}

/// Self-reported connector metadata sent while pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub capabilities: Capabilities,
    /// Actions this connector can execute.
    pub actions: Vec<String>,
}

/// Hypervisor backends the connector can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub multipass: bool,
}

/// Response of `POST /self-host/pair`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairResponse {
    pub connector_id: String,
    pub connector_token: String,
    #[serde(default)]
    pub poll_interval_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_deserialization() {
        let json = r#"{
            "id": "cmd_123",
            "action": "create",
            "payload": {"host_id": "h1", "cpus": 2, "disk_gb": "40G"},
            "issued_at": "2026-01-05T10:00:00Z"
        }"#;

        let envelope: CommandEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.id, "cmd_123");
        assert_eq!(envelope.action, "create");
        assert_eq!(envelope.payload["cpus"], json!(2));
        assert_eq!(envelope.issued_at.as_deref(), Some("2026-01-05T10:00:00Z"));
    }

    #[test]
    fn test_envelope_null_payload_is_empty() {
        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"id": "c", "action": "status", "payload": null}"#).unwrap();
        assert!(envelope.payload.is_empty());

        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"id": "c", "action": "status"}"#).unwrap();
        assert!(envelope.payload.is_empty());
    }

    #[test]
    fn test_ack_serialization() {
        let ack = Acknowledgment::ok("cmd_1", ObservedState::not_found("cocalc-h1"));
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "cmd_1",
                "status": "ok",
                "result": {"name": "cocalc-h1", "state": "not_found"},
                "error": null
            })
        );

        let ack = Acknowledgment::error("cmd_2", "launch failed");
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["result"], Value::Null);
        assert_eq!(value["error"], "launch failed");
    }

    #[test]
    fn test_pair_response_default_interval() {
        let response: PairResponse =
            serde_json::from_str(r#"{"connector_id": "c1", "connector_token": "t1"}"#).unwrap();
        assert_eq!(response.poll_interval_seconds, 0);
    }
}
