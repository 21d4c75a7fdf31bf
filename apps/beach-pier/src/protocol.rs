use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::pairing::PairingCode;

/// Payload field a controller uses to address an agent, and the field the relay stamps
/// onto agent-origin messages.
pub const AGENT_ID_FIELD: &str = "agentId";
/// Alternate addressing field accepted on controller-to-agent messages.
pub const TARGET_AGENT_FIELD: &str = "targetAgent";

/// Identity the transport assigns to a live connection. Never reused once the
/// connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A named message on the control channel. `data` is opaque to the relay apart from
/// the address fields above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn typed<T: Serialize>(event: &str, data: &T) -> Self {
        let data = serde_json::to_value(data).unwrap_or(Value::Null);
        Self::new(event, data)
    }
}

/// Event names understood by the relay.
pub mod events {
    pub const REGISTER: &str = "register";
    pub const REFRESH: &str = "refresh";
    pub const CONNECT_AGENT: &str = "connect-agent";

    pub const REGISTERED: &str = "registered";
    pub const REGISTER_ERROR: &str = "register-error";
    pub const AGENT_LIST: &str = "agent-list";
    pub const AGENT_JOINED: &str = "agent-joined";
    pub const AGENT_LEFT: &str = "agent-left";
    pub const AGENT_CONNECTED: &str = "agent-connected";
    pub const AGENT_CONNECT_ERROR: &str = "agent-connect-error";
    pub const CONTROLLER_DISCONNECTED: &str = "controller-disconnected";
    pub const RELAY_ERROR: &str = "relay-error";
    pub const ERROR: &str = "error";

    /// Controller-to-agent messages, addressed by `agentId`/`targetAgent`.
    pub const CONTROL: &[&str] = &[
        "start-stream",
        "stop-stream",
        "select-screen",
        "set-quality",
        "mouse-move",
        "mouse-down",
        "mouse-up",
        "mouse-click",
        "mouse-scroll",
        "key-down",
        "key-up",
        "key-type",
        "clipboard-set",
        "clipboard-get",
        "file-list",
        "file-download",
        "file-upload",
        "file-delete",
        "system-info",
        "process-list",
        "process-kill",
        "execute-command",
        "lock-screen",
        "screenshot",
    ];

    /// Agent-to-controller messages, routed by the sender's association.
    pub const TELEMETRY: &[&str] = &[
        "screen-frame",
        "clipboard-data",
        "file-list-result",
        "file-download-result",
        "file-upload-result",
        "file-delete-result",
        "system-info-result",
        "process-list-result",
        "process-kill-result",
        "command-output",
        "screenshot-result",
        "heartbeat",
    ];
}

/// How the relay treats an inbound event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Register,
    Refresh,
    ConnectAgent,
    Control,
    Telemetry,
    Unknown,
}

pub fn classify(event: &str) -> EventClass {
    match event {
        events::REGISTER => EventClass::Register,
        events::REFRESH => EventClass::Refresh,
        events::CONNECT_AGENT => EventClass::ConnectAgent,
        name if events::CONTROL.contains(&name) => EventClass::Control,
        name if events::TELEMETRY.contains(&name) => EventClass::Telemetry,
        _ => EventClass::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Agent,
    Controller,
}

/// Host details an agent reports once, at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentInfo {
    pub hostname: String,
    pub username: String,
    pub platform: String,
    pub screens: Vec<Value>,
}

/// Body of a `register` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Registration {
    Agent {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        info: AgentInfo,
    },
    Controller {
        #[serde(default)]
        info: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: ConnectionId,
    #[serde(flatten)]
    pub info: AgentInfo,
    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registered {
    pub id: ConnectionId,
    pub role: PeerRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<PairingCode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterFailure {
    pub reason: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentList {
    pub agents: Vec<AgentSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLeft {
    pub agent_id: ConnectionId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnectError {
    pub agent_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerDisconnected {
    pub controller_id: ConnectionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayFailure {
    pub event: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// Reads the destination agent named in a controller payload, if any.
pub fn destination_field(data: &Value) -> Option<&str> {
    data.get(AGENT_ID_FIELD)
        .or_else(|| data.get(TARGET_AGENT_FIELD))
        .and_then(Value::as_str)
}

/// Stamps the origin agent onto a payload, replacing whatever the sender put there.
/// Non-object payloads are wrapped so the origin can still travel with them.
pub fn inject_origin(data: Value, agent: ConnectionId) -> Value {
    let mut map = match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    map.insert(
        AGENT_ID_FIELD.to_string(),
        Value::String(agent.to_string()),
    );
    Value::Object(map)
}
