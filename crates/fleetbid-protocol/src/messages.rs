use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::identity::{DeviceId, TaskId};
use crate::types::{Bid, DeviceMetrics};

/// `agent_id` the orchestrator stamps on messages it originates.
pub const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";

/// The envelope every message travels in.
///
/// `task_id` and `subtask` are empty strings when not applicable. Older
/// device builds spell the envelope keys in camelCase, so both spellings
/// are accepted on input; output always uses snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, alias = "agentId", deserialize_with = "null_as_empty")]
    pub agent_id: String,
    #[serde(default, alias = "taskId", deserialize_with = "null_as_empty")]
    pub task_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub subtask: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Prompt variant for the hardware the winner runs on.
fn prompt_type(use_npu: bool) -> &'static str {
    if use_npu {
        "npu_prompt"
    } else {
        "cpu_prompt"
    }
}

/// Message kinds understood on the wire, inbound and outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Status,
    /// Announces new work. Sent as `task_source`, or `image` by camera devices.
    TaskSource,
    Bid,
    Result,
    Heartbeat,
    BidRequest,
    Task,
    TaskFailed,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "register" => Self::Register,
            "status" => Self::Status,
            "image" | "task_source" => Self::TaskSource,
            "bid" => Self::Bid,
            "result" => Self::Result,
            "heartbeat" => Self::Heartbeat,
            "bid_request" => Self::BidRequest,
            "task" => Self::Task,
            "task_failed" => Self::TaskFailed,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Status => "status",
            Self::TaskSource => "task_source",
            Self::Bid => "bid",
            Self::Result => "result",
            Self::Heartbeat => "heartbeat",
            Self::BidRequest => "bid_request",
            Self::Task => "task",
            Self::TaskFailed => "task_failed",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WireMessage {
    pub fn new(kind: MessageKind, agent_id: &str, task_id: &str, subtask: &str, data: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            subtask: subtask.to_string(),
            data,
        }
    }

    /// Validate that a decoded JSON value is an envelope and convert it.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        if !value.get("type").is_some_and(Value::is_string) {
            return Err(ProtocolError::MissingField {
                kind: "envelope",
                field: "type",
            });
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidField {
            kind: "envelope",
            field: "envelope",
            reason: e.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    /// Bid solicitation fanned out to every eligible device.
    pub fn bid_request(task_id: &TaskId, capability: &str, deadline_ms: u64) -> Self {
        Self::new(
            MessageKind::BidRequest,
            ORCHESTRATOR_AGENT_ID,
            task_id.as_str(),
            capability,
            json!({
                "task_type": capability,
                "deadline_ms": deadline_ms,
            }),
        )
    }

    /// Task payload delivered to the winning device.
    ///
    /// Object payloads become `data` directly so devices find fields such as
    /// `image_base64` where they expect them; anything else is wrapped.
    /// `prompt_type` tells the device which prompt variant to run.
    pub fn task_assignment(
        task_id: &TaskId,
        capability: &str,
        payload: &Value,
        use_npu: bool,
        origin: &DeviceId,
    ) -> Self {
        let mut data = match payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        data.insert("use_npu".to_string(), Value::Bool(use_npu));
        data.insert("prompt_type".to_string(), Value::from(prompt_type(use_npu)));
        data.insert("origin".to_string(), Value::String(origin.to_string()));

        Self::new(
            MessageKind::Task,
            ORCHESTRATOR_AGENT_ID,
            task_id.as_str(),
            capability,
            Value::Object(data),
        )
    }

    /// Failure notice sent back to the device that sourced a task.
    pub fn task_failed(task_id: Option<&TaskId>, capability: &str, reason: &str) -> Self {
        Self::new(
            MessageKind::TaskFailed,
            ORCHESTRATOR_AGENT_ID,
            task_id.map(TaskId::as_str).unwrap_or_default(),
            capability,
            json!({
                "reason": reason,
                "capability": capability,
            }),
        )
    }

    /// Interpret the envelope as one of the messages devices send.
    pub fn into_inbound(self) -> Result<InboundMessage, ProtocolError> {
        let kind = self
            .message_kind()
            .ok_or_else(|| ProtocolError::UnknownType(self.kind.clone()))?;

        match kind {
            MessageKind::Register => {
                let k = "register";
                let device_id = self.device_id(k)?;
                let has_npu = decode(k, "has_npu", require(k, &self.data, &["has_npu", "hasNpu"], "has_npu")?)?;
                let capabilities = decode(k, "capabilities", require(k, &self.data, &["capabilities"], "capabilities")?)?;
                let metrics = decode(k, "metrics", require(k, &self.data, &["metrics"], "metrics")?)?;
                Ok(InboundMessage::Register(RegisterParams {
                    device_id,
                    has_npu,
                    capabilities,
                    metrics,
                }))
            }
            MessageKind::Status => {
                let k = "status";
                let device_id = self.device_id(k)?;
                let metrics = decode(k, "metrics", require(k, &self.data, &["metrics"], "metrics")?)?;
                Ok(InboundMessage::Status(StatusParams { device_id, metrics }))
            }
            MessageKind::TaskSource => {
                let k = "task_source";
                let source = self.device_id(k)?;
                let payload = match lookup(&self.data, &["payload"]) {
                    Some(payload) => payload.clone(),
                    None => {
                        let image = require(k, &self.data, &["image_base64"], "payload")?;
                        json!({ "image_base64": image })
                    }
                };
                let capability = if self.subtask.is_empty() {
                    lookup(&self.data, &["capability"])
                        .map(|v| decode::<String>(k, "capability", v))
                        .transpose()?
                } else {
                    Some(self.subtask.clone())
                };
                Ok(InboundMessage::TaskSource(TaskSourceParams {
                    source,
                    payload,
                    capability,
                }))
            }
            MessageKind::Bid => {
                let k = "bid";
                let device_id = self.device_id(k)?;
                if self.task_id.is_empty() {
                    return Err(ProtocolError::MissingField { kind: k, field: "task_id" });
                }
                let source = match lookup(&self.data, &["metrics"]) {
                    Some(metrics) if metrics.is_object() => metrics,
                    _ => &self.data,
                };
                require(k, source, &["cpu_load"], "cpu_load")?;
                let bid = decode(k, "metrics", source)?;
                Ok(InboundMessage::Bid(BidParams {
                    task_id: TaskId::new(self.task_id),
                    device_id,
                    bid,
                }))
            }
            MessageKind::Result => {
                let k = "result";
                let device_id = self.device_id(k)?;
                if self.subtask.is_empty() {
                    return Err(ProtocolError::MissingField { kind: k, field: "subtask" });
                }
                let confidence = lookup(&self.data, &["confidence"])
                    .map(|v| decode::<f64>(k, "confidence", v))
                    .transpose()?;
                let task_id = (!self.task_id.is_empty()).then(|| TaskId::new(self.task_id));
                Ok(InboundMessage::Result(ResultParams {
                    device_id,
                    task_id,
                    subtask: self.subtask,
                    confidence,
                    data: self.data,
                }))
            }
            MessageKind::Heartbeat => {
                let device_id = self.device_id("heartbeat")?;
                Ok(InboundMessage::Heartbeat(HeartbeatParams { device_id }))
            }
            MessageKind::BidRequest | MessageKind::Task | MessageKind::TaskFailed => {
                Err(ProtocolError::UnknownType(self.kind))
            }
        }
    }

    /// The sender identity: `agent_id`, falling back to `data.deviceId`.
    fn device_id(&self, kind: &'static str) -> Result<DeviceId, ProtocolError> {
        if !self.agent_id.is_empty() {
            return Ok(DeviceId::new(self.agent_id.clone()));
        }
        match lookup(&self.data, &["deviceId", "device_id"]).and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(DeviceId::new(id)),
            _ => Err(ProtocolError::MissingField { kind, field: "agent_id" }),
        }
    }
}

fn lookup<'a>(data: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|name| data.get(*name))
        .filter(|v| !v.is_null())
}

fn require<'a>(
    kind: &'static str,
    data: &'a Value,
    names: &[&str],
    field: &'static str,
) -> Result<&'a Value, ProtocolError> {
    lookup(data, names).ok_or(ProtocolError::MissingField { kind, field })
}

fn decode<T: DeserializeOwned>(kind: &'static str, field: &'static str, value: &Value) -> Result<T, ProtocolError> {
    T::deserialize(value).map_err(|e| ProtocolError::InvalidField {
        kind,
        field,
        reason: e.to_string(),
    })
}

// ── Inbound payloads ──

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterParams {
    pub device_id: DeviceId,
    pub has_npu: bool,
    pub capabilities: Vec<String>,
    pub metrics: DeviceMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusParams {
    pub device_id: DeviceId,
    pub metrics: DeviceMetrics,
}

/// New work announced by a device (a captured image, a prompt).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSourceParams {
    pub source: DeviceId,
    /// Opaque to the orchestrator; forwarded to the winner untouched.
    pub payload: Value,
    /// Required capability, when the source named one.
    pub capability: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BidParams {
    pub task_id: TaskId,
    pub device_id: DeviceId,
    pub bid: Bid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultParams {
    pub device_id: DeviceId,
    pub task_id: Option<TaskId>,
    /// Task type the result is for.
    pub subtask: String,
    pub confidence: Option<f64>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatParams {
    pub device_id: DeviceId,
}

/// A decoded device-to-orchestrator message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Register(RegisterParams),
    Status(StatusParams),
    TaskSource(TaskSourceParams),
    Bid(BidParams),
    Result(ResultParams),
    Heartbeat(HeartbeatParams),
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Register(_) => MessageKind::Register,
            Self::Status(_) => MessageKind::Status,
            Self::TaskSource(_) => MessageKind::TaskSource,
            Self::Bid(_) => MessageKind::Bid,
            Self::Result(_) => MessageKind::Result,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Register(p) => &p.device_id,
            Self::Status(p) => &p.device_id,
            Self::TaskSource(p) => &p.source,
            Self::Bid(p) => &p.device_id,
            Self::Result(p) => &p.device_id,
            Self::Heartbeat(p) => &p.device_id,
        }
    }

    /// Encode into the envelope a device would send.
    pub fn to_wire(&self) -> WireMessage {
        let agent = self.device_id().as_str();
        match self {
            Self::Register(p) => WireMessage::new(
                MessageKind::Register,
                agent,
                "",
                "",
                json!({
                    "has_npu": p.has_npu,
                    "capabilities": p.capabilities,
                    "metrics": p.metrics,
                }),
            ),
            Self::Status(p) => WireMessage::new(
                MessageKind::Status,
                agent,
                "",
                "",
                json!({ "metrics": p.metrics }),
            ),
            Self::TaskSource(p) => WireMessage::new(
                MessageKind::TaskSource,
                agent,
                "",
                p.capability.as_deref().unwrap_or_default(),
                json!({ "payload": p.payload }),
            ),
            Self::Bid(p) => WireMessage::new(
                MessageKind::Bid,
                agent,
                p.task_id.as_str(),
                "",
                json!({ "metrics": p.bid }),
            ),
            Self::Result(p) => WireMessage::new(
                MessageKind::Result,
                agent,
                p.task_id.as_ref().map(TaskId::as_str).unwrap_or_default(),
                &p.subtask,
                p.data.clone(),
            ),
            Self::Heartbeat(_) => {
                WireMessage::new(MessageKind::Heartbeat, agent, "", "", empty_object())
            }
        }
    }
}
