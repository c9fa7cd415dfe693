use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CoreError;

pub const TYPE_REQUEST_INITIAL_STATE: &str = "request_whatsapp_initial_state";
pub const TYPE_HEARTBEAT_PING: &str = "heartbeat_ping";
pub const TYPE_QR_UPDATED: &str = "whatsapp_qr_updated";
pub const TYPE_CLIENT_READY: &str = "whatsapp_client_ready";
pub const TYPE_INITIAL_STATE_RESPONSE: &str = "whatsapp_initial_state_response";
pub const TYPE_HEARTBEAT_PONG: &str = "heartbeat_pong";
pub const TYPE_HEARTBEAT_ACK: &str = "heartbeat_ack";

const KNOWN_INBOUND_TYPES: &[&str] = &[
    TYPE_QR_UPDATED,
    TYPE_CLIENT_READY,
    TYPE_INITIAL_STATE_RESPONSE,
    TYPE_HEARTBEAT_PONG,
    TYPE_HEARTBEAT_ACK,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timestamped {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum OutboundMessage {
    #[serde(rename = "request_whatsapp_initial_state")]
    RequestInitialState(Timestamped),
    #[serde(rename = "heartbeat_ping")]
    HeartbeatPing(Timestamped),
}

impl OutboundMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::RequestInitialState(_) => TYPE_REQUEST_INITIAL_STATE,
            OutboundMessage::HeartbeatPing(_) => TYPE_HEARTBEAT_PING,
        }
    }
}

/// Outbound message without its timestamp; the driver stamps it at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    RequestInitialState,
    HeartbeatPing,
}

impl OutboundKind {
    pub fn stamp(self, timestamp: u64) -> OutboundMessage {
        let data = Timestamped { timestamp };
        match self {
            OutboundKind::RequestInitialState => OutboundMessage::RequestInitialState(data),
            OutboundKind::HeartbeatPing => OutboundMessage::HeartbeatPing(data),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrUpdated {
    pub qr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientReady {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ClientReady {
    pub fn is_ready(&self) -> bool {
        self.client_ready == Some(true) || self.state.as_deref() == Some("ready")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InitialState {
    pub fn is_ready(&self) -> bool {
        self.client_ready == Some(true)
    }

    /// An empty string is treated the same as an absent QR.
    pub fn qr(&self) -> Option<&str> {
        self.qr.as_deref().filter(|qr| !qr.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum InboundMessage {
    #[serde(rename = "whatsapp_qr_updated")]
    QrUpdated(QrUpdated),
    #[serde(rename = "whatsapp_client_ready")]
    ClientReady(ClientReady),
    #[serde(rename = "whatsapp_initial_state_response")]
    InitialState(InitialState),
    #[serde(rename = "heartbeat_pong")]
    HeartbeatAck(Option<Value>),
}

impl InboundMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundMessage::QrUpdated(_) => TYPE_QR_UPDATED,
            InboundMessage::ClientReady(_) => TYPE_CLIENT_READY,
            InboundMessage::InitialState(_) => TYPE_INITIAL_STATE_RESPONSE,
            InboundMessage::HeartbeatAck(_) => TYPE_HEARTBEAT_PONG,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    data: Value,
}

pub fn encode_outbound(message: &OutboundMessage) -> Result<String, CoreError> {
    serde_json::to_string(message).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Decodes one inbound text frame.
///
/// An envelope whose `type` is not one of the recognised inbound types yields
/// [`CoreError::UnrecognizedType`]; anything else that fails to parse yields
/// [`CoreError::Malformed`].
pub fn decode_inbound(text: &str) -> Result<InboundMessage, CoreError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|err| CoreError::Malformed(err.to_string()))?;

    if !KNOWN_INBOUND_TYPES.contains(&envelope.message_type.as_str()) {
        return Err(CoreError::UnrecognizedType(envelope.message_type));
    }

    // Heartbeat acknowledgments may arrive with or without a body; every other
    // recognised type tolerates a missing body as an empty object.
    let is_heartbeat = envelope.message_type == TYPE_HEARTBEAT_PONG
        || envelope.message_type == TYPE_HEARTBEAT_ACK;
    let data = if envelope.data.is_null() && !is_heartbeat {
        Value::Object(serde_json::Map::new())
    } else {
        envelope.data
    };
    let message_type = if is_heartbeat {
        TYPE_HEARTBEAT_PONG.to_owned()
    } else {
        envelope.message_type
    };

    let normalized = serde_json::json!({
        "type": message_type,
        "data": data,
    });
    serde_json::from_value(normalized).map_err(|err| CoreError::Malformed(err.to_string()))
}
