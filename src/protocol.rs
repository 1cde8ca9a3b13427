//! Control-frame protocol
//!
//! Every text frame is an envelope `{ "type": ..., "payload": {...} }`.
//! Incoming frames are decoded into the closed [`ClientMessage`] enum;
//! everything the gateway sends back is a [`ServerMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::db::DateRange;
use crate::pipeline::{LocalConfig, ProcessRequest, ProcessResult};
use crate::prompt::ChatMode;
use crate::{Error, Result};

/// Message received from a client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Process(ProcessRequest),
    ChatStart(ChatStart),
    ChatMessage(ChatTurn),
    ChatEnd(DeviceOnly),
    TodoAggregate(DeviceOnly),
    AsrStart(AsrStart),
    AsrStop(AsrStop),
    AsrCancel(DeviceOnly),
}

impl ClientMessage {
    /// Wire name of the message
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Process(_) => "process",
            Self::ChatStart(_) => "chat.start",
            Self::ChatMessage(_) => "chat.message",
            Self::ChatEnd(_) => "chat.end",
            Self::TodoAggregate(_) => "todo.aggregate",
            Self::AsrStart(_) => "asr.start",
            Self::AsrStop(_) => "asr.stop",
            Self::AsrCancel(_) => "asr.cancel",
        }
    }

    /// Device the message is about
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Process(p) => &p.device_id,
            Self::ChatStart(p) => &p.device_id,
            Self::ChatMessage(p) => &p.device_id,
            Self::AsrStart(p) => &p.device_id,
            Self::AsrStop(p) => &p.device_id,
            Self::ChatEnd(p) | Self::TodoAggregate(p) | Self::AsrCancel(p) => &p.device_id,
        }
    }
}

/// Payload carrying only a device id
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOnly {
    pub device_id: String,
}

/// `chat.start` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStart {
    pub device_id: String,
    #[serde(default)]
    pub mode: ChatMode,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub initial_message: Option<String>,
    /// Device-local persona and skill toggles
    #[serde(flatten)]
    pub local_config: LocalConfig,
}

/// `chat.message` payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub device_id: String,
    pub text: String,
}

/// `asr.start` payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsrStart {
    pub device_id: String,
    #[serde(default)]
    pub location_text: Option<String>,
    /// Buffer this turn's audio so `asr.stop` can save it
    #[serde(default)]
    pub save_audio: bool,
}

/// `asr.stop` payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsrStop {
    pub device_id: String,
    #[serde(default)]
    pub save_audio: bool,
}

/// Decode one text frame
///
/// # Errors
///
/// Returns `Invalid JSON` for undecodable frames, `Unknown message type: X`
/// for unrecognised types, and a payload error when fields are missing
pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    let mut envelope: Value =
        serde_json::from_str(text).map_err(|_| Error::Protocol("Invalid JSON".to_string()))?;
    if !envelope.is_object() {
        return Err(Error::Protocol("Invalid JSON".to_string()));
    }

    let kind = envelope
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let payload = match envelope.get_mut("payload").map(Value::take) {
        Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
        Some(payload) => payload,
    };

    let message = match kind.as_str() {
        "process" => ClientMessage::Process(decode(&kind, payload)?),
        "chat.start" => ClientMessage::ChatStart(decode(&kind, payload)?),
        "chat.message" => ClientMessage::ChatMessage(decode(&kind, payload)?),
        "chat.end" => ClientMessage::ChatEnd(decode(&kind, payload)?),
        "todo.aggregate" => ClientMessage::TodoAggregate(decode(&kind, payload)?),
        "asr.start" => ClientMessage::AsrStart(decode(&kind, payload)?),
        "asr.stop" => ClientMessage::AsrStop(decode(&kind, payload)?),
        "asr.cancel" => ClientMessage::AsrCancel(decode(&kind, payload)?),
        other => return Err(Error::Protocol(format!("Unknown message type: {other}"))),
    };
    Ok(message)
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| Error::Protocol(format!("Invalid {kind} payload: {e}")))
}

/// Per-connection queue of outgoing messages
pub type Outbox = mpsc::Sender<ServerMessage>;

/// Message sent to a client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "process.result")]
    ProcessResult(ProcessResult),

    #[serde(rename = "chat.chunk")]
    ChatChunk { text: String },

    #[serde(rename = "chat.done")]
    ChatDone { full_text: String },

    #[serde(rename = "todo.result")]
    TodoResult { diary_entry: String },

    #[serde(rename = "asr.partial")]
    AsrPartial {
        text: String,
        #[serde(rename = "sentenceId")]
        sentence_id: u64,
    },

    #[serde(rename = "asr.sentence")]
    AsrSentence {
        text: String,
        #[serde(rename = "sentenceId")]
        sentence_id: u64,
        begin_time: u64,
        end_time: u64,
    },

    #[serde(rename = "asr.done")]
    AsrDone {
        transcript: String,
        #[serde(rename = "recordId")]
        record_id: String,
        duration: u32,
    },

    #[serde(rename = "asr.error")]
    AsrError { message: String },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn asr_error(message: impl Into<String>) -> Self {
        Self::AsrError {
            message: message.into(),
        }
    }

    /// `asr.done` for a turn that produced no speech
    #[must_use]
    pub const fn empty_asr_done() -> Self {
        Self::AsrDone {
            transcript: String::new(),
            record_id: String::new(),
            duration: 0,
        }
    }
}
