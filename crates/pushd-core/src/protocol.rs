use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

pub const STATUS_OK: u16 = 200;
pub const STATUS_CONFLICT: u16 = 409;

/// Messages an agent may send over its session, discriminated on `messageType`.
///
/// `channelID` is optional on register/unregister so a message with the
/// discriminator but a missing id still parses; the handler decides how to
/// reject it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        uaid: Option<String>,
        #[serde(default, rename = "channelIDs")]
        channel_ids: Option<Vec<String>>,
        #[serde(default)]
        wakeup_hostport: Option<WakeupHostport>,
    },
    Register {
        #[serde(default, rename = "channelID")]
        channel_id: Option<String>,
    },
    Unregister {
        #[serde(default, rename = "channelID")]
        channel_id: Option<String>,
    },
    Ack {
        #[serde(default)]
        updates: Vec<AckUpdate>,
    },
}

/// Messages the broker sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        status: u16,
        uaid: String,
    },
    Register {
        status: u16,
        #[serde(rename = "channelID")]
        channel_id: String,
        #[serde(rename = "pushEndpoint")]
        push_endpoint: String,
    },
    Unregister {
        status: u16,
        #[serde(rename = "channelID")]
        channel_id: String,
    },
    Notification {
        updates: Vec<Update>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WakeupHostport {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckUpdate {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Update {
    pub uaid: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message encode failed: {0}")]
    Encode(String),
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::Oversized {
            size: text.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|err| ProtocolError::Encode(err.to_string()))
}
