//! Cable wire frames.
//!
//! Incoming frames don't fit a single `#[serde(tag = "type")]` enum: a
//! channel payload frame carries `identifier` + `message` with no `type`
//! field at all. So incoming frames deserialize into a raw envelope first,
//! then get classified.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A decoded incoming frame from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingFrame {
    /// Handshake completion; carries no payload.
    Welcome,
    /// Keepalive carrying the server's timestamp (epoch seconds).
    Ping { timestamp: i64 },
    /// Server-initiated teardown.
    Disconnect { reason: Option<String>, reconnect: bool },
    ConfirmSubscription { identifier: String },
    RejectSubscription { identifier: String },
    /// An arbitrary JSON payload delivered to a subscription.
    Message {
        identifier: String,
        data: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct RawIncomingFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    identifier: Option<String>,
    message: Option<serde_json::Value>,
    reason: Option<String>,
    #[serde(default)]
    reconnect: bool,
}

/// Errors decoding a frame off the wire.
#[derive(Debug, Error, PartialEq)]
pub enum FrameDecodeError {
    #[error("malformed JSON: {0}")]
    Json(String),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("frame missing required field `{0}`")]
    MissingField(&'static str),
}

impl IncomingFrame {
    /// Decode one incoming text frame. Unknown `type` values and payload
    /// frames missing `identifier`/`message` are reported as errors so the
    /// caller can log-and-drop without tearing down the connection.
    pub fn decode(text: &str) -> Result<Self, FrameDecodeError> {
        let raw: RawIncomingFrame =
            serde_json::from_str(text).map_err(|e| FrameDecodeError::Json(e.to_string()))?;

        match raw.frame_type.as_deref() {
            Some("welcome") => Ok(IncomingFrame::Welcome),
            Some("ping") => {
                let timestamp = raw
                    .message
                    .as_ref()
                    .and_then(serde_json::Value::as_i64)
                    .ok_or(FrameDecodeError::MissingField("message"))?;
                Ok(IncomingFrame::Ping { timestamp })
            }
            Some("disconnect") => Ok(IncomingFrame::Disconnect {
                reason: raw.reason,
                reconnect: raw.reconnect,
            }),
            Some("confirm_subscription") => Ok(IncomingFrame::ConfirmSubscription {
                identifier: raw.identifier.ok_or(FrameDecodeError::MissingField("identifier"))?,
            }),
            Some("reject_subscription") => Ok(IncomingFrame::RejectSubscription {
                identifier: raw.identifier.ok_or(FrameDecodeError::MissingField("identifier"))?,
            }),
            Some(other) => Err(FrameDecodeError::UnknownType(other.to_owned())),
            None => {
                let identifier = raw.identifier.ok_or(FrameDecodeError::MissingField("identifier"))?;
                let data = raw.message.ok_or(FrameDecodeError::MissingField("message"))?;
                Ok(IncomingFrame::Message { identifier, data })
            }
        }
    }
}

/// A frame the client sends to the server.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub command: OutgoingCommand,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingCommand {
    Subscribe,
    Unsubscribe,
    Message,
}

impl OutgoingFrame {
    pub fn subscribe(identifier: String) -> Self {
        OutgoingFrame {
            command: OutgoingCommand::Subscribe,
            identifier,
            data: None,
        }
    }

    pub fn unsubscribe(identifier: String) -> Self {
        OutgoingFrame {
            command: OutgoingCommand::Unsubscribe,
            identifier,
            data: None,
        }
    }

    /// A `message` frame; `data` is itself a JSON-encoded string of the
    /// action payload (the Cable wire format double-encodes payloads).
    pub fn message(identifier: String, data: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(OutgoingFrame {
            command: OutgoingCommand::Message,
            identifier,
            data: Some(serde_json::to_string(data)?),
        })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("OutgoingFrame always serializes")
    }
}
