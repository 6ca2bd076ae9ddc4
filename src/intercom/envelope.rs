//! Wire envelopes exchanged over an intercom channel.
//!
//! ## Protocol
//!
//! Client → server (one JSON object per line):
//! ```json
//! {"reqId": 1, "payload": {"type": "ping"}}
//! ```
//!
//! Server → client (one JSON object per line):
//! ```json
//! {"type": "response", "reqId": 1, "data": {"type": "pong"}}
//! {"type": "error", "reqId": 2, "data": "not found: confirmation abc"}
//! {"type": "subscription", "data": {"type": "confirmation_requested", "id": "abc"}}
//! ```
//!
//! Decoding happens once, here, at the transport boundary. Anything that
//! does not fit the tagged shape is an [`AppError::Protocol`] for that one
//! line; the channel stays open.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Correlation id matching a response to its originating request.
pub type ReqId = u64;

/// Request envelope sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Monotonic per-channel correlation id.
    #[serde(rename = "reqId")]
    pub req_id: ReqId,
    /// Opaque request payload handed to the server's handler.
    pub payload: Value,
}

/// Message sent by the server on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Successful response to a request.
    Response {
        /// Correlation id of the request being answered.
        #[serde(rename = "reqId")]
        req_id: ReqId,
        /// Handler result.
        data: Value,
    },
    /// Failed response to a request.
    Error {
        /// Correlation id of the request being answered.
        #[serde(rename = "reqId")]
        req_id: ReqId,
        /// Human-readable error message.
        data: String,
    },
    /// Fire-and-forget broadcast to every live channel.
    Subscription {
        /// Broadcast payload.
        data: Value,
    },
}

impl ServerMessage {
    /// Correlation id carried by this message, if it is a response.
    #[must_use]
    pub fn req_id(&self) -> Option<ReqId> {
        match self {
            Self::Response { req_id, .. } | Self::Error { req_id, .. } => Some(*req_id),
            Self::Subscription { .. } => None,
        }
    }
}

/// Broadcast payloads emitted by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// A gated request is waiting for a human decision.
    ConfirmationRequested {
        /// Opaque confirmation id to echo back in the decision request.
        id: String,
    },
    /// A pending confirmation was superseded, timed out, or abandoned.
    ConfirmationExpired {
        /// Id of the confirmation that expired.
        id: String,
    },
    /// Service state changed (permissions granted or revoked).
    StateUpdated,
}

impl BroadcastEvent {
    /// Serialize into the `data` field of a subscription envelope.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if serialization fails.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Interpret a subscription payload as a known broadcast event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when the payload is not a known event.
    pub fn from_value(value: &Value) -> Result<Self> {
        Self::deserialize(value)
            .map_err(|err| AppError::Protocol(format!("unknown broadcast: {err}")))
    }
}

/// Decode one inbound line on the server side.
///
/// # Errors
///
/// Returns `AppError::Protocol` for invalid JSON or a missing `reqId`.
pub fn decode_request(line: &str) -> Result<RequestEnvelope> {
    serde_json::from_str(line).map_err(|err| AppError::Protocol(format!("malformed request: {err}")))
}

/// Decode one inbound line on the client side.
///
/// # Errors
///
/// Returns `AppError::Protocol` for invalid JSON or a missing/unknown `type` tag.
pub fn decode_server_message(line: &str) -> Result<ServerMessage> {
    serde_json::from_str(line).map_err(|err| AppError::Protocol(format!("malformed message: {err}")))
}

/// Serialize a message as one NDJSON line, newline included.
///
/// # Errors
///
/// Returns `AppError::Protocol` if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}
