//! Control-channel wire types.
//!
//! Each [`Message`] is serialized as a single-line JSON object with a
//! `type` tag, matching the ten kinds in the protocol table. `request`
//! and `response` carry their payload as a JSON string (double-encoded)
//! rather than a nested object — this is a wire-compatibility constraint
//! inherited from the system this was distilled from, not a stylistic
//! choice, so [`RequestData`]/[`ResponseData`] must stay serialized
//! through `serde_json::to_string`/`from_str` rather than flattened
//! into `Message` directly.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// All control-channel messages exchanged between server and agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Agent → server: claim a tunnel id, optionally binding a subdomain.
    Register {
        tunnel_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
    },

    /// Server → agent: acknowledges registration.
    RegisterConfirm { tunnel_id: String, status: String },

    /// Either direction: liveness heartbeat.
    Heartbeat {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
    },

    /// Either direction: reply to a heartbeat.
    HeartbeatResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        original_timestamp: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_time: Option<i64>,
    },

    /// Either direction: liveness probe.
    Ping { timestamp: i64 },

    /// Either direction: reply to a probe.
    Pong { timestamp: i64, original_timestamp: i64 },

    /// Server → agent: a forwarded public HTTP request.
    Request { request_id: String, data: String },

    /// Agent → server: the materialized HTTP response.
    Response { request_id: String, data: String },

    /// Agent → server: the local call could not be completed.
    Error { request_id: String, error: String },

    /// Agent → server: advisory progress update for a long-running request.
    Progress {
        request_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Catch-all for forward compatibility with unrecognized kinds.
    #[serde(other)]
    Unknown,
}

/// The `data` payload of a `request` message, embedded as a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// UTF-8 or base64 text, depending on how the server chose to encode it.
    pub body: String,
}

/// The `data` payload of a `response` message, embedded as a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub is_binary: bool,
}

impl RequestData {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::InvalidMessage(e.to_string()))
    }
}

impl ResponseData {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::InvalidMessage(e.to_string()))
    }
}
