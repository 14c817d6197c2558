//! JSON envelope exchanged with WebSocket clients
//!
//! Every frame in either direction is `{"type": ..., "data": {...}}`.
//! Incoming envelopes are turned into a closed [`Request`] enum before
//! dispatch so that field validation happens in one place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// Client request types
pub const TYPE_SEND_MESSAGE: &str = "send_message";
pub const TYPE_SEND_GROUP_MESSAGE: &str = "send_group_message";
pub const TYPE_GET_HISTORY: &str = "get_history";
pub const TYPE_GET_CONVERSATIONS: &str = "get_conversations";
pub const TYPE_MARK_AS_READ: &str = "mark_as_read";

// Server response types
pub const TYPE_MESSAGE_SENT: &str = "message_sent";
pub const TYPE_GROUP_MESSAGE_SENT: &str = "group_message_sent";
pub const TYPE_MESSAGE_HISTORY: &str = "message_history";
pub const TYPE_CONVERSATIONS: &str = "conversations";
pub const TYPE_MESSAGES_MARKED_READ: &str = "messages_marked_read";
pub const TYPE_OFFLINE_MESSAGES: &str = "offline_messages";
pub const TYPE_ERROR: &str = "error";

pub const DEFAULT_LIMIT: i32 = 50;
pub const DEFAULT_MESSAGE_TYPE: &str = "text";

/// A typed WebSocket frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Parse a client frame
    pub fn from_slice(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Error categories reported to clients in `error` envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidMessageFormat,
    UnknownMessageType,
    InvalidRequest,
    SendMessageFailed,
    SendGroupMessageFailed,
    GetHistoryFailed,
    GetConversationsFailed,
    MarkAsReadFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessageFormat => "INVALID_MESSAGE_FORMAT",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::SendMessageFailed => "SEND_MESSAGE_FAILED",
            ErrorCode::SendGroupMessageFailed => "SEND_GROUP_MESSAGE_FAILED",
            ErrorCode::GetHistoryFailed => "GET_HISTORY_FAILED",
            ErrorCode::GetConversationsFailed => "GET_CONVERSATIONS_FAILED",
            ErrorCode::MarkAsReadFailed => "MARK_AS_READ_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request field was missing or had the wrong type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidRequest(pub &'static str);

/// A validated client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SendMessage {
        to_id: String,
        content: String,
        message_type: String,
    },
    SendGroupMessage {
        group_id: String,
        content: String,
        message_type: String,
    },
    GetHistory {
        target_user_id: Option<String>,
        group_id: Option<String>,
        limit: i32,
        offset: i32,
    },
    GetConversations {
        limit: i32,
        offset: i32,
    },
    MarkAsRead {
        message_ids: Vec<String>,
        conversation_id: Option<String>,
    },
    Unknown(String),
}

impl Request {
    /// Validate an envelope into a request
    pub fn parse(envelope: &Envelope) -> Result<Self, InvalidRequest> {
        let data = &envelope.data;

        let request = match envelope.kind.as_str() {
            TYPE_SEND_MESSAGE => Request::SendMessage {
                to_id: required(data, "to_id", "Missing or invalid to_id")?,
                content: required(data, "content", "Missing or invalid content")?,
                message_type: message_type(data),
            },
            TYPE_SEND_GROUP_MESSAGE => Request::SendGroupMessage {
                group_id: required(data, "group_id", "Missing or invalid group_id")?,
                content: required(data, "content", "Missing or invalid content")?,
                message_type: message_type(data),
            },
            TYPE_GET_HISTORY => Request::GetHistory {
                target_user_id: optional(data, "target_user_id"),
                group_id: optional(data, "group_id"),
                limit: number(data, "limit").unwrap_or(DEFAULT_LIMIT),
                offset: number(data, "offset").unwrap_or(0),
            },
            TYPE_GET_CONVERSATIONS => Request::GetConversations {
                limit: number(data, "limit").unwrap_or(DEFAULT_LIMIT),
                offset: number(data, "offset").unwrap_or(0),
            },
            TYPE_MARK_AS_READ => Request::MarkAsRead {
                message_ids: data
                    .get("message_ids")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                conversation_id: optional(data, "conversation_id"),
            },
            other => Request::Unknown(other.to_string()),
        };

        Ok(request)
    }
}

fn optional(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required(
    data: &Map<String, Value>,
    key: &str,
    message: &'static str,
) -> Result<String, InvalidRequest> {
    optional(data, key).ok_or(InvalidRequest(message))
}

fn message_type(data: &Map<String, Value>) -> String {
    optional(data, "message_type").unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string())
}

// JSON numbers arrive as floats from browsers; truncate like a cast would
fn number(data: &Map<String, Value>, key: &str) -> Option<i32> {
    data.get(key).and_then(Value::as_f64).map(|n| n as i32)
}
