//! Server-initiated pushes to WebSocket users

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::error::{BeehiveError, NetworkError, Result};
use crate::gateway::connection::ConnectionManager;
use crate::gateway::envelope::{Envelope, ErrorCode, TYPE_ERROR, TYPE_OFFLINE_MESSAGES};
use crate::rpc::ChatMessage;

/// Serializes envelopes onto user connections
#[derive(Debug, Clone)]
pub struct Pusher {
    connections: Arc<ConnectionManager>,
}

impl Pusher {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Queue an envelope for a user. Offline users are skipped silently.
    pub async fn push_to_user(&self, user_id: &str, envelope: &Envelope) -> Result<()> {
        let conn = match self.connections.get(user_id) {
            Some(conn) if !conn.is_closed() => conn,
            _ => {
                debug!(user_id = %user_id, kind = %envelope.kind, "User offline, push skipped");
                return Ok(());
            }
        };

        let payload = envelope
            .to_vec()
            .map_err(|e| BeehiveError::Internal(e.to_string()))?;

        match conn.send(payload).await {
            Ok(()) => Ok(()),
            Err(NetworkError::ConnectionClosed) => {
                debug!(user_id = %user_id, kind = %envelope.kind, "Connection closed during push, skipped");
                Ok(())
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to push to user");
                Err(e.into())
            }
        }
    }

    /// Push to several users; individual failures are logged
    pub async fn push_to_users(&self, user_ids: &[String], envelope: &Envelope) {
        for user_id in user_ids {
            if let Err(e) = self.push_to_user(user_id, envelope).await {
                error!(user_id = %user_id, error = %e, "Broadcast push failed");
            }
        }
    }

    /// Deliver messages stored while the user was away
    pub async fn push_offline_messages(&self, user_id: &str, messages: Vec<ChatMessage>) -> Result<()> {
        let count = messages.len();
        let messages =
            serde_json::to_value(messages).map_err(|e| BeehiveError::Internal(e.to_string()))?;

        let mut data = Map::new();
        data.insert("messages".into(), messages);
        data.insert("count".into(), json!(count));

        self.push_to_user(user_id, &Envelope::new(TYPE_OFFLINE_MESSAGES, data))
            .await
    }

    pub async fn send_error(&self, user_id: &str, code: ErrorCode, message: impl Into<String>) -> Result<()> {
        let mut data = Map::new();
        data.insert("error_type".into(), json!(code.as_str()));
        data.insert("message".into(), Value::String(message.into()));
        data.insert("timestamp".into(), json!(Utc::now().timestamp()));

        self.push_to_user(user_id, &Envelope::new(TYPE_ERROR, data)).await
    }

    pub async fn send_success(&self, user_id: &str, kind: &str, data: Map<String, Value>) -> Result<()> {
        self.push_to_user(user_id, &Envelope::new(kind, data)).await
    }
}
