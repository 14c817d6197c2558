//! Dispatch of client envelopes to the message service
//!
//! Each request issues exactly one upstream call bounded by the RPC timeout
//! and answers the caller with either a typed response envelope or an
//! `error` envelope.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::gateway::envelope::*;
use crate::gateway::pusher::Pusher;
use crate::rpc::{
    self, GetConversationsRequest, GetMessageHistoryRequest, MarkAsReadRequest, MessageService,
    SendGroupMessageRequest, SendMessageRequest, SERVICE_MESSAGE,
};

pub struct MessageRouter {
    message: Arc<dyn MessageService>,
    pusher: Pusher,
    rpc_timeout: Duration,
}

impl MessageRouter {
    pub fn new(message: Arc<dyn MessageService>, pusher: Pusher, rpc_timeout: Duration) -> Self {
        Self {
            message,
            pusher,
            rpc_timeout,
        }
    }

    /// Handle one raw client frame
    pub async fn handle(&self, user_id: &str, raw: &[u8]) {
        let envelope = match Envelope::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to parse client frame");
                self.reply_error(user_id, ErrorCode::InvalidMessageFormat, "Invalid JSON format")
                    .await;
                return;
            }
        };
        self.dispatch(user_id, &envelope).await;
    }

    /// Validate and route a parsed envelope
    pub async fn dispatch(&self, user_id: &str, envelope: &Envelope) {
        debug!(user_id = %user_id, kind = %envelope.kind, "Dispatching request");

        let request = match Request::parse(envelope) {
            Ok(request) => request,
            Err(e) => {
                self.reply_error(user_id, ErrorCode::InvalidRequest, e.0).await;
                return;
            }
        };

        match request {
            Request::SendMessage {
                to_id,
                content,
                message_type,
            } => {
                let req = SendMessageRequest {
                    from_id: user_id.to_string(),
                    to_id,
                    content,
                    message_type,
                };
                let res = rpc::with_timeout(
                    SERVICE_MESSAGE,
                    "send_message",
                    self.rpc_timeout,
                    self.message.send_message(req),
                )
                .await;
                match res {
                    Ok(resp) => {
                        let data = object(json!({
                            "message_id": resp.message_id,
                            "created_at": resp.created_at,
                        }));
                        self.reply(user_id, TYPE_MESSAGE_SENT, data).await;
                    }
                    Err(e) => self.rpc_failed(user_id, ErrorCode::SendMessageFailed, e).await,
                }
            }

            Request::SendGroupMessage {
                group_id,
                content,
                message_type,
            } => {
                let req = SendGroupMessageRequest {
                    from_id: user_id.to_string(),
                    group_id,
                    content,
                    message_type,
                };
                let res = rpc::with_timeout(
                    SERVICE_MESSAGE,
                    "send_group_message",
                    self.rpc_timeout,
                    self.message.send_group_message(req),
                )
                .await;
                match res {
                    Ok(resp) => {
                        let data = object(json!({
                            "message_id": resp.message_id,
                            "created_at": resp.created_at,
                        }));
                        self.reply(user_id, TYPE_GROUP_MESSAGE_SENT, data).await;
                    }
                    Err(e) => {
                        self.rpc_failed(user_id, ErrorCode::SendGroupMessageFailed, e)
                            .await
                    }
                }
            }

            Request::GetHistory {
                target_user_id,
                group_id,
                limit,
                offset,
            } => {
                let req = GetMessageHistoryRequest {
                    id: user_id.to_string(),
                    target_user_id: target_user_id.unwrap_or_default(),
                    group_id: group_id.unwrap_or_default(),
                    limit,
                    offset,
                };
                let res = rpc::with_timeout(
                    SERVICE_MESSAGE,
                    "get_message_history",
                    self.rpc_timeout,
                    self.message.get_message_history(req),
                )
                .await;
                match res {
                    Ok(resp) => {
                        let mut data = Map::new();
                        data.insert("messages".into(), to_json(&resp.messages));
                        data.insert("total".into(), json!(resp.total));
                        self.reply(user_id, TYPE_MESSAGE_HISTORY, data).await;
                    }
                    Err(e) => self.rpc_failed(user_id, ErrorCode::GetHistoryFailed, e).await,
                }
            }

            Request::GetConversations { limit, offset } => {
                let req = GetConversationsRequest {
                    id: user_id.to_string(),
                    limit,
                    offset,
                };
                let res = rpc::with_timeout(
                    SERVICE_MESSAGE,
                    "get_conversations",
                    self.rpc_timeout,
                    self.message.get_conversations(req),
                )
                .await;
                match res {
                    Ok(resp) => {
                        let mut data = Map::new();
                        data.insert("conversations".into(), to_json(&resp.conversations));
                        data.insert("total".into(), json!(resp.total));
                        self.reply(user_id, TYPE_CONVERSATIONS, data).await;
                    }
                    Err(e) => {
                        self.rpc_failed(user_id, ErrorCode::GetConversationsFailed, e)
                            .await
                    }
                }
            }

            Request::MarkAsRead {
                message_ids,
                conversation_id,
            } => {
                let req = MarkAsReadRequest {
                    id: user_id.to_string(),
                    message_ids,
                    conversation_id: conversation_id.unwrap_or_default(),
                };
                let res = rpc::with_timeout(
                    SERVICE_MESSAGE,
                    "mark_as_read",
                    self.rpc_timeout,
                    self.message.mark_as_read(req),
                )
                .await;
                match res {
                    Ok(ack) => {
                        let data = object(json!({ "success": ack.success }));
                        self.reply(user_id, TYPE_MESSAGES_MARKED_READ, data).await;
                    }
                    Err(e) => self.rpc_failed(user_id, ErrorCode::MarkAsReadFailed, e).await,
                }
            }

            Request::Unknown(kind) => {
                self.reply_error(
                    user_id,
                    ErrorCode::UnknownMessageType,
                    format!("Unknown message type: {}", kind),
                )
                .await;
            }
        }
    }

    async fn reply(&self, user_id: &str, kind: &str, data: Map<String, Value>) {
        if let Err(e) = self.pusher.send_success(user_id, kind, data).await {
            debug!(user_id = %user_id, kind = %kind, error = %e, "Response dropped");
        }
    }

    async fn reply_error(&self, user_id: &str, code: ErrorCode, message: impl Into<String>) {
        if let Err(e) = self.pusher.send_error(user_id, code, message).await {
            debug!(user_id = %user_id, code = %code, error = %e, "Error response dropped");
        }
    }

    async fn rpc_failed(&self, user_id: &str, code: ErrorCode, err: crate::error::RpcError) {
        error!(user_id = %user_id, code = %code, error = %err, "Message service call failed");
        self.reply_error(user_id, code, err.to_string()).await;
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn to_json<T: Serialize>(items: &[T]) -> Value {
    serde_json::to_value(items).unwrap_or_else(|_| Value::Array(Vec::new()))
}
