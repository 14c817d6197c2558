//! In-process upstream services
//!
//! Used when `dev_mode` is enabled and by the test suite. Any non-empty token
//! is accepted and doubles as the user id. Messages are kept in memory so
//! history, unread and conversation queries behave realistically.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::*;

const STATUS_UNREAD: &str = "unread";
const STATUS_READ: &str = "read";
const KIND_SINGLE: &str = "single";
const KIND_GROUP: &str = "group";

/// Refresh tokens are the user id with this prefix
const REFRESH_PREFIX: &str = "refresh-";

/// Token lifetime reported by `login`
const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Default)]
pub struct LocalBackend {
    messages: RwLock<Vec<ChatMessage>>,
    revoked: DashSet<String>,
    online: DashMap<String, i64>,
    im_sessions: DashMap<String, String>,
    posts: Mutex<Vec<PostMessageRequest>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        info!("Using in-process backend - all tokens accepted");
        Self::default()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains_key(user_id)
    }

    /// Session id recorded by the last IM login for `token`
    pub fn im_session(&self, token: &str) -> Option<String> {
        self.im_sessions.get(token).map(|s| s.clone())
    }

    /// Every message forwarded through `post_message`
    pub fn posted(&self) -> Vec<PostMessageRequest> {
        self.posts.lock().clone()
    }

    fn store(
        &self,
        kind: &str,
        from_id: &str,
        to_id: &str,
        group_id: &str,
        content: &str,
        message_type: &str,
    ) -> ChatMessage {
        let now = Utc::now().timestamp();
        let msg = ChatMessage {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            group_id: group_id.to_string(),
            content: content.to_string(),
            message_type: message_type.to_string(),
            status: STATUS_UNREAD.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.messages.write().push(msg.clone());
        msg
    }
}

fn require(field: &str, value: &str) -> RpcResult<()> {
    if value.is_empty() {
        return Err(RpcError::InvalidArgument(format!("{} is required", field)));
    }
    Ok(())
}

fn page<T>(items: Vec<T>, limit: i32, offset: i32) -> Vec<T> {
    let offset = offset.max(0) as usize;
    let limit = if limit <= 0 { usize::MAX } else { limit as usize };
    items.into_iter().skip(offset).take(limit).collect()
}

/// Conversation key shared by both participants of a direct chat
fn conversation_id(msg: &ChatMessage) -> String {
    if msg.kind == KIND_GROUP {
        format!("{}:{}", KIND_GROUP, msg.group_id)
    } else if msg.from_id <= msg.to_id {
        format!("{}:{}:{}", KIND_SINGLE, msg.from_id, msg.to_id)
    } else {
        format!("{}:{}:{}", KIND_SINGLE, msg.to_id, msg.from_id)
    }
}

fn involves(msg: &ChatMessage, user_id: &str) -> bool {
    msg.from_id == user_id || msg.to_id == user_id
}

#[async_trait]
impl AuthService for LocalBackend {
    async fn validate_token(&self, req: ValidateTokenRequest) -> RpcResult<ValidateTokenResponse> {
        if req.token.is_empty() || self.revoked.contains(&req.token) {
            return Ok(ValidateTokenResponse::default());
        }
        Ok(ValidateTokenResponse {
            valid: true,
            id: req.token,
        })
    }

    async fn login(&self, req: LoginRequest) -> RpcResult<LoginResponse> {
        require("user id", &req.id)?;
        require("password", &req.password)?;
        self.revoked.remove(&req.id);
        Ok(LoginResponse {
            refresh_token: format!("{}{}", REFRESH_PREFIX, req.id),
            token: req.id,
            expires_at: Utc::now().timestamp() + TOKEN_TTL_SECS,
        })
    }

    async fn refresh_token(&self, req: RefreshTokenRequest) -> RpcResult<RefreshTokenResponse> {
        let user_id = req
            .refresh_token
            .strip_prefix(REFRESH_PREFIX)
            .filter(|id| !id.is_empty())
            .ok_or(RpcError::Unauthenticated)?;
        Ok(LoginResponse {
            token: user_id.to_string(),
            refresh_token: req.refresh_token.clone(),
            expires_at: Utc::now().timestamp() + TOKEN_TTL_SECS,
        })
    }

    async fn revoke_token(&self, req: RevokeTokenRequest) -> RpcResult<Ack> {
        require("token", &req.token)?;
        self.revoked.insert(req.token);
        Ok(Ack::ok())
    }
}

#[async_trait]
impl MessageService for LocalBackend {
    async fn send_message(&self, req: SendMessageRequest) -> RpcResult<SendMessageResponse> {
        require("from_id", &req.from_id)?;
        require("to_id", &req.to_id)?;
        require("content", &req.content)?;

        let msg = self.store(KIND_SINGLE, &req.from_id, &req.to_id, "", &req.content, &req.message_type);
        debug!(message_id = %msg.id, from = %msg.from_id, to = %msg.to_id, "Message stored");
        Ok(SendMessageResponse {
            message_id: msg.id,
            created_at: msg.created_at,
        })
    }

    async fn send_group_message(
        &self,
        req: SendGroupMessageRequest,
    ) -> RpcResult<SendMessageResponse> {
        require("from_id", &req.from_id)?;
        require("group_id", &req.group_id)?;
        require("content", &req.content)?;

        let msg = self.store(KIND_GROUP, &req.from_id, "", &req.group_id, &req.content, &req.message_type);
        Ok(SendMessageResponse {
            message_id: msg.id,
            created_at: msg.created_at,
        })
    }

    async fn get_message_history(
        &self,
        req: GetMessageHistoryRequest,
    ) -> RpcResult<GetMessageHistoryResponse> {
        require("id", &req.id)?;

        let matching: Vec<ChatMessage> = self
            .messages
            .read()
            .iter()
            .filter(|m| {
                if !req.group_id.is_empty() {
                    m.kind == KIND_GROUP && m.group_id == req.group_id
                } else if !req.target_user_id.is_empty() {
                    (m.from_id == req.id && m.to_id == req.target_user_id)
                        || (m.from_id == req.target_user_id && m.to_id == req.id)
                } else {
                    involves(m, &req.id)
                }
            })
            .cloned()
            .collect();

        let total = matching.len() as i64;
        Ok(GetMessageHistoryResponse {
            messages: page(matching, req.limit, req.offset),
            total,
        })
    }

    async fn get_conversations(
        &self,
        req: GetConversationsRequest,
    ) -> RpcResult<GetConversationsResponse> {
        require("id", &req.id)?;

        let mut by_id: HashMap<String, Conversation> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for msg in self.messages.read().iter() {
            let member = involves(msg, &req.id) || (msg.kind == KIND_GROUP && msg.from_id == req.id);
            if !member {
                continue;
            }

            let id = conversation_id(msg);
            let conversation = by_id.entry(id.clone()).or_insert_with(|| {
                order.push(id.clone());
                let (id1, id2) = if msg.kind == KIND_GROUP {
                    (String::new(), String::new())
                } else if msg.from_id <= msg.to_id {
                    (msg.from_id.clone(), msg.to_id.clone())
                } else {
                    (msg.to_id.clone(), msg.from_id.clone())
                };
                Conversation {
                    id: id.clone(),
                    kind: msg.kind.clone(),
                    id1,
                    id2,
                    group_id: msg.group_id.clone(),
                    created_at: msg.created_at,
                    ..Default::default()
                }
            });

            conversation.last_message_id = msg.id.clone();
            conversation.last_message_at = msg.created_at;
            conversation.updated_at = msg.updated_at;
            if msg.to_id == req.id && msg.status == STATUS_UNREAD {
                conversation.unread_count += 1;
            }
        }

        // Most recently active first
        let mut conversations: Vec<Conversation> = order
            .into_iter()
            .rev()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));

        let total = conversations.len() as i64;
        Ok(GetConversationsResponse {
            conversations: page(conversations, req.limit, req.offset),
            total,
        })
    }

    async fn mark_as_read(&self, req: MarkAsReadRequest) -> RpcResult<Ack> {
        require("id", &req.id)?;

        let now = Utc::now().timestamp();
        let mut marked = 0usize;
        for msg in self.messages.write().iter_mut() {
            if msg.to_id != req.id || msg.status == STATUS_READ {
                continue;
            }
            let selected = req.message_ids.contains(&msg.id)
                || (!req.conversation_id.is_empty() && conversation_id(msg) == req.conversation_id);
            if selected {
                msg.status = STATUS_READ.to_string();
                msg.updated_at = now;
                marked += 1;
            }
        }

        debug!(user_id = %req.id, marked, "Messages marked as read");
        Ok(Ack::ok())
    }

    async fn get_unread_messages(
        &self,
        req: GetUnreadMessagesRequest,
    ) -> RpcResult<GetUnreadMessagesResponse> {
        require("id", &req.id)?;
        let messages = self
            .messages
            .read()
            .iter()
            .filter(|m| m.to_id == req.id && m.status == STATUS_UNREAD)
            .cloned()
            .collect();
        Ok(GetUnreadMessagesResponse { messages })
    }
}

#[async_trait]
impl PresenceService for LocalBackend {
    async fn user_online(&self, req: PresenceRequest) -> RpcResult<Ack> {
        require("id", &req.id)?;
        self.online.insert(req.id, Utc::now().timestamp());
        Ok(Ack::ok())
    }

    async fn user_offline(&self, req: PresenceRequest) -> RpcResult<Ack> {
        require("id", &req.id)?;
        self.online.remove(&req.id);
        Ok(Ack::ok())
    }
}

#[async_trait]
impl ImService for LocalBackend {
    async fn login(&self, req: ImLoginRequest) -> RpcResult<Ack> {
        require("token", &req.token)?;
        require("session_id", &req.session_id)?;
        self.im_sessions.insert(req.token, req.session_id);
        Ok(Ack::ok())
    }

    async fn post_message(&self, req: PostMessageRequest) -> RpcResult<Ack> {
        require("session_id", &req.session_id)?;
        self.posts.lock().push(req);
        Ok(Ack::ok())
    }
}
