//! Upstream service interfaces
//!
//! The transport core never owns business logic. Authentication, message
//! storage, presence and the IM edge service are reached through the traits
//! in this module:
//! - `http` - JSON over HTTP binding used in production
//! - `local` - in-process implementation used in development mode and tests

pub mod http;
pub mod local;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ServerConfig;
use crate::error::{Result, RpcError};

pub use self::http::HttpRpcClient;
pub use self::local::LocalBackend;

pub const SERVICE_AUTH: &str = "auth";
pub const SERVICE_MESSAGE: &str = "message";
pub const SERVICE_PRESENCE: &str = "presence";
pub const SERVICE_IM: &str = "im";

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Run an RPC future, failing with [`RpcError::Timeout`] after `timeout`
pub async fn with_timeout<F, T>(
    service: &'static str,
    method: &'static str,
    timeout: Duration,
    fut: F,
) -> RpcResult<T>
where
    F: Future<Output = RpcResult<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RpcError::Timeout { service, method })?
}

// ============ Auth ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateTokenResponse {
    pub valid: bool,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub id: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResponse {
    pub token: String,
    pub refresh_token: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

pub type RefreshTokenResponse = LoginResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeTokenRequest {
    pub token: String,
}

/// Generic acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate_token(&self, req: ValidateTokenRequest) -> RpcResult<ValidateTokenResponse>;
    async fn login(&self, req: LoginRequest) -> RpcResult<LoginResponse>;
    async fn refresh_token(&self, req: RefreshTokenRequest) -> RpcResult<RefreshTokenResponse>;
    async fn revoke_token(&self, req: RevokeTokenRequest) -> RpcResult<Ack>;
}

// ============ Message ============

/// A stored chat message as returned by the message service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub id: String,
    /// `single` or `group`
    #[serde(rename = "type")]
    pub kind: String,
    pub from_id: String,
    pub to_id: String,
    pub group_id: String,
    pub content: String,
    pub message_type: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id1: String,
    pub id2: String,
    pub group_id: String,
    pub last_message_id: String,
    pub last_message_at: i64,
    pub unread_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub from_id: String,
    pub to_id: String,
    pub content: String,
    pub message_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendGroupMessageRequest {
    pub from_id: String,
    pub group_id: String,
    pub content: String,
    pub message_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMessageHistoryRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    pub limit: i32,
    pub offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetMessageHistoryResponse {
    pub messages: Vec<ChatMessage>,
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetConversationsRequest {
    pub id: String,
    pub limit: i32,
    pub offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetConversationsResponse {
    pub conversations: Vec<Conversation>,
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAsReadRequest {
    pub id: String,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUnreadMessagesRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetUnreadMessagesResponse {
    pub messages: Vec<ChatMessage>,
}

#[async_trait]
pub trait MessageService: Send + Sync {
    async fn send_message(&self, req: SendMessageRequest) -> RpcResult<SendMessageResponse>;
    async fn send_group_message(
        &self,
        req: SendGroupMessageRequest,
    ) -> RpcResult<SendMessageResponse>;
    async fn get_message_history(
        &self,
        req: GetMessageHistoryRequest,
    ) -> RpcResult<GetMessageHistoryResponse>;
    async fn get_conversations(
        &self,
        req: GetConversationsRequest,
    ) -> RpcResult<GetConversationsResponse>;
    async fn mark_as_read(&self, req: MarkAsReadRequest) -> RpcResult<Ack>;
    async fn get_unread_messages(
        &self,
        req: GetUnreadMessagesRequest,
    ) -> RpcResult<GetUnreadMessagesResponse>;
}

// ============ Presence ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRequest {
    pub id: String,
}

#[async_trait]
pub trait PresenceService: Send + Sync {
    async fn user_online(&self, req: PresenceRequest) -> RpcResult<Ack>;
    async fn user_offline(&self, req: PresenceRequest) -> RpcResult<Ack>;
}

// ============ IM edge ============

/// Login issued by the TCP edge once a session is registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImLoginRequest {
    pub token: String,
    pub authorization: String,
    pub session_id: String,
}

/// A client frame forwarded upstream; the body's JSON fields are kept as-is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub session_id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[async_trait]
pub trait ImService: Send + Sync {
    async fn login(&self, req: ImLoginRequest) -> RpcResult<Ack>;
    async fn post_message(&self, req: PostMessageRequest) -> RpcResult<Ack>;
}

/// The set of upstream services used by both transports
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthService>,
    pub message: Arc<dyn MessageService>,
    pub presence: Arc<dyn PresenceService>,
    pub im: Arc<dyn ImService>,
}

impl Backend {
    /// Every service backed by one in-process store
    pub fn local() -> Self {
        Self::from_local(Arc::new(LocalBackend::new()))
    }

    pub fn from_local(local: Arc<LocalBackend>) -> Self {
        Self {
            auth: local.clone(),
            message: local.clone(),
            presence: local.clone(),
            im: local,
        }
    }

    /// HTTP clients for the configured service addresses
    pub fn http(config: &ServerConfig) -> Result<Self> {
        let services = &config.services;
        let client = http::build_client(services.rpc_timeout())?;
        Ok(Self {
            auth: Arc::new(HttpRpcClient::new(
                client.clone(),
                &services.auth_addr,
                SERVICE_AUTH,
            )),
            message: Arc::new(HttpRpcClient::new(
                client.clone(),
                &services.message_addr,
                SERVICE_MESSAGE,
            )),
            presence: Arc::new(HttpRpcClient::new(
                client.clone(),
                &services.presence_addr,
                SERVICE_PRESENCE,
            )),
            im: Arc::new(HttpRpcClient::new(client, &services.im_addr, SERVICE_IM)),
        })
    }

    /// Pick the backend for the configured mode
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        if config.dev_mode {
            Ok(Self::local())
        } else {
            Self::http(config)
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
