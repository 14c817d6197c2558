//! JSON over HTTP binding for upstream services
//!
//! Every call is `POST {addr}/{service}/{method}` with the request as the JSON
//! body. A 2xx response carries the JSON reply.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::*;
use crate::error::{BeehiveError, RpcError};

/// Build the shared HTTP client
pub fn build_client(timeout: Duration) -> crate::error::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BeehiveError::Config(format!("failed to build RPC client: {}", e)))
}

/// Client for one upstream service
#[derive(Debug, Clone)]
pub struct HttpRpcClient {
    http: reqwest::Client,
    base_url: String,
    service: &'static str,
}

impl HttpRpcClient {
    pub fn new(http: reqwest::Client, base_url: &str, service: &'static str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service,
        }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.service, method)
    }

    /// Issue one call and decode the reply
    pub async fn call<Req, Resp>(&self, method: &'static str, req: &Req) -> RpcResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(method);
        debug!(service = self.service, method, url = %url, "RPC call");

        let response = self.http.post(&url).json(req).send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout {
                    service: self.service,
                    method,
                }
            } else {
                RpcError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(
                service = self.service,
                method,
                status = status.as_u16(),
                "RPC call rejected"
            );
            return Err(match status {
                StatusCode::UNAUTHORIZED => RpcError::Unauthenticated,
                StatusCode::BAD_REQUEST => RpcError::InvalidArgument(message),
                _ => RpcError::Rejected {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| RpcError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl AuthService for HttpRpcClient {
    async fn validate_token(&self, req: ValidateTokenRequest) -> RpcResult<ValidateTokenResponse> {
        self.call("validate_token", &req).await
    }

    async fn login(&self, req: LoginRequest) -> RpcResult<LoginResponse> {
        self.call("login", &req).await
    }

    async fn refresh_token(&self, req: RefreshTokenRequest) -> RpcResult<RefreshTokenResponse> {
        self.call("refresh_token", &req).await
    }

    async fn revoke_token(&self, req: RevokeTokenRequest) -> RpcResult<Ack> {
        self.call("revoke_token", &req).await
    }
}

#[async_trait]
impl MessageService for HttpRpcClient {
    async fn send_message(&self, req: SendMessageRequest) -> RpcResult<SendMessageResponse> {
        self.call("send_message", &req).await
    }

    async fn send_group_message(
        &self,
        req: SendGroupMessageRequest,
    ) -> RpcResult<SendMessageResponse> {
        self.call("send_group_message", &req).await
    }

    async fn get_message_history(
        &self,
        req: GetMessageHistoryRequest,
    ) -> RpcResult<GetMessageHistoryResponse> {
        self.call("get_message_history", &req).await
    }

    async fn get_conversations(
        &self,
        req: GetConversationsRequest,
    ) -> RpcResult<GetConversationsResponse> {
        self.call("get_conversations", &req).await
    }

    async fn mark_as_read(&self, req: MarkAsReadRequest) -> RpcResult<Ack> {
        self.call("mark_as_read", &req).await
    }

    async fn get_unread_messages(
        &self,
        req: GetUnreadMessagesRequest,
    ) -> RpcResult<GetUnreadMessagesResponse> {
        self.call("get_unread_messages", &req).await
    }
}

#[async_trait]
impl PresenceService for HttpRpcClient {
    async fn user_online(&self, req: PresenceRequest) -> RpcResult<Ack> {
        self.call("user_online", &req).await
    }

    async fn user_offline(&self, req: PresenceRequest) -> RpcResult<Ack> {
        self.call("user_offline", &req).await
    }
}

#[async_trait]
impl ImService for HttpRpcClient {
    async fn login(&self, req: ImLoginRequest) -> RpcResult<Ack> {
        self.call("login", &req).await
    }

    async fn post_message(&self, req: PostMessageRequest) -> RpcResult<Ack> {
        self.call("post_message", &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    /// Serve a tiny fake upstream and return its base URL
    async fn fake_upstream() -> String {
        let app = Router::new().route(
            "/:service/:method",
            post(
                |Path((service, method)): Path<(String, String)>, Json(body): Json<Value>| async move {
                    match (service.as_str(), method.as_str()) {
                        ("message", "send_message") => (
                            AxumStatus::OK,
                            Json(json!({"message_id": "m-1", "created_at": 1700000000})),
                        ),
                        ("auth", "validate_token") => {
                            let valid = body["token"] == "good";
                            (AxumStatus::OK, Json(json!({"valid": valid, "id": "u1"})))
                        }
                        ("auth", "login") => (
                            AxumStatus::UNAUTHORIZED,
                            Json(json!({"error": "invalid credentials"})),
                        ),
                        ("presence", _) => (AxumStatus::OK, Json(json!("not an object"))),
                        _ => (
                            AxumStatus::INTERNAL_SERVER_ERROR,
                            Json(json!({"error": "boom"})),
                        ),
                    }
                },
            ),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn client(base: &str, service: &'static str) -> HttpRpcClient {
        HttpRpcClient::new(
            build_client(Duration::from_secs(5)).unwrap(),
            base,
            service,
        )
    }

    #[test]
    fn test_url_layout() {
        let c = client("http://127.0.0.1:9000/", SERVICE_MESSAGE);
        assert_eq!(
            c.url("send_message"),
            "http://127.0.0.1:9000/message/send_message"
        );
    }

    #[tokio::test]
    async fn test_successful_call() {
        let base = fake_upstream().await;
        let c = client(&base, SERVICE_MESSAGE);

        let resp = c
            .send_message(SendMessageRequest {
                from_id: "u1".into(),
                to_id: "u2".into(),
                content: "hi".into(),
                message_type: "text".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.message_id, "m-1");
        assert_eq!(resp.created_at, 1700000000);
    }

    #[tokio::test]
    async fn test_validate_token() {
        let base = fake_upstream().await;
        let c = client(&base, SERVICE_AUTH);

        let good = c
            .validate_token(ValidateTokenRequest {
                token: "good".into(),
            })
            .await
            .unwrap();
        assert!(good.valid);

        let bad = c
            .validate_token(ValidateTokenRequest { token: "bad".into() })
            .await
            .unwrap();
        assert!(!bad.valid);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let base = fake_upstream().await;

        let err = AuthService::login(
            &client(&base, SERVICE_AUTH),
            LoginRequest {
                id: "u1".into(),
                password: "nope".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::Unauthenticated));

        let err = client(&base, SERVICE_MESSAGE)
            .mark_as_read(MarkAsReadRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Rejected { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let base = fake_upstream().await;
        let err = client(&base, SERVICE_PRESENCE)
            .user_online(PresenceRequest { id: "u1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Port 1 on localhost is never listening in test environments
        let err = ImService::login(
            &client("http://127.0.0.1:1", SERVICE_IM),
            ImLoginRequest {
                token: "u1".into(),
                authorization: String::new(),
                session_id: "edge:u1:1".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::Unavailable(_)));
    }
}
