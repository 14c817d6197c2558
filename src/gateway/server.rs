//! HTTP router and per-connection WebSocket loops
//!
//! `/ws` authenticates the bearer token before upgrading. Each upgraded
//! socket runs three loops: the read loop on the handler task, plus a write
//! loop draining the outbound queue and a heartbeat loop sending pings.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, timeout, Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::gateway::connection::Connection;
use crate::gateway::error::UpgradeError;
use crate::rpc::{
    self, GetUnreadMessagesRequest, PresenceRequest, ValidateTokenRequest, SERVICE_AUTH,
    SERVICE_MESSAGE, SERVICE_PRESENCE,
};
use crate::state::AppState;

/// Write half shared by the write and heartbeat loops
type SharedSink<S> = Arc<Mutex<S>>;

/// Create the gateway router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tcp_sessions": state.sessions.session_count(),
        "ws_connections": state.connections.count(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Authenticate, then upgrade
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, UpgradeError> {
    let token = bearer
        .map(|TypedHeader(auth)| auth.token().to_string())
        .or(query.token)
        .filter(|t| !t.is_empty())
        .ok_or(UpgradeError::MissingToken)?;

    let validated = rpc::with_timeout(
        SERVICE_AUTH,
        "validate_token",
        state.config.services.rpc_timeout(),
        state.backend.auth.validate_token(ValidateTokenRequest { token }),
    )
    .await;

    let user_id = match validated {
        Ok(resp) if resp.valid && !resp.id.is_empty() => resp.id,
        Ok(_) => return Err(UpgradeError::InvalidToken),
        Err(e) => {
            warn!(error = %e, "Token validation failed");
            return Err(UpgradeError::InvalidToken);
        }
    };

    let upgrade = upgrade.map_err(|e| UpgradeError::BadHandshake(e.body_text()))?;
    Ok(upgrade.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let ws = state.config.websocket.clone();
    let (conn, outbound) = Connection::new(user_id.clone(), ws.send_buffer);

    state.connections.register(Arc::clone(&conn));
    info!(user_id = %user_id, conn_id = conn.id(), "WebSocket connection established");

    announce(&state, &user_id, true).await;

    let offline_state = Arc::clone(&state);
    let offline_user = user_id.clone();
    tokio::spawn(async move { push_offline_messages(offline_state, offline_user).await });

    let (sink, stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));

    let writer = tokio::spawn(write_loop(
        Arc::clone(&conn),
        Arc::clone(&sink),
        outbound,
        ws.write_timeout(),
    ));
    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&conn),
        Arc::clone(&sink),
        ws.ping_interval(),
        ws.read_timeout(),
        ws.write_timeout(),
    ));

    read_loop(&state, &conn, stream, ws.read_timeout()).await;

    // Teardown
    conn.close();
    let removed = state.connections.unregister(&conn);
    let replaced = !removed
        && state
            .connections
            .get(&user_id)
            .map_or(false, |current| current.id() != conn.id());

    if replaced {
        debug!(user_id = %user_id, conn_id = conn.id(), "Connection replaced, skipping offline notice");
    } else {
        announce(&state, &user_id, false).await;
    }

    let _ = tokio::join!(writer, heartbeat);

    if timeout(ws.write_timeout(), async { sink.lock().await.close().await })
        .await
        .is_err()
    {
        debug!(user_id = %user_id, "Timed out closing socket");
    }

    info!(user_id = %user_id, conn_id = conn.id(), "WebSocket connection closed");
}

async fn read_loop(
    state: &AppState,
    conn: &Connection,
    mut stream: SplitStream<WebSocket>,
    read_timeout: Duration,
) {
    let mut closed = conn.closed_signal();

    loop {
        let next = tokio::select! {
            _ = async { let _ = closed.wait_for(|c| *c).await; } => break,
            res = timeout(read_timeout, stream.next()) => res,
        };

        let msg = match next {
            Err(_) => {
                warn!(user_id = %conn.user_id(), "Read timed out");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(user_id = %conn.user_id(), error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            WsMessage::Text(text) => state.router.handle(conn.user_id(), text.as_bytes()).await,
            WsMessage::Binary(bytes) => state.router.handle(conn.user_id(), &bytes).await,
            WsMessage::Ping(_) | WsMessage::Pong(_) => conn.touch(),
            WsMessage::Close(_) => break,
        }
    }
}

async fn write_loop<S>(
    conn: Arc<Connection>,
    sink: SharedSink<S>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut closed = conn.closed_signal();

    loop {
        let payload = tokio::select! {
            _ = async { let _ = closed.wait_for(|c| *c).await; } => break,
            next = outbound.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        let frame = match String::from_utf8(payload) {
            Ok(text) => WsMessage::Text(text),
            Err(e) => WsMessage::Binary(e.into_bytes()),
        };

        match timeout(write_timeout, async { sink.lock().await.send(frame).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(user_id = %conn.user_id(), error = %e, "Failed to write message");
                conn.close();
                break;
            }
            Err(_) => {
                error!(user_id = %conn.user_id(), "Write timed out");
                conn.close();
                break;
            }
        }
    }
}

/// Ping on every tick; close after `2 * read_timeout` without a pong
async fn heartbeat_loop<S>(
    conn: Arc<Connection>,
    sink: SharedSink<S>,
    ping_interval: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut closed = conn.closed_signal();
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            _ = async { let _ = closed.wait_for(|c| *c).await; } => break,
            _ = ticker.tick() => {}
        }

        if conn.last_ping().elapsed() > read_timeout * 2 {
            warn!(user_id = %conn.user_id(), "Heartbeat timeout, closing connection");
            conn.close();
            break;
        }

        let ping = async { sink.lock().await.send(WsMessage::Ping(Vec::new())).await };
        match timeout(write_timeout, ping).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(user_id = %conn.user_id(), error = %e, "Failed to send ping");
                conn.close();
                break;
            }
            Err(_) => {
                error!(user_id = %conn.user_id(), "Ping write timed out");
                conn.close();
                break;
            }
        }
    }
}

/// Best-effort presence notification
async fn announce(state: &AppState, user_id: &str, online: bool) {
    let presence = &state.backend.presence;
    let req = PresenceRequest {
        id: user_id.to_string(),
    };
    let rpc_timeout = state.config.services.rpc_timeout();

    let res = if online {
        rpc::with_timeout(SERVICE_PRESENCE, "user_online", rpc_timeout, presence.user_online(req)).await
    } else {
        rpc::with_timeout(SERVICE_PRESENCE, "user_offline", rpc_timeout, presence.user_offline(req)).await
    };

    if let Err(e) = res {
        error!(user_id = %user_id, online, error = %e, "Failed to update presence");
    }
}

async fn push_offline_messages(state: Arc<AppState>, user_id: String) {
    let res = rpc::with_timeout(
        SERVICE_MESSAGE,
        "get_unread_messages",
        state.config.services.rpc_timeout(),
        state.backend.message.get_unread_messages(GetUnreadMessagesRequest {
            id: user_id.clone(),
        }),
    )
    .await;

    let messages = match res {
        Ok(resp) => resp.messages,
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Failed to fetch unread messages");
            return;
        }
    };

    if messages.is_empty() {
        return;
    }

    let count = messages.len();
    match state.pusher.push_offline_messages(&user_id, messages).await {
        Ok(()) => debug!(user_id = %user_id, count, "Offline messages pushed"),
        Err(e) => error!(user_id = %user_id, error = %e, "Failed to push offline messages"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::rpc::{Backend, RevokeTokenRequest};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(AppState::with_backend(
            ServerConfig::default(),
            Backend::local(),
            shutdown_tx,
        ))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn pings(sent: &[WsMessage]) -> usize {
        sent.iter().filter(|m| matches!(m, WsMessage::Ping(_))).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_closes_silent_client() {
        let (conn, _outbound) = Connection::new("u1", 4);
        let sink = Arc::new(Mutex::new(Vec::<WsMessage>::new()));
        let started = Instant::now();

        heartbeat_loop(
            Arc::clone(&conn),
            Arc::clone(&sink),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
        .await;

        assert!(conn.is_closed());
        assert!(started.elapsed() > Duration::from_secs(4));
        assert!(pings(&sink.lock().await) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_answering_client() {
        let (conn, _outbound) = Connection::new("u1", 4);
        let sink = Arc::new(Mutex::new(Vec::<WsMessage>::new()));

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&conn),
            Arc::clone(&sink),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(1),
        ));

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            conn.touch();
        }
        assert!(!conn.is_closed());
        assert!(pings(&sink.lock().await) >= 9);

        conn.close();
        heartbeat.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_closes_on_stalled_ping() {
        let (conn, _outbound) = Connection::new("u1", 4);
        let stalled = Box::pin(futures_util::sink::unfold((), |(), _msg: WsMessage| {
            std::future::pending::<Result<(), &'static str>>()
        }));

        heartbeat_loop(
            Arc::clone(&conn),
            Arc::new(Mutex::new(stalled)),
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
        .await;

        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_write_loop_delivers_text() {
        let (conn, outbound) = Connection::new("u1", 4);
        let sink = Arc::new(Mutex::new(Vec::<WsMessage>::new()));
        conn.send(br#"{"type":"pong"}"#.to_vec()).await.unwrap();

        let writer = tokio::spawn(write_loop(
            Arc::clone(&conn),
            Arc::clone(&sink),
            outbound,
            Duration::from_secs(1),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close();
        writer.await.unwrap();

        let sent = sink.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], WsMessage::Text(t) if t == r#"{"type":"pong"}"#));
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let (conn, outbound) = Connection::new("u1", 4);
        let broken = Box::pin(futures_util::sink::unfold((), |(), _msg: WsMessage| async {
            Err::<(), _>("peer gone")
        }));
        conn.send(b"{}".to_vec()).await.unwrap();

        timeout(
            Duration::from_secs(2),
            write_loop(Arc::clone(&conn), Arc::new(Mutex::new(broken)), outbound, Duration::from_secs(1)),
        )
        .await
        .expect("write loop must stop after a failed write");
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_closes_connection() {
        let (conn, outbound) = Connection::new("u1", 4);
        let stalled = Box::pin(futures_util::sink::unfold((), |(), _msg: WsMessage| {
            std::future::pending::<Result<(), &'static str>>()
        }));
        conn.send(b"{}".to_vec()).await.unwrap();
        let started = Instant::now();

        write_loop(Arc::clone(&conn), Arc::new(Mutex::new(stalled)), outbound, Duration::from_secs(3)).await;

        assert!(conn.is_closed());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tcp_sessions"], 0);
        assert_eq!(body["ws_connections"], 0);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Missing authorization token");
    }

    #[tokio::test]
    async fn test_revoked_token_is_unauthorized() {
        let state = test_state();
        state
            .backend
            .auth
            .revoke_token(RevokeTokenRequest {
                token: "stale".into(),
            })
            .await
            .unwrap();

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::get("/ws")
                    .header(header::AUTHORIZATION, "Bearer stale")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Invalid token");
    }

    #[tokio::test]
    async fn test_valid_token_without_handshake() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::get("/ws?token=u1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "BAD_HANDSHAKE");
    }
}
