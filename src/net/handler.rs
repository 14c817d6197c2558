//! Connection handler module
//!
//! Drives one TCP session through its lifecycle:
//! - Login (first frame carries `{token, authorization}` as JSON)
//! - Registration with the session manager and the IM service
//! - Heartbeat monitoring with forced close on silence
//! - Forwarding every other frame upstream as a post message
//!
//! Codec errors never leave this module except as a closed session.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::{BeehiveError, ProtocolError, Result, SessionError};
use crate::net::codec::{Message, CMD_HEARTBEAT, STATUS_OK};
use crate::net::session::{Session, SessionManager};
use crate::rpc::{self, ImLoginRequest, ImService, PostMessageRequest, SERVICE_IM};

/// Body of the acknowledgement frame sent after a successful login
pub const LOGIN_ACK_BODY: &[u8] = b"Login Success";

/// Read deadline after a heartbeat, as a multiple of the heartbeat timeout
const READ_DEADLINE_FACTOR: u32 = 5;

/// Silence tolerated before a forced close, as a multiple of the timeout
const SILENCE_FACTOR: u32 = 2;

/// Per-connection settings shared by every edge client
#[derive(Debug, Clone, Copy)]
pub struct EdgeSettings {
    pub heartbeat_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection state in the edge lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    AwaitingLogin,
    Authenticated,
    Reading,
    Closed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientState::AwaitingLogin => "AwaitingLogin",
            ClientState::Authenticated => "Authenticated",
            ClientState::Reading => "Reading",
            ClientState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    token: String,
    #[serde(default)]
    authorization: String,
}

/// Handler for one TCP edge connection
pub struct EdgeClient {
    session: Arc<Session>,
    manager: Arc<SessionManager>,
    im: Arc<dyn ImService>,
    settings: EdgeSettings,
    state: ClientState,
}

impl EdgeClient {
    pub fn new(
        session: Arc<Session>,
        manager: Arc<SessionManager>,
        im: Arc<dyn ImService>,
        settings: EdgeSettings,
    ) -> Self {
        Self {
            session,
            manager,
            im,
            settings,
            state: ClientState::AwaitingLogin,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn set_state(&mut self, state: ClientState) {
        trace!(
            session_id = self.session.id(),
            old_state = %self.state,
            new_state = %state,
            "Edge client state changed"
        );
        self.state = state;
    }

    /// Run the connection to completion; the session is always closed on return
    pub async fn run(mut self) {
        self.session
            .extend_read_deadline(self.settings.heartbeat_timeout * READ_DEADLINE_FACTOR);

        let result = self.process().await;
        match &result {
            Ok(()) => {}
            Err(BeehiveError::Session(SessionError::Closed)) => {
                trace!(session_id = self.session.id(), "Session closed while reading");
            }
            Err(e) if e.is_fatal() => {
                debug!(
                    session_id = self.session.id(),
                    state = %self.state,
                    error = %e,
                    "Connection ended"
                );
            }
            Err(e) => {
                warn!(
                    session_id = self.session.id(),
                    state = %self.state,
                    error = %e,
                    "Connection failed"
                );
            }
        }

        let _ = self.session.close().await;
        self.set_state(ClientState::Closed);
    }

    async fn process(&mut self) -> Result<()> {
        let first = self.session.receive().await?;
        self.login(first).await?;
        self.set_state(ClientState::Authenticated);

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        tokio::spawn(heartbeat_monitor(
            Arc::clone(&self.session),
            heartbeat_rx,
            self.settings.heartbeat_timeout,
        ));

        self.set_state(ClientState::Reading);
        loop {
            let msg = self.session.receive().await?;
            if msg.cmd == CMD_HEARTBEAT {
                if heartbeat_tx.send(msg).await.is_err() {
                    return Err(SessionError::Closed.into());
                }
                continue;
            }
            self.forward(msg).await?;
        }
    }

    async fn login(&self, msg: Message) -> Result<()> {
        let payload: LoginPayload = serde_json::from_slice(&msg.data)
            .map_err(|e| ProtocolError::MalformedPayload(format!("login: {}", e)))?;

        self.session.set_token(payload.token.clone())?;
        self.manager.add_session(&self.session)?;
        let sid = self.session.session_id()?;

        let req = ImLoginRequest {
            token: payload.token,
            authorization: payload.authorization,
            session_id: sid.to_string(),
        };
        rpc::with_timeout(
            SERVICE_IM,
            "login",
            self.settings.rpc_timeout,
            self.im.login(req),
        )
        .await?;

        self.session.send(msg.reply(STATUS_OK, LOGIN_ACK_BODY)).await?;
        info!(session_id = %sid, "Client logged in");
        Ok(())
    }

    async fn forward(&self, msg: Message) -> Result<()> {
        let mut payload = match serde_json::from_slice::<Map<String, Value>>(&msg.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    session_id = self.session.id(),
                    cmd = msg.cmd,
                    seq = msg.seq,
                    error = %e,
                    "Dropping frame with malformed post payload"
                );
                return Ok(());
            }
        };
        payload.remove("session_id");

        let sid = self.session.session_id()?;
        let req = PostMessageRequest {
            session_id: sid.to_string(),
            payload,
        };
        rpc::with_timeout(
            SERVICE_IM,
            "post_message",
            self.settings.rpc_timeout,
            self.im.post_message(req),
        )
        .await?;

        trace!(session_id = %sid, seq = msg.seq, "Frame forwarded");
        Ok(())
    }
}

/// Echo heartbeats and close the session after prolonged silence
async fn heartbeat_monitor(
    session: Arc<Session>,
    mut heartbeats: mpsc::Receiver<Message>,
    timeout: Duration,
) {
    let mut last_seen = Instant::now();
    let mut ticker = tokio::time::interval_at(Instant::now() + timeout, timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = heartbeats.recv() => {
                let Some(frame) = next else { break };
                last_seen = Instant::now();
                session.extend_read_deadline(timeout * READ_DEADLINE_FACTOR);
                if let Err(e) = session.send(frame).await {
                    debug!(session_id = session.id(), error = %e, "Failed to echo heartbeat");
                }
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() > timeout * SILENCE_FACTOR {
                    warn!(
                        session_id = session.id(),
                        silent_for = ?last_seen.elapsed(),
                        "Heartbeat timeout, closing session"
                    );
                    let _ = session.close().await;
                    break;
                }
            }
        }
    }
    trace!(session_id = session.id(), "Heartbeat monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::{Codec, CMD_LOGIN, CMD_POST};
    use crate::net::session_id::SessionId;
    use crate::rpc::LocalBackend;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct Harness {
        client: Codec,
        manager: Arc<SessionManager>,
        backend: Arc<LocalBackend>,
        session: Arc<Session>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(settings: EdgeSettings) -> Harness {
        let (client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let manager = SessionManager::new("edge", 16);
        let backend = Arc::new(LocalBackend::new());
        let session = manager.new_session(server);

        let edge = EdgeClient::new(
            Arc::clone(&session),
            Arc::clone(&manager),
            backend.clone(),
            settings,
        );
        let handle = tokio::spawn(edge.run());

        Harness {
            client: Codec::new(client),
            manager,
            backend,
            session,
            handle,
        }
    }

    fn login_frame(token: &str) -> Message {
        let body = json!({"token": token, "authorization": "Bearer abc"}).to_string();
        Message::new(CMD_LOGIN, 1, body)
    }

    async fn login(h: &Harness, token: &str) -> Message {
        h.client.send(&login_frame(token)).await.unwrap();
        h.client.receive().await.unwrap()
    }

    #[tokio::test]
    async fn test_login_registers_session() {
        let h = start(EdgeSettings::default());
        let ack = login(&h, "u1").await;

        assert_eq!(ack.status, STATUS_OK);
        assert_eq!(ack.cmd, CMD_LOGIN);
        assert_eq!(ack.data, LOGIN_ACK_BODY.to_vec());

        let sid = SessionId::new("edge", "u1", h.session.id()).unwrap();
        assert!(h.manager.get_session(&sid).is_some());
        assert_eq!(h.backend.im_session("u1"), Some(sid.to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let h = start(EdgeSettings::default());
        login(&h, "u1").await;
        let sid = h.session.session_id().unwrap();

        h.client.close().await.unwrap();
        drop(h.client);
        h.handle.await.unwrap();

        assert!(h.session.is_closed());
        assert!(h.manager.get_session(&sid).is_none());
    }

    #[tokio::test]
    async fn test_bad_login_never_registers() {
        let h = start(EdgeSettings::default());
        h.client
            .send(&Message::new(CMD_LOGIN, 1, "not json"))
            .await
            .unwrap();

        h.handle.await.unwrap();
        assert!(h.session.is_closed());
        assert_eq!(h.manager.session_count(), 0);
        assert!(h.client.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_echoed() {
        let h = start(EdgeSettings::default());
        login(&h, "u1").await;

        let beat = Message::new(CMD_HEARTBEAT, 42, Vec::new());
        h.client.send(&beat).await.unwrap();
        let echoed = h.client.receive().await.unwrap();
        assert_eq!(echoed, beat);
    }

    #[tokio::test]
    async fn test_post_forwarded_and_malformed_skipped() {
        let h = start(EdgeSettings::default());
        login(&h, "u1").await;

        h.client
            .send(&Message::new(CMD_POST, 2, "{broken"))
            .await
            .unwrap();
        let body = json!({"to": "u2", "text": "hi", "session_id": "spoofed"}).to_string();
        h.client.send(&Message::new(CMD_POST, 3, body)).await.unwrap();

        // A heartbeat round trip orders us after both posts.
        h.client
            .send(&Message::new(CMD_HEARTBEAT, 4, Vec::new()))
            .await
            .unwrap();
        h.client.receive().await.unwrap();

        let posted = h.backend.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].session_id, h.session.session_id().unwrap().to_string());
        assert_eq!(posted[0].payload["to"], "u2");
        assert!(!h.session.is_closed());
    }

    #[tokio::test]
    async fn test_corrupted_frame_disconnects() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let manager = SessionManager::new("edge", 0);
        let session = manager.new_session(server);
        let edge = EdgeClient::new(
            Arc::clone(&session),
            Arc::clone(&manager),
            Arc::new(LocalBackend::new()),
            EdgeSettings::default(),
        );
        let handle = tokio::spawn(edge.run());

        let mut raw = client;
        let mut frame = 20u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0xFF; 20]);
        raw.write_all(&frame).await.unwrap();

        handle.await.unwrap();
        assert!(session.is_closed());
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_forces_close() {
        let settings = EdgeSettings {
            heartbeat_timeout: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(30),
        };
        let h = start(settings);
        login(&h, "u1").await;
        let sid = h.session.session_id().unwrap();

        // No heartbeats: the monitor closes the session long before the
        // read deadline would expire.
        let closed_at = Instant::now();
        h.handle.await.unwrap();
        let waited = closed_at.elapsed();

        assert!(h.session.is_closed());
        assert!(h.manager.get_session(&sid).is_none());
        assert!(waited > Duration::from_secs(120));
        assert!(waited < Duration::from_secs(300));
    }
}
