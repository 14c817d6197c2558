//! Session management module
//!
//! Manages TCP client sessions including:
//! - Session lifecycle (creation, registration, exactly-once close)
//! - Bounded outbound queue drained by a per-session send worker
//! - Sharded session registry keyed by token
//!
//! Shard locks only guard their own maps and are never held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::{BeehiveError, Result, SessionError};
use crate::net::buffer::{shared_pool, BufferPool};
use crate::net::codec::{Codec, Message};
use crate::net::session_id::SessionId;

/// Number of independently locked registry partitions
pub const SHARD_COUNT: usize = 32;

/// Shard index for a token. Stable across add, get and remove.
pub fn shard_index(token: &str) -> usize {
    crc32fast::hash(token.as_bytes()) as usize % SHARD_COUNT
}

/// One TCP connection, before or after login
pub struct Session {
    id: u64,
    namespace: Arc<str>,
    token: OnceCell<String>,
    codec: Codec,
    /// Outbound queue; `None` means synchronous sends
    outbound: Option<mpsc::Sender<Message>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    manager: Weak<SessionManager>,
    created_at: Instant,
}

impl Session {
    fn spawn(
        id: u64,
        namespace: Arc<str>,
        codec: Codec,
        send_queue_size: usize,
        manager: Weak<SessionManager>,
        guard: Option<WorkerGuard>,
    ) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        let (outbound, rx) = if send_queue_size > 0 {
            let (tx, rx) = mpsc::channel(send_queue_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let session = Arc::new(Self {
            id,
            namespace,
            token: OnceCell::new(),
            codec,
            outbound,
            closed: AtomicBool::new(false),
            close_tx,
            manager,
            created_at: Instant::now(),
        });

        if let Some(rx) = rx {
            tokio::spawn(Arc::clone(&session).send_loop(rx, guard));
        }

        session
    }

    /// Numeric id, unique within the owning manager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Login token, if login has completed
    pub fn token(&self) -> Option<&str> {
        self.token.get().map(String::as_str)
    }

    /// Assign the login token. Only the first call succeeds.
    pub fn set_token(&self, token: impl Into<String>) -> std::result::Result<(), SessionError> {
        self.token
            .set(token.into())
            .map_err(|_| SessionError::TokenAlreadySet)
    }

    /// Composite id; requires the token to be set
    pub fn session_id(&self) -> std::result::Result<SessionId, SessionError> {
        let token = self.token().ok_or(SessionError::TokenNotSet)?;
        SessionId::new(self.namespace.as_ref(), token, self.id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn set_read_deadline(&self, at: Instant) {
        self.codec.set_read_deadline(at);
    }

    pub fn set_write_deadline(&self, at: Instant) {
        self.codec.set_write_deadline(at);
    }

    /// Extend the read deadline to `timeout` from now
    pub fn extend_read_deadline(&self, timeout: Duration) {
        self.codec.set_read_deadline(Instant::now() + timeout);
    }

    /// Read the next frame. Pending reads fail with `Closed` once the session
    /// is closed.
    pub async fn receive(&self) -> Result<Message> {
        if self.is_closed() {
            return Err(SessionError::Closed.into());
        }
        let mut close_rx = self.close_tx.subscribe();
        tokio::select! {
            res = self.codec.receive() => res,
            _ = close_rx.wait_for(|closed| *closed) => Err(SessionError::Closed.into()),
        }
    }

    /// Queue a message for delivery
    ///
    /// Never waits for queue space: a full queue is reported as
    /// [`SessionError::Blocked`]. With no queue the frame is written before
    /// returning.
    pub async fn send(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed.into());
        }

        match &self.outbound {
            Some(tx) => tx.try_send(msg).map_err(|e| {
                let err = match e {
                    mpsc::error::TrySendError::Full(_) => SessionError::Blocked,
                    mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
                };
                BeehiveError::Session(err)
            }),
            None => self.write_frame(&msg).await,
        }
    }

    async fn write_frame(&self, msg: &Message) -> Result<()> {
        let mut close_rx = self.close_tx.subscribe();
        tokio::select! {
            res = self.codec.send(msg) => res,
            _ = close_rx.wait_for(|closed| *closed) => Err(SessionError::Closed.into()),
        }
    }

    /// Close the session
    ///
    /// The first call closes the codec, stops the send worker and leaves the
    /// manager. Every later call returns [`SessionError::Closed`].
    pub async fn close(&self) -> std::result::Result<(), SessionError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Closed);
        }

        self.close_tx.send_replace(true);

        if let Err(e) = self.codec.close().await {
            debug!(session_id = self.id, error = %e, "Error shutting down session stream");
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.live.lock().remove(&self.id);
            if self.token().is_some() {
                manager.remove_session(self);
            }
        }

        debug!(
            session_id = self.id,
            token = ?self.token(),
            lifetime = ?self.created_at.elapsed(),
            "Session closed"
        );
        Ok(())
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Message>, _guard: Option<WorkerGuard>) {
        let mut close_rx = self.close_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = close_rx.wait_for(|closed| *closed).await; } => break,
                next = rx.recv() => {
                    let Some(msg) = next else { break };
                    if let Err(e) = self.write_frame(&msg).await {
                        debug!(session_id = self.id, error = %e, "Send worker write failed");
                        break;
                    }
                }
            }
        }
        let _ = self.close().await;
        trace!(session_id = self.id, "Send worker stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.live.lock().remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("token", &self.token())
            .field("queued", &self.outbound.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Counts live send workers so shutdown can wait for them
#[derive(Debug, Default)]
struct WorkerGroup {
    active: AtomicUsize,
    idle: Notify,
}

impl WorkerGroup {
    fn enter(self: &Arc<Self>) -> WorkerGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        WorkerGuard {
            group: Arc::clone(self),
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct WorkerGuard {
    group: Arc<WorkerGroup>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.group.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.group.idle.notify_waiters();
        }
    }
}

#[derive(Default)]
struct Shard {
    sessions: HashMap<SessionId, Arc<Session>>,
    tokens: HashMap<String, Vec<SessionId>>,
}

/// Sharded registry of logged-in TCP sessions
pub struct SessionManager {
    namespace: Arc<str>,
    shards: Vec<RwLock<Shard>>,
    next_id: AtomicU64,
    send_queue_size: usize,
    pool: Arc<BufferPool>,
    closed: AtomicBool,
    /// Every open session, registered or not, so close can reach them all
    live: Mutex<HashMap<u64, Weak<Session>>>,
    workers: Arc<WorkerGroup>,
}

impl SessionManager {
    /// Create a manager using the shared buffer pool
    pub fn new(namespace: impl Into<String>, send_queue_size: usize) -> Arc<Self> {
        Self::with_pool(namespace, send_queue_size, shared_pool())
    }

    pub fn with_pool(
        namespace: impl Into<String>,
        send_queue_size: usize,
        pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        let namespace: String = namespace.into();
        let seed = u64::from(OsRng.next_u32());
        info!(
            namespace = %namespace,
            shards = SHARD_COUNT,
            send_queue_size,
            "Session manager created"
        );
        Arc::new(Self {
            namespace: namespace.into(),
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(Shard::default())).collect(),
            next_id: AtomicU64::new(seed),
            send_queue_size,
            pool,
            closed: AtomicBool::new(false),
            live: Mutex::new(HashMap::new()),
            workers: Arc::new(WorkerGroup::default()),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Wrap a stream in a new, unregistered session
    pub fn new_session<S>(self: &Arc<Self>, stream: S) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let codec = Codec::with_pool(stream, Arc::clone(&self.pool));

        // Checked under the live lock so close either sees this session or
        // this session sees the manager closed.
        let mut live = self.live.lock();
        let track = !self.is_closed();
        let guard = (track && self.send_queue_size > 0).then(|| self.workers.enter());
        let session = Session::spawn(
            id,
            Arc::clone(&self.namespace),
            codec,
            self.send_queue_size,
            Arc::downgrade(self),
            guard,
        );
        if track {
            live.insert(id, Arc::downgrade(&session));
        }
        drop(live);
        trace!(session_id = id, "Session created");
        session
    }

    /// Register a logged-in session
    pub fn add_session(&self, session: &Arc<Session>) -> std::result::Result<(), SessionError> {
        let sid = session.session_id()?;
        let mut shard = self.shards[shard_index(sid.token())].write();

        if self.is_closed() || session.is_closed() {
            return Err(SessionError::Closed);
        }

        shard
            .tokens
            .entry(sid.token().to_string())
            .or_default()
            .push(sid.clone());
        shard.sessions.insert(sid.clone(), Arc::clone(session));
        drop(shard);

        debug!(session_id = %sid, "Session registered");
        Ok(())
    }

    /// Look up a session; only the shard owning the id's token is locked
    pub fn get_session(&self, sid: &SessionId) -> Option<Arc<Session>> {
        self.shards[shard_index(sid.token())]
            .read()
            .sessions
            .get(sid)
            .cloned()
    }

    /// All live sessions logged in with `token`, in login order
    pub fn sessions_for_token(&self, token: &str) -> Vec<Arc<Session>> {
        let shard = self.shards[shard_index(token)].read();
        shard
            .tokens
            .get(token)
            .map(|ids| {
                ids.iter()
                    .filter_map(|sid| shard.sessions.get(sid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a session from both maps of its shard
    pub fn remove_session(&self, session: &Session) {
        let Ok(sid) = session.session_id() else {
            return;
        };
        let mut shard = self.shards[shard_index(sid.token())].write();
        if shard.sessions.remove(&sid).is_none() {
            return;
        }

        let now_empty = match shard.tokens.get_mut(sid.token()) {
            Some(ids) => {
                ids.retain(|other| other != &sid);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            shard.tokens.remove(sid.token());
        }
        drop(shard);

        debug!(session_id = %sid, "Session unregistered");
    }

    pub fn session_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().sessions.len()).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every session and wait for all send workers to finish
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write();
            drained.extend(shard.sessions.drain().map(|(_, session)| session));
            shard.tokens.clear();
        }

        // Sessions still waiting on login also hold send workers
        let pending: Vec<Arc<Session>> = self
            .live
            .lock()
            .drain()
            .filter_map(|(_, session)| session.upgrade())
            .collect();

        info!(
            sessions = drained.len(),
            unregistered = pending.len().saturating_sub(drained.len()),
            "Closing session manager"
        );
        for session in drained.into_iter().chain(pending) {
            let _ = session.close().await;
        }

        self.workers.wait().await;
        info!("Session manager closed");
    }

    #[cfg(test)]
    fn lock_shard(&self, index: usize) -> parking_lot::RwLockWriteGuard<'_, Shard> {
        self.shards[index].write()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("namespace", &self.namespace)
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
