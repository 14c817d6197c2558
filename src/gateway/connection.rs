//! WebSocket connection registry
//!
//! A [`Connection`] is the socket-free half of a browser client: identity,
//! liveness timestamps, the bounded outbound queue and the close signal. The
//! socket itself is owned by the read, write and heartbeat loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::NetworkError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct LiveState {
    last_ping: Instant,
    closed: bool,
}

/// One authenticated WebSocket client
#[derive(Debug)]
pub struct Connection {
    id: u64,
    user_id: String,
    connected_at: Instant,
    state: RwLock<LiveState>,
    outbound: mpsc::Sender<Vec<u8>>,
    close_tx: watch::Sender<bool>,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue
    pub fn new(user_id: impl Into<String>, send_buffer: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(send_buffer.max(1));
        let (close_tx, _) = watch::channel(false);
        let now = Instant::now();
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.into(),
            connected_at: now,
            state: RwLock::new(LiveState {
                last_ping: now,
                closed: false,
            }),
            outbound,
            close_tx,
        });
        (conn, rx)
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Record a pong (or any other sign of life)
    pub fn touch(&self) {
        self.state.write().last_ping = Instant::now();
    }

    pub fn last_ping(&self) -> Instant {
        self.state.read().last_ping
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Receiver that flips to `true` when the connection closes
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Mark the connection closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.write();
            if state.closed {
                return false;
            }
            state.closed = true;
        }
        self.close_tx.send_replace(true);
        debug!(user_id = %self.user_id, conn_id = self.id, "Connection closed");
        true
    }

    /// Queue a payload, waiting for space unless the connection closes first
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed);
        }
        let mut closed = self.closed_signal();
        tokio::select! {
            res = self.outbound.send(payload) => res.map_err(|_| NetworkError::ConnectionClosed),
            _ = closed.wait_for(|c| *c) => Err(NetworkError::ConnectionClosed),
        }
    }
}

/// Registry of active connections, at most one per user
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, closing and returning any previous one for the
    /// same user
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let user_id = conn.user_id().to_string();
        let previous = self.connections.write().insert(user_id.clone(), conn);

        if let Some(old) = &previous {
            old.close();
            info!(user_id = %user_id, old_conn = old.id(), "Replaced existing connection");
        }
        previous
    }

    /// Remove `conn` if it is still the registered connection for its user
    pub fn unregister(&self, conn: &Connection) -> bool {
        let mut connections = self.connections.write();
        match connections.get(conn.user_id()) {
            Some(current) if current.id() == conn.id() => {
                connections.remove(conn.user_id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(user_id).cloned()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.get(user_id).map_or(false, |c| !c.is_closed())
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    /// Close every connection; used at shutdown
    pub fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.close();
        }
        info!(connections = drained.len(), "All WebSocket connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_unique() {
        let (a, _) = Connection::new("u1", 4);
        let (b, _) = Connection::new("u1", 4);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_close_once() {
        let (conn, _rx) = Connection::new("u1", 4);
        let signal = conn.closed_signal();

        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(*signal.borrow());
    }

    #[tokio::test]
    async fn test_send_queues_until_closed() {
        let (conn, mut rx) = Connection::new("u1", 4);
        conn.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());

        conn.close();
        assert!(matches!(
            conn.send(b"late".to_vec()).await,
            Err(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_full_send() {
        let (conn, _rx) = Connection::new("u1", 1);
        conn.send(b"fill".to_vec()).await.unwrap();

        let sender = Arc::clone(&conn);
        let pending = tokio::spawn(async move { sender.send(b"blocked".to_vec()).await });
        tokio::task::yield_now().await;

        conn.close();
        assert!(pending.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_updates_last_ping() {
        let (conn, _rx) = Connection::new("u1", 1);
        let before = conn.last_ping();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        conn.touch();
        assert!(conn.last_ping() > before);
    }

    #[test]
    fn test_single_connection_per_user() {
        let manager = ConnectionManager::new();
        let (first, _rx1) = Connection::new("u1", 4);
        let (second, _rx2) = Connection::new("u1", 4);

        assert!(manager.register(Arc::clone(&first)).is_none());
        let evicted = manager.register(Arc::clone(&second)).unwrap();

        assert_eq!(evicted.id(), first.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get("u1").unwrap().id(), second.id());
    }

    #[test]
    fn test_stale_unregister_keeps_replacement() {
        let manager = ConnectionManager::new();
        let (first, _rx1) = Connection::new("u1", 4);
        let (second, _rx2) = Connection::new("u1", 4);
        manager.register(Arc::clone(&first));
        manager.register(Arc::clone(&second));

        assert!(!manager.unregister(&first));
        assert!(manager.is_online("u1"));

        assert!(manager.unregister(&second));
        assert!(!manager.is_online("u1"));
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_close_all() {
        let manager = ConnectionManager::new();
        let (a, _ra) = Connection::new("a", 1);
        let (b, _rb) = Connection::new("b", 1);
        manager.register(Arc::clone(&a));
        manager.register(Arc::clone(&b));

        manager.close_all();
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(manager.count(), 0);
    }
}
