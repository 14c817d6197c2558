//! Application state module
//!
//! Contains the shared state used by both transports.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::gateway::{ConnectionManager, MessageRouter, Pusher};
use crate::net::buffer::BufferPool;
use crate::net::handler::EdgeSettings;
use crate::net::session::SessionManager;
use crate::rpc::Backend;

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Registry of TCP edge sessions
    pub sessions: Arc<SessionManager>,
    /// Registry of WebSocket connections
    pub connections: Arc<ConnectionManager>,
    /// Upstream services
    pub backend: Backend,
    /// Pushes envelopes to WebSocket users
    pub pusher: Pusher,
    /// Dispatches WebSocket requests
    pub router: MessageRouter,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create state with the backend selected by `dev_mode`
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let backend = Backend::from_config(&config)?;
        if config.dev_mode {
            info!("Running in DEVELOPMENT mode - in-process backend");
        } else {
            info!(
                auth = %config.services.auth_addr,
                message = %config.services.message_addr,
                presence = %config.services.presence_addr,
                im = %config.services.im_addr,
                "Using remote services"
            );
        }
        Ok(Self::with_backend(config, backend, shutdown_tx))
    }

    /// Create state around an existing backend
    pub fn with_backend(
        config: ServerConfig,
        backend: Backend,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let pool = Arc::new(BufferPool::new(config.max_pooled_buffers));
        let sessions = SessionManager::with_pool(config.name.clone(), config.send_queue_size, pool);

        let connections = Arc::new(ConnectionManager::new());
        let pusher = Pusher::new(Arc::clone(&connections));
        let router = MessageRouter::new(
            Arc::clone(&backend.message),
            pusher.clone(),
            config.services.rpc_timeout(),
        );

        Self {
            config,
            sessions,
            connections,
            backend,
            pusher,
            router,
            shutdown_tx,
        }
    }

    /// Settings for TCP edge clients
    pub fn edge_settings(&self) -> EdgeSettings {
        EdgeSettings {
            heartbeat_timeout: self.config.heartbeat_timeout(),
            rpc_timeout: self.config.services.rpc_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_uses_config() {
        let mut config = ServerConfig::default();
        config.name = "edge-7".into();
        config.heartbeat_timeout_secs = 15;

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = AppState::with_backend(config, Backend::local(), shutdown_tx);

        assert_eq!(state.sessions.namespace(), "edge-7");
        assert_eq!(state.connections.count(), 0);
        assert_eq!(
            state.edge_settings().heartbeat_timeout,
            std::time::Duration::from_secs(15)
        );
    }

    #[test]
    fn test_dev_mode_builds_local_backend() {
        let config = ServerConfig {
            dev_mode: true,
            ..ServerConfig::default()
        };
        let (shutdown_tx, _) = broadcast::channel(1);
        assert!(AppState::new(config, shutdown_tx).is_ok());
    }
}
