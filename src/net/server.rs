//! TCP edge listener
//!
//! Accepts raw connections, wraps each in an unregistered [`Session`] and
//! hands it to an [`EdgeClient`]. Transient accept failures are retried with
//! exponential backoff.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::net::handler::{EdgeClient, EdgeSettings};
use crate::net::session::{Session, SessionManager};
use crate::net::transport::configure_tcp;
use crate::rpc::ImService;

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Accept errors worth retrying
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    ) || is_fd_exhaustion(err)
}

/// EMFILE / ENFILE
fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        None => INITIAL_BACKOFF,
        Some(d) => (d * 2).min(MAX_BACKOFF),
    }
}

/// Binary protocol listener
pub struct TcpEdgeServer {
    listener: TcpListener,
    manager: Arc<SessionManager>,
    shutdown: watch::Sender<bool>,
}

impl TcpEdgeServer {
    pub fn new(listener: TcpListener, manager: Arc<SessionManager>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            listener,
            manager,
            shutdown,
        }
    }

    /// Bind a listener and wrap it
    pub async fn bind(addr: SocketAddr, manager: Arc<SessionManager>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, manager))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Accept the next connection as an unregistered session
    ///
    /// Returns `Ok(None)` once the server has been closed.
    pub async fn accept(&self) -> Result<Option<Arc<Session>>> {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff: Option<Duration> = None;

        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = shutdown.wait_for(|closed| *closed) => return Ok(None),
            };

            match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = configure_tcp(&stream) {
                        debug!(address = %addr, error = %e, "Failed to configure socket");
                    }
                    let session = self.manager.new_session(stream);
                    debug!(session_id = session.id(), address = %addr, "Connection accepted");
                    return Ok(Some(session));
                }
                Err(e) if is_transient(&e) => {
                    let delay = next_backoff(backoff);
                    backoff = Some(delay);
                    warn!(error = %e, retry_in = ?delay, "Accept failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|closed| *closed) => return Ok(None),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Accept connections until closed, running an edge client for each
    pub async fn serve(&self, im: Arc<dyn ImService>, settings: EdgeSettings) -> Result<()> {
        info!(address = ?self.listener.local_addr().ok(), "TCP edge server started");

        loop {
            match self.accept().await {
                Ok(Some(session)) => {
                    let client = EdgeClient::new(
                        session,
                        Arc::clone(&self.manager),
                        Arc::clone(&im),
                        settings,
                    );
                    tokio::spawn(client.run());
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "TCP edge accept loop failed");
                    return Err(e);
                }
            }
        }

        info!("TCP edge server stopped accepting");
        Ok(())
    }

    /// Stop accepting and close every session
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.manager.close().await;
    }
}
