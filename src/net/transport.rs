//! Transport abstraction module
//!
//! Erases the concrete stream type behind boxed read/write halves so that
//! sessions work the same over a `TcpStream`, a TLS stream or an in-memory
//! duplex pipe, and provides deadline handling for socket operations.

use std::future::Future;
use std::time::Duration;

use futures_util::future::Either;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{NetworkError, Result};

/// Read half of a transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Split any bidirectional stream into boxed halves
pub fn split_stream<S>(stream: S) -> (BoxedReader, BoxedWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Apply the socket options used for every accepted TCP connection
pub fn configure_tcp(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    Ok(())
}

/// An optional absolute deadline for a class of socket operations
///
/// Mirrors `SetReadDeadline`/`SetWriteDeadline` on a blocking socket: the
/// deadline is absolute, and an operation still pending when it passes fails
/// with [`NetworkError::Timeout`]. Moving the deadline also moves it for
/// operations already in flight.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Mutex<Option<Instant>>,
    changed: Notify,
}

impl Deadline {
    /// Create an unset deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline to an absolute instant
    pub fn set(&self, at: Instant) {
        *self.at.lock() = Some(at);
        self.changed.notify_waiters();
    }

    /// Set the deadline relative to now
    pub fn extend(&self, timeout: Duration) {
        self.set(Instant::now() + timeout);
    }

    /// Remove the deadline
    pub fn clear(&self) {
        *self.at.lock() = None;
        self.changed.notify_waiters();
    }

    /// Get the current deadline
    pub fn get(&self) -> Option<Instant> {
        *self.at.lock()
    }

    /// Run an operation bounded by the deadline, re-arming whenever it moves
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::pin!(fut);

        loop {
            // Registered before the read so a concurrent set is never missed
            let changed = self.changed.notified();
            let expiry = match self.get() {
                Some(at) => Either::Left(tokio::time::sleep_until(at)),
                None => Either::Right(std::future::pending::<()>()),
            };

            tokio::select! {
                biased;
                res = &mut fut => return res,
                _ = changed => {}
                _ = expiry => {
                    if self.get().map_or(false, |at| at <= Instant::now()) {
                        return Err(NetworkError::Timeout.into());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BeehiveError;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_split_stream_roundtrip() {
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _writer) = split_stream(server);
        let (_client_reader, mut client_writer) = split_stream(client);

        client_writer.write_all(b"hive").await.unwrap();

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hive");
    }

    #[tokio::test]
    async fn test_deadline_unset_runs_to_completion() {
        let deadline = Deadline::new();
        let value = deadline.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let deadline = Deadline::new();
        deadline.extend(Duration::from_millis(50));

        let result: Result<()> = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(BeehiveError::Network(NetworkError::Timeout))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_extension_reaches_pending_run() {
        let deadline = Arc::new(Deadline::new());
        deadline.extend(Duration::from_secs(1));

        let heartbeat = Arc::clone(&deadline);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            heartbeat.extend(Duration::from_secs(2));
        });

        // Finishes at 1.5s, after the original deadline but before the new one
        let result = deadline
            .run(async {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                Ok(3)
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_extension_still_expires() {
        let deadline = Arc::new(Deadline::new());
        let started = Instant::now();

        let heartbeat = Arc::clone(&deadline);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            heartbeat.extend(Duration::from_secs(2));
        });

        let result: Result<()> = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(BeehiveError::Network(NetworkError::Timeout))
        ));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2500));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cleared() {
        let deadline = Deadline::new();
        deadline.extend(Duration::from_millis(1));
        deadline.clear();
        assert!(deadline.get().is_none());

        let result = deadline
            .run(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(1)
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }
}
