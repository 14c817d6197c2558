//! WebSocket gateway for browser clients
//!
//! - `connection` - per-user connections and their registry
//! - `envelope` - JSON frame format and request validation
//! - `pusher` - server-initiated pushes
//! - `router` - request dispatch to the message service
//! - `server` - axum router, upgrade and connection loops

pub mod connection;
pub mod envelope;
pub mod error;
pub mod pusher;
pub mod router;
pub mod server;

pub use connection::{Connection, ConnectionManager};
pub use envelope::{Envelope, ErrorCode, Request};
pub use pusher::Pusher;
pub use router::MessageRouter;
pub use server::create_router;
