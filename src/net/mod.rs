//! Networking module
//!
//! Binary TCP edge for native clients:
//! - `codec` - length prefixed, checksummed frames
//! - `session` - per-connection sessions and the sharded registry
//! - `handler` - login, heartbeat and forwarding state machine
//! - `server` - accept loop with backoff

pub mod buffer;
pub mod codec;
pub mod handler;
pub mod server;
pub mod session;
pub mod session_id;
pub mod transport;

pub use codec::{Codec, Message};
pub use server::TcpEdgeServer;
pub use session::{Session, SessionManager};
pub use session_id::SessionId;
