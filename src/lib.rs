//! Beehive Server Library
//!
//! Connection-oriented transport core for the Beehive instant messaging
//! system. Two front doors share one set of upstream services:
//!
//! ## Modules
//!
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `gateway` - WebSocket gateway for browser clients
//! - `net` - Binary TCP edge: codec, sessions, accept loop
//! - `rpc` - Upstream service interfaces and bindings
//! - `state` - Shared application state

pub mod config;
pub mod error;
pub mod gateway;
pub mod net;
pub mod rpc;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{BeehiveError, Result};
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
