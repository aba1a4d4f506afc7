//! # Transport Layer
//!
//! TCP serving for the world protocol.
//!
//! ## Components
//! - **Connection**: per-socket task running the handshake and the packet pump
//! - **Server**: accept loop, connection limit, world loop and graceful shutdown

pub mod connection;
pub mod server;

pub use connection::{handle_connection, ConnectionContext, PingGuard};
pub use server::Server;
