//! # Protocol Layer
//!
//! Everything above framing: the auth handshake, per-session dispatch and
//! the time-sync subprotocol.
//!
//! ## Components
//! - **Handshake**: challenge, `CMSG_AUTH_SESSION` parsing and the ordered auth checks
//! - **Addon**: lenient parser for the addon blob trailing the auth packet
//! - **Dispatcher**: opcode table of `(name, affinity, handler)` rows
//! - **Session**: inbound queue, world/map passes and outbound link
//! - **Clock Sync**: filtered estimate of the server-minus-client clock delta

pub mod addon;
pub mod clock_sync;
pub mod dispatcher;
pub mod handshake;
pub mod session;

#[cfg(test)]
mod tests;
