//! # Realm Wire
//!
//! Wire protocol core of a world server: packet framing, header cipher,
//! update compression, the auth handshake, session dispatch and clock sync.
//!
//! ## Layers
//! - [`core`]: headers, opcodes, packets and the `tokio_util` codecs
//! - [`protocol`]: handshake, addon parsing, dispatcher, sessions, clock sync
//! - [`service`]: account store seam, realm policy and the world loop
//! - [`transport`]: TCP server and per-connection tasks
//! - [`utils`]: cipher, compression, logging, metrics and timing helpers
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use realm_wire::config::NetworkConfig;
//! use realm_wire::protocol::dispatcher::Dispatcher;
//! use realm_wire::service::accounts::MemoryAccountStore;
//! use realm_wire::transport::Server;
//! use realm_wire::utils::logging::init_logging;
//!
//! # async fn run() -> realm_wire::error::Result<()> {
//! let config = NetworkConfig::from_file("realm.toml")?;
//! init_logging(&config.logging)?;
//!
//! let store = Arc::new(MemoryAccountStore::new());
//! let server = Server::bind(config, store, Dispatcher::with_defaults()).await?;
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::codec::{ClientCodec, WorldCodec};
pub use crate::core::opcodes::{ClientOpcode, ServerOpcode};
pub use crate::core::packet::{ClientPacket, ServerPacket};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::dispatcher::{Affinity, Dispatcher};
pub use crate::protocol::session::Session;
pub use crate::transport::Server;
