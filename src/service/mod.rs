//! # Services
//!
//! Long-lived state shared by every connection.
//!
//! ## Components
//! - **Accounts**: async account store seam plus an in-memory implementation
//! - **Realm**: realm id, expansion and operator toggles (world closed, security floor)
//! - **World**: the session registry and its update loop

pub mod accounts;
pub mod realm;
pub mod world;

pub use accounts::{AccountInfo, AccountStore, AuthAudit, IpInfo, MemoryAccountStore};
pub use realm::Realm;
pub use world::{World, WorldHandle};
