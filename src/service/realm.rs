//! Realm-wide auth policy shared by every connection.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::config::RealmConfig;

/// Account security level of ordinary players.
pub const SEC_PLAYER: u8 = 0;

/// Read-mostly realm state. Toggles are atomics so an operator can close the
/// world or raise the security floor while connections are running.
#[derive(Debug)]
pub struct Realm {
    id: u32,
    expansion: u8,
    anticheat_enabled: bool,
    log_ip_addresses: bool,
    closed: AtomicBool,
    security_limit: AtomicU8,
}

impl Realm {
    pub fn new(id: u32, expansion: u8) -> Self {
        Self {
            id,
            expansion,
            anticheat_enabled: false,
            log_ip_addresses: true,
            closed: AtomicBool::new(false),
            security_limit: AtomicU8::new(SEC_PLAYER),
        }
    }

    pub fn from_config(config: &RealmConfig) -> Self {
        Self {
            id: config.realm_id,
            expansion: config.expansion,
            anticheat_enabled: config.anticheat_enabled,
            log_ip_addresses: config.log_ip_addresses,
            closed: AtomicBool::new(false),
            security_limit: AtomicU8::new(config.player_security_limit),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn expansion(&self) -> u8 {
        self.expansion
    }

    pub fn anticheat_enabled(&self) -> bool {
        self.anticheat_enabled
    }

    pub fn log_ip_addresses(&self) -> bool {
        self.log_ip_addresses
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    pub fn security_limit(&self) -> u8 {
        self.security_limit.load(Ordering::Acquire)
    }

    pub fn set_security_limit(&self, limit: u8) {
        self.security_limit.store(limit, Ordering::Release);
    }
}
