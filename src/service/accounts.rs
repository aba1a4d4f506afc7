//! Account store seam used by the auth handshake.
//!
//! The handshake never blocks on the store: every method returns a future
//! that the connection task awaits while it stops reading from the socket.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::AuthResponseCode;
use crate::utils::crypto::SessionKey;

/// What the store knows about a peer address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub banned: bool,
    /// Two-letter country code, when known
    pub country: Option<String>,
}

/// Account row as seen by the handshake.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub id: u32,
    pub name: String,
    pub session_key: SessionKey,
    /// Last address that logged in successfully
    pub last_ip: Option<IpAddr>,
    pub locked_to_ip: bool,
    /// Country lock; empty or "00" means unlocked
    pub lock_country: String,
    /// Client OS reported by the login service, e.g. "Win" or "OSX"
    pub os: String,
    pub banned: bool,
    pub security: u8,
    pub expansion: u8,
    pub locale: u8,
}

impl AccountInfo {
    /// Unlocked, unbanned player account.
    pub fn new(id: u32, name: impl Into<String>, session_key: SessionKey) -> Self {
        Self {
            id,
            name: name.into(),
            session_key,
            last_ip: None,
            locked_to_ip: false,
            lock_country: String::new(),
            os: String::from("Win"),
            banned: false,
            security: 0,
            expansion: 2,
            locale: 0,
        }
    }
}

/// One rejected auth attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAudit {
    /// Known once the account lookup succeeded
    pub account_id: Option<u32>,
    pub ip: IpAddr,
    pub code: AuthResponseCode,
}

/// Persistent account data consulted during the handshake.
pub trait AccountStore: Send + Sync + 'static {
    fn lookup_ip(&self, ip: IpAddr) -> impl Future<Output = Result<IpInfo>> + Send;

    fn lookup_account(
        &self,
        realm_id: u32,
        name: &str,
    ) -> impl Future<Output = Result<Option<AccountInfo>>> + Send;

    /// Remember the address of the latest attempt for `account_id`.
    fn record_attempt_ip(
        &self,
        account_id: u32,
        ip: IpAddr,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remember the address of the latest successful login.
    fn record_login_ip(&self, account_id: u32, ip: IpAddr)
        -> impl Future<Output = Result<()>> + Send;

    fn record_auth_failure(&self, audit: AuthAudit) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<String, AccountInfo>,
    banned_ips: HashSet<IpAddr>,
    countries: HashMap<IpAddr, String>,
    attempt_ips: HashMap<u32, IpAddr>,
    login_ips: HashMap<u32, IpAddr>,
    audits: Vec<AuthAudit>,
}

/// In-process [`AccountStore`]. Account names are matched case-insensitively.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    state: Mutex<MemoryState>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProtocolError::Custom("account store lock poisoned".into()))?;
        Ok(f(&mut state))
    }

    pub fn insert_account(&self, account: AccountInfo) -> Result<()> {
        self.with_state(|s| {
            s.accounts.insert(account.name.to_ascii_uppercase(), account);
        })
    }

    pub fn ban_ip(&self, ip: IpAddr) -> Result<()> {
        self.with_state(|s| {
            s.banned_ips.insert(ip);
        })
    }

    pub fn set_ip_country(&self, ip: IpAddr, country: impl Into<String>) -> Result<()> {
        let country = country.into();
        self.with_state(|s| {
            s.countries.insert(ip, country);
        })
    }

    pub fn audits(&self) -> Result<Vec<AuthAudit>> {
        self.with_state(|s| s.audits.clone())
    }

    pub fn attempt_ip(&self, account_id: u32) -> Result<Option<IpAddr>> {
        self.with_state(|s| s.attempt_ips.get(&account_id).copied())
    }

    pub fn login_ip(&self, account_id: u32) -> Result<Option<IpAddr>> {
        self.with_state(|s| s.login_ips.get(&account_id).copied())
    }
}

impl AccountStore for MemoryAccountStore {
    async fn lookup_ip(&self, ip: IpAddr) -> Result<IpInfo> {
        self.with_state(|s| IpInfo {
            banned: s.banned_ips.contains(&ip),
            country: s.countries.get(&ip).cloned(),
        })
    }

    async fn lookup_account(&self, _realm_id: u32, name: &str) -> Result<Option<AccountInfo>> {
        let key = name.to_ascii_uppercase();
        self.with_state(|s| s.accounts.get(&key).cloned())
    }

    async fn record_attempt_ip(&self, account_id: u32, ip: IpAddr) -> Result<()> {
        self.with_state(|s| {
            s.attempt_ips.insert(account_id, ip);
        })
    }

    async fn record_login_ip(&self, account_id: u32, ip: IpAddr) -> Result<()> {
        self.with_state(|s| {
            s.login_ips.insert(account_id, ip);
            if let Some(account) = s.accounts.values_mut().find(|a| a.id == account_id) {
                account.last_ip = Some(ip);
            }
        })
    }

    async fn record_auth_failure(&self, audit: AuthAudit) -> Result<()> {
        self.with_state(|s| s.audits.push(audit))
    }
}
