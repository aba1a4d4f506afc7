//! World-server auth handshake.
//!
//! ```text
//! server                                   client
//!   | -- SMSG_AUTH_CHALLENGE (seed) ------------> |
//!   | <------------ CMSG_AUTH_SESSION (digest) -- |
//!   |        account lookup (async)               |
//!   | -- SMSG_AUTH_RESPONSE -------------------->  |   cipher starts after AUTH_OK
//! ```
//!
//! Handshake state is per connection ([`ServerHandshake`]) and only ever moves
//! forward. The checks themselves live in [`verify_account`], a pure function
//! so the rejection order can be tested without sockets.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::opcodes::{ClientOpcode, ServerOpcode};
use crate::core::packet::{ClientPacket, ServerPacket};
use crate::error::{constants, ProtocolError, Result};
use crate::service::accounts::{AccountInfo, IpInfo};
use crate::service::realm::{Realm, SEC_PLAYER};
use crate::utils::crypto::{auth_digest, random_bytes, SessionKey, DIGEST_LEN};

/// Terminal result codes carried by `SMSG_AUTH_RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthResponseCode {
    Ok = 0x0C,
    Failed = 0x0D,
    Reject = 0x0E,
    Unavailable = 0x10,
    UnknownAccount = 0x15,
    Banned = 0x1C,
    RealmNotFound = 0x27,
}

impl AuthResponseCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x0C => Self::Ok,
            0x0D => Self::Failed,
            0x0E => Self::Reject,
            0x10 => Self::Unavailable,
            0x15 => Self::UnknownAccount,
            0x1C => Self::Banned,
            0x27 => Self::RealmNotFound,
            _ => return None,
        })
    }
}

impl fmt::Display for AuthResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({:#04x})", self.as_u8())
    }
}

/// Connection-level handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHeader,
    AwaitingAuthPacket,
    AwaitingAccountLookup,
    Authenticated,
    Rejected,
}

impl HandshakeState {
    fn step(self) -> u8 {
        match self {
            Self::AwaitingHeader => 0,
            Self::AwaitingAuthPacket => 1,
            Self::AwaitingAccountLookup => 2,
            Self::Authenticated | Self::Rejected => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Authenticated | Self::Rejected)
    }

    /// Move to `next`.
    ///
    /// Only the following step is allowed, except that any non-terminal state
    /// may fall through to `Rejected`. Terminal states never change again.
    pub fn advance(&mut self, next: HandshakeState) -> Result<()> {
        let allowed = !self.is_terminal()
            && (next == Self::Rejected || next.step() == self.step() + 1);
        if !allowed {
            return Err(ProtocolError::HandshakeError(format!(
                "{} ({self:?} -> {next:?})",
                constants::ERR_STATE_REGRESSION
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Protocol version field of `SMSG_AUTH_CHALLENGE`.
const CHALLENGE_VERSION: u32 = 1;

/// Server half of the handshake for one connection.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ServerHandshake {
    #[zeroize(skip)]
    state: HandshakeState,
    server_seed: [u8; 4],
    extra_seed: [u8; 32],
}

impl ServerHandshake {
    /// Draw fresh seeds from the OS random source.
    pub fn new() -> Result<Self> {
        Ok(Self {
            state: HandshakeState::AwaitingHeader,
            server_seed: random_bytes()?,
            extra_seed: random_bytes()?,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn advance(&mut self, next: HandshakeState) -> Result<()> {
        self.state.advance(next)
    }

    pub fn server_seed(&self) -> [u8; 4] {
        self.server_seed
    }

    /// `SMSG_AUTH_CHALLENGE`: version, seed, 32 bytes of extra seed.
    pub fn challenge_packet(&self) -> ServerPacket {
        let mut packet = ServerPacket::with_capacity(ServerOpcode::AUTH_CHALLENGE, 40);
        packet
            .put_u32(CHALLENGE_VERSION)
            .put_bytes(&self.server_seed)
            .put_bytes(&self.extra_seed);
        packet
    }
}

impl fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Read the 4-byte seed from an `SMSG_AUTH_CHALLENGE` body.
pub fn parse_challenge(payload: &[u8]) -> Result<[u8; 4]> {
    payload
        .get(4..8)
        .and_then(|seed| seed.try_into().ok())
        .ok_or_else(|| {
            ProtocolError::HandshakeError(format!(
                "AUTH_CHALLENGE too short ({} bytes)",
                payload.len()
            ))
        })
}

/// Decoded `CMSG_AUTH_SESSION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSessionPacket {
    pub build: u32,
    pub login_server_id: u32,
    pub account: String,
    pub login_server_type: u32,
    pub local_challenge: [u8; 4],
    pub region_id: u32,
    pub battlegroup_id: u32,
    pub realm_id: u32,
    pub dos_response: u64,
    pub digest: [u8; DIGEST_LEN],
    /// Raw addon blob, see [`crate::protocol::addon`]
    pub addon_data: Bytes,
}

impl AuthSessionPacket {
    pub fn parse(packet: &ClientPacket) -> Result<Self> {
        let mut reader = packet.reader();
        Ok(Self {
            build: reader.read_u32()?,
            login_server_id: reader.read_u32()?,
            account: reader.read_cstring()?,
            login_server_type: reader.read_u32()?,
            local_challenge: reader.read_array()?,
            region_id: reader.read_u32()?,
            battlegroup_id: reader.read_u32()?,
            realm_id: reader.read_u32()?,
            dos_response: reader.read_u64()?,
            digest: reader.read_array()?,
            addon_data: Bytes::copy_from_slice(reader.read_rest()),
        })
    }

    /// Serialize as a client would send it.
    pub fn to_packet(&self) -> ClientPacket {
        let mut body = BytesMut::with_capacity(64 + self.account.len() + self.addon_data.len());
        body.put_u32_le(self.build);
        body.put_u32_le(self.login_server_id);
        body.put_slice(self.account.as_bytes());
        body.put_u8(0);
        body.put_u32_le(self.login_server_type);
        body.put_slice(&self.local_challenge);
        body.put_u32_le(self.region_id);
        body.put_u32_le(self.battlegroup_id);
        body.put_u32_le(self.realm_id);
        body.put_u64_le(self.dos_response);
        body.put_slice(&self.digest);
        body.put_slice(&self.addon_data);
        ClientPacket::new(ClientOpcode::AUTH_SESSION, body.freeze(), 0)
    }

    /// Build a correctly signed request for `account`.
    pub fn signed(
        account: &str,
        realm_id: u32,
        server_seed: &[u8; 4],
        client_seed: [u8; 4],
        key: &SessionKey,
    ) -> Self {
        Self {
            build: 12340,
            login_server_id: 0,
            account: account.to_string(),
            login_server_type: 0,
            local_challenge: client_seed,
            region_id: 0,
            battlegroup_id: 0,
            realm_id,
            dos_response: 0,
            digest: auth_digest(account, &client_seed, server_seed, key),
            addon_data: Bytes::new(),
        }
    }
}

/// Everything the auth checks need besides the request and the account row.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub realm: &'a Realm,
    pub peer_ip: std::net::IpAddr,
    /// Address as the store records it; unspecified when IP logging is off.
    pub recorded_ip: std::net::IpAddr,
    pub ip_info: &'a IpInfo,
    pub server_seed: [u8; 4],
}

fn digests_equal(a: &[u8; DIGEST_LEN], b: &[u8; DIGEST_LEN]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn country_locked(lock: &str) -> bool {
    !lock.is_empty() && lock != "00"
}

/// Run the auth checks in wire order and return the first failing code.
#[instrument(skip_all, fields(account = %request.account, ip = %ctx.peer_ip))]
pub fn verify_account<'a>(
    request: &AuthSessionPacket,
    account: Option<&'a AccountInfo>,
    ctx: &AuthContext<'_>,
) -> std::result::Result<&'a AccountInfo, AuthResponseCode> {
    let Some(account) = account else {
        debug!("Unknown account");
        return Err(AuthResponseCode::UnknownAccount);
    };

    if ctx.realm.is_closed() {
        debug!("World closed, refusing login");
        return Err(AuthResponseCode::Reject);
    }

    if request.realm_id != ctx.realm.id() {
        warn!(
            client_realm = request.realm_id,
            realm = ctx.realm.id(),
            "Client requested a different realm"
        );
        return Err(AuthResponseCode::RealmNotFound);
    }

    if ctx.realm.anticheat_enabled() && account.os != "Win" && account.os != "OSX" {
        warn!(os = %account.os, "Unsupported client OS with anti-cheat enabled");
        return Err(AuthResponseCode::Reject);
    }

    let expected = auth_digest(
        &request.account,
        &request.local_challenge,
        &ctx.server_seed,
        &account.session_key,
    );
    if !digests_equal(&expected, &request.digest) {
        warn!(account_id = account.id, "Auth digest mismatch");
        return Err(AuthResponseCode::Failed);
    }

    if account.locked_to_ip {
        if account.last_ip != Some(ctx.recorded_ip) {
            debug!(account_id = account.id, "Account is locked to another address");
            return Err(AuthResponseCode::Failed);
        }
    } else if country_locked(&account.lock_country) {
        // unknown origin passes the country lock
        if let Some(country) = ctx.ip_info.country.as_deref() {
            if country != account.lock_country {
                debug!(account_id = account.id, lock = %account.lock_country, country, "Country lock mismatch");
                return Err(AuthResponseCode::Failed);
            }
        }
    }

    if account.banned {
        debug!(account_id = account.id, "Account banned");
        return Err(AuthResponseCode::Banned);
    }

    let limit = ctx.realm.security_limit();
    if limit > SEC_PLAYER && account.security < limit {
        debug!(account_id = account.id, limit, "Security level below realm minimum");
        return Err(AuthResponseCode::Unavailable);
    }

    Ok(account)
}

/// `SMSG_AUTH_RESPONSE` carrying only a rejection code.
pub fn auth_error_packet(code: AuthResponseCode) -> ServerPacket {
    let mut packet = ServerPacket::with_capacity(ServerOpcode::AUTH_RESPONSE, 1);
    packet.put_u8(code.as_u8());
    packet
}

/// `SMSG_AUTH_RESPONSE` for a successful login.
pub fn auth_ok_packet(expansion: u8) -> ServerPacket {
    let mut packet = ServerPacket::with_capacity(ServerOpcode::AUTH_RESPONSE, 11);
    packet
        .put_u8(AuthResponseCode::Ok.as_u8())
        .put_u32(0) // billing time remaining
        .put_u8(0) // billing plan flags
        .put_u32(0) // billing time rested
        .put_u8(expansion);
    packet
}
