//! # Header Cipher
//!
//! Session keys, the auth digest and the RC4 header cipher.
//!
//! Each direction runs its own RC4 stream keyed with HMAC-SHA1 over the
//! 40-byte session key; the fixed HMAC seeds are part of the wire protocol.
//! The first 1024 keystream bytes of both streams are discarded. Streams are
//! never re-keyed: every call continues the keystream of the previous one,
//! so headers must be processed in exactly the order they hit the wire.

use std::fmt;

use hmac::{Hmac, Mac};
use rc4::cipher::generic_array::GenericArray;
use rc4::consts::U20;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{constants, ProtocolError, Result};

/// Length of the login-service session key.
pub const SESSION_KEY_LEN: usize = 40;

/// Length of the SHA-1 auth digest.
pub const DIGEST_LEN: usize = 20;

/// Seed for the server -> client stream.
const SERVER_ENCRYPTION_KEY: [u8; 16] = [
    0xCC, 0x98, 0xAE, 0x04, 0xE8, 0x97, 0xEA, 0xCA, 0x12, 0xDD, 0xC0, 0x93, 0x42, 0x91, 0x53, 0x57,
];

/// Seed for the client -> server stream.
const SERVER_DECRYPTION_KEY: [u8; 16] = [
    0xC2, 0xB3, 0x72, 0x3C, 0xC6, 0xAE, 0xD9, 0xB5, 0x34, 0x3C, 0x53, 0xEE, 0x2F, 0x43, 0x67, 0xCE,
];

const KEYSTREAM_DROP: usize = 1024;

type HmacSha1 = Hmac<Sha1>;
type HeaderStream = Rc4<U20>;

/// Shared secret established by the login service.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn new(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for SessionKey {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; SESSION_KEY_LEN] = value.try_into().map_err(|_| {
            ProtocolError::CryptoError(format!(
                "session key must be {SESSION_KEY_LEN} bytes, got {}",
                value.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Which end of the connection a cipher belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptRole {
    Server,
    Client,
}

/// Compute the AUTH_SESSION digest.
///
/// Layout: `account || 00 00 00 00 || client_seed || server_seed || session_key`.
/// The four zero bytes are a protocol constant.
pub fn auth_digest(
    account: &str,
    client_seed: &[u8; 4],
    server_seed: &[u8; 4],
    key: &SessionKey,
) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(account.as_bytes());
    hasher.update([0u8; 4]);
    hasher.update(client_seed);
    hasher.update(server_seed);
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Fill an array from the operating system CSPRNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    getrandom::fill(&mut out)
        .map_err(|e| ProtocolError::CryptoError(format!("{}: {e}", constants::ERR_RANDOM_SOURCE)))?;
    Ok(out)
}

fn derive_stream(seed: &[u8], key: &SessionKey) -> Result<HeaderStream> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(seed)
        .map_err(|_| ProtocolError::CryptoError(constants::ERR_HMAC_KEY.into()))?;
    mac.update(key.as_bytes());
    let mut stream_key: [u8; 20] = mac.finalize().into_bytes().into();

    let mut stream = HeaderStream::new(GenericArray::from_slice(&stream_key));
    stream_key.zeroize();

    let mut drop_buf = [0u8; KEYSTREAM_DROP];
    stream.apply_keystream(&mut drop_buf);
    Ok(stream)
}

/// Stateful header cipher owned by exactly one connection.
///
/// Until [`AuthCrypt::init`] runs, both operations are no-ops so that the
/// handshake travels in clear.
#[derive(Default)]
pub struct AuthCrypt {
    send: Option<HeaderStream>,
    recv: Option<HeaderStream>,
}

impl AuthCrypt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key both streams. A cipher can be initialized once.
    pub fn init(&mut self, key: &SessionKey, role: CryptRole) -> Result<()> {
        if self.is_initialized() {
            return Err(ProtocolError::CryptoError(
                "header cipher already initialized".into(),
            ));
        }

        let (send_seed, recv_seed) = match role {
            CryptRole::Server => (&SERVER_ENCRYPTION_KEY, &SERVER_DECRYPTION_KEY),
            CryptRole::Client => (&SERVER_DECRYPTION_KEY, &SERVER_ENCRYPTION_KEY),
        };

        self.send = Some(derive_stream(send_seed, key)?);
        self.recv = Some(derive_stream(recv_seed, key)?);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.send.is_some()
    }

    pub fn encrypt_send(&mut self, data: &mut [u8]) {
        if let Some(stream) = self.send.as_mut() {
            stream.apply_keystream(data);
        }
    }

    pub fn decrypt_recv(&mut self, data: &mut [u8]) {
        if let Some(stream) = self.recv.as_mut() {
            stream.apply_keystream(data);
        }
    }
}

impl fmt::Debug for AuthCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCrypt")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
