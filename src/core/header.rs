//! # Header Codec
//!
//! Fixed-size packet headers for both directions.
//!
//! ## Wire Format
//! ```text
//! client -> server   [size: u16 BE][opcode: u32 LE]            6 bytes
//! server -> client   [size: u16 BE][opcode: u16 LE]            4 bytes
//! server -> client   [0x80 | size: u24 BE][opcode: u16 LE]     5 bytes (large)
//! ```
//!
//! The size field counts the opcode field plus the payload. Header structs
//! always carry the payload length; the opcode width is added and removed
//! here. Once the session cipher is running the whole header is encrypted as
//! a unit, so nothing in it can be trusted before [`ClientHeader::decode`]
//! validated it.

use crate::core::opcodes::{ClientOpcode, ServerOpcode};
use crate::error::{ProtocolError, Result};

/// Length of a client header on the wire.
pub const CLIENT_HEADER_LEN: usize = 6;

/// Length of a regular server header on the wire.
pub const SERVER_HEADER_LEN: usize = 4;

/// Length of a server header whose size needs three bytes.
pub const LARGE_SERVER_HEADER_LEN: usize = 5;

const CLIENT_OPCODE_WIDTH: usize = 4;
const SERVER_OPCODE_WIDTH: usize = 2;

/// Default upper bound for the client size field (opcode included).
pub const MAX_CLIENT_PACKET_SIZE: usize = 10240;

/// Largest size field a server header can express.
const MAX_SERVER_WIRE_SIZE: usize = 0x7F_FFFF;

/// Size fields above this need the large header.
const LARGE_HEADER_THRESHOLD: usize = 0x7FFF;

const LARGE_HEADER_FLAG: u8 = 0x80;

/// Decoded client header. `size` is the payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeader {
    pub size: u16,
    pub opcode: ClientOpcode,
}

impl ClientHeader {
    /// Build a header for a payload of `payload_len` bytes.
    pub fn new(payload_len: usize, opcode: ClientOpcode) -> Result<Self> {
        if payload_len + CLIENT_OPCODE_WIDTH > usize::from(u16::MAX) {
            return Err(ProtocolError::MalformedHeader {
                size: payload_len as u32,
                opcode: u32::from(opcode.0),
            });
        }
        Ok(Self {
            size: payload_len as u16,
            opcode,
        })
    }

    pub fn encode(&self) -> [u8; CLIENT_HEADER_LEN] {
        let wire_size = self.size + CLIENT_OPCODE_WIDTH as u16;
        let mut out = [0u8; CLIENT_HEADER_LEN];
        out[..2].copy_from_slice(&wire_size.to_be_bytes());
        out[2..].copy_from_slice(&u32::from(self.opcode.0).to_le_bytes());
        out
    }

    /// Decode and validate an already decrypted header.
    ///
    /// `max_size` bounds the size field, opcode width included.
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self> {
        let raw: [u8; CLIENT_HEADER_LEN] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::MalformedHeader {
                    size: bytes.len() as u32,
                    opcode: 0,
                })?;

        let wire_size = u16::from_be_bytes([raw[0], raw[1]]);
        let opcode = u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]);

        let size_ok =
            usize::from(wire_size) >= CLIENT_OPCODE_WIDTH && usize::from(wire_size) <= max_size;
        if !size_ok || !ClientOpcode::is_valid(opcode) {
            return Err(ProtocolError::MalformedHeader {
                size: u32::from(wire_size),
                opcode,
            });
        }

        Ok(Self {
            size: wire_size - CLIENT_OPCODE_WIDTH as u16,
            opcode: ClientOpcode(opcode as u16),
        })
    }
}

/// Decoded server header. `size` is the payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHeader {
    pub size: u32,
    pub opcode: ServerOpcode,
}

/// Encoded server header, 4 or 5 bytes long.
#[derive(Debug, Clone, Copy)]
pub struct EncodedServerHeader {
    bytes: [u8; LARGE_SERVER_HEADER_LEN],
    len: usize,
}

impl EncodedServerHeader {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Mutable view used to encrypt the header in place.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl ServerHeader {
    pub fn new(payload_len: usize, opcode: ServerOpcode) -> Result<Self> {
        if payload_len + SERVER_OPCODE_WIDTH > MAX_SERVER_WIRE_SIZE {
            return Err(ProtocolError::MalformedHeader {
                size: payload_len as u32,
                opcode: u32::from(opcode.0),
            });
        }
        Ok(Self {
            size: payload_len as u32,
            opcode,
        })
    }

    /// Header length on the wire for this payload size.
    pub fn encoded_len(&self) -> usize {
        if self.size as usize + SERVER_OPCODE_WIDTH > LARGE_HEADER_THRESHOLD {
            LARGE_SERVER_HEADER_LEN
        } else {
            SERVER_HEADER_LEN
        }
    }

    pub fn encode(&self) -> EncodedServerHeader {
        let wire_size = self.size + SERVER_OPCODE_WIDTH as u32;
        let mut bytes = [0u8; LARGE_SERVER_HEADER_LEN];
        let opcode = self.opcode.0.to_le_bytes();

        let len = self.encoded_len();
        if len == LARGE_SERVER_HEADER_LEN {
            bytes[0] = LARGE_HEADER_FLAG | ((wire_size >> 16) as u8 & 0x7F);
            bytes[1] = (wire_size >> 8) as u8;
            bytes[2] = wire_size as u8;
            bytes[3..5].copy_from_slice(&opcode);
        } else {
            bytes[..2].copy_from_slice(&(wire_size as u16).to_be_bytes());
            bytes[2..4].copy_from_slice(&opcode);
        }

        EncodedServerHeader { bytes, len }
    }

    /// Header length announced by the (decrypted) first header byte.
    pub fn wire_len(first_byte: u8) -> usize {
        if first_byte & LARGE_HEADER_FLAG != 0 {
            LARGE_SERVER_HEADER_LEN
        } else {
            SERVER_HEADER_LEN
        }
    }

    /// Decode an already decrypted server header. Any opcode value is
    /// accepted; the client side passes unknown opcodes through.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let malformed = || ProtocolError::MalformedHeader {
            size: bytes.len() as u32,
            opcode: 0,
        };

        let first = *bytes.first().ok_or_else(malformed)?;
        if bytes.len() != Self::wire_len(first) {
            return Err(malformed());
        }

        let (wire_size, opcode) = if bytes.len() == LARGE_SERVER_HEADER_LEN {
            let size = (u32::from(first & 0x7F) << 16)
                | (u32::from(bytes[1]) << 8)
                | u32::from(bytes[2]);
            (size, u16::from_le_bytes([bytes[3], bytes[4]]))
        } else {
            (
                u32::from(u16::from_be_bytes([bytes[0], bytes[1]])),
                u16::from_le_bytes([bytes[2], bytes[3]]),
            )
        };

        if (wire_size as usize) < SERVER_OPCODE_WIDTH {
            return Err(ProtocolError::MalformedHeader {
                size: wire_size,
                opcode: u32::from(opcode),
            });
        }

        Ok(Self {
            size: wire_size - SERVER_OPCODE_WIDTH as u32,
            opcode: ServerOpcode(opcode),
        })
    }
}
