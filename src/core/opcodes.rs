//! Opcode spaces for both directions.
//!
//! Client and server opcodes share numeric ranges but never meaning, so each
//! direction gets its own newtype. Only opcodes the protocol core touches are
//! named here; game handlers register everything else by raw value.

use std::fmt;

/// Exclusive upper bound of the opcode space in both directions.
pub const NUM_MSG_TYPES: u16 = 0x51F;

/// Opcode of a packet sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientOpcode(pub u16);

/// Opcode of a packet sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerOpcode(pub u16);

impl ClientOpcode {
    pub const PING: ClientOpcode = ClientOpcode(0x1DC);
    pub const AUTH_SESSION: ClientOpcode = ClientOpcode(0x1ED);
    pub const WARDEN_DATA: ClientOpcode = ClientOpcode(0x2E7);
    pub const TIME_SYNC_RESP: ClientOpcode = ClientOpcode(0x391);
    pub const KEEP_ALIVE: ClientOpcode = ClientOpcode(0x407);

    /// Whether the raw wire value lies inside the opcode space.
    pub fn is_valid(raw: u32) -> bool {
        raw < u32::from(NUM_MSG_TYPES)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PING => "CMSG_PING",
            Self::AUTH_SESSION => "CMSG_AUTH_SESSION",
            Self::WARDEN_DATA => "CMSG_WARDEN_DATA",
            Self::TIME_SYNC_RESP => "CMSG_TIME_SYNC_RESP",
            Self::KEEP_ALIVE => "CMSG_KEEP_ALIVE",
            _ => "CMSG_UNKNOWN",
        }
    }
}

impl ServerOpcode {
    pub const UPDATE_OBJECT: ServerOpcode = ServerOpcode(0x0A9);
    pub const NOTIFICATION: ServerOpcode = ServerOpcode(0x1CB);
    pub const PONG: ServerOpcode = ServerOpcode(0x1DD);
    pub const AUTH_CHALLENGE: ServerOpcode = ServerOpcode(0x1EC);
    pub const AUTH_RESPONSE: ServerOpcode = ServerOpcode(0x1EE);
    pub const COMPRESSED_UPDATE_OBJECT: ServerOpcode = ServerOpcode(0x1F6);
    pub const TIME_SYNC_REQ: ServerOpcode = ServerOpcode(0x390);

    pub fn name(self) -> &'static str {
        match self {
            Self::UPDATE_OBJECT => "SMSG_UPDATE_OBJECT",
            Self::NOTIFICATION => "SMSG_NOTIFICATION",
            Self::PONG => "SMSG_PONG",
            Self::AUTH_CHALLENGE => "SMSG_AUTH_CHALLENGE",
            Self::AUTH_RESPONSE => "SMSG_AUTH_RESPONSE",
            Self::COMPRESSED_UPDATE_OBJECT => "SMSG_COMPRESSED_UPDATE_OBJECT",
            Self::TIME_SYNC_REQ => "SMSG_TIME_SYNC_REQ",
            _ => "SMSG_UNKNOWN",
        }
    }
}

impl fmt::Display for ClientOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:#06x}]", self.name(), self.0)
    }
}

impl fmt::Display for ServerOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:#06x}]", self.name(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_range() {
        assert!(ClientOpcode::is_valid(0));
        assert!(ClientOpcode::is_valid(u32::from(NUM_MSG_TYPES) - 1));
        assert!(!ClientOpcode::is_valid(u32::from(NUM_MSG_TYPES)));
        assert!(!ClientOpcode::is_valid(u32::MAX));
    }

    #[test]
    fn test_display_includes_name_and_value() {
        assert_eq!(ClientOpcode::PING.to_string(), "CMSG_PING [0x01dc]");
        assert_eq!(ServerOpcode(0x123).to_string(), "SMSG_UNKNOWN [0x0123]");
    }
}
