//! Decoded packets and the little-endian readers/writers used by handlers.
//!
//! A packet's logical size is always its payload length; compression and
//! header framing are wire concerns handled by the codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::opcodes::{ClientOpcode, ServerOpcode};
use crate::error::{ProtocolError, Result};

/// Packet received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPacket {
    pub opcode: ClientOpcode,
    pub payload: Bytes,
    /// Server clock (see [`crate::utils::time::ms_now`]) when the network
    /// task finished reading the packet.
    pub received_ms: u32,
}

impl ClientPacket {
    pub fn new(opcode: ClientOpcode, payload: impl Into<Bytes>, received_ms: u32) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            received_ms,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(self.opcode, &self.payload)
    }
}

/// Packet queued for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPacket {
    pub opcode: ServerOpcode,
    pub payload: BytesMut,
}

impl ServerPacket {
    pub fn new(opcode: ServerOpcode) -> Self {
        Self {
            opcode,
            payload: BytesMut::new(),
        }
    }

    pub fn with_capacity(opcode: ServerOpcode, capacity: usize) -> Self {
        Self {
            opcode,
            payload: BytesMut::with_capacity(capacity),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.payload.put_u8(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.payload.put_u32_le(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.payload.put_u64_le(value);
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.payload.put_slice(value);
        self
    }

    /// Write a NUL-terminated string.
    pub fn put_cstring(&mut self, value: &str) -> &mut Self {
        self.payload.put_slice(value.as_bytes());
        self.payload.put_u8(0);
        self
    }
}

/// Bounds-checked little-endian reader over a client payload.
///
/// Every read past the end yields [`ProtocolError::MalformedPayload`].
pub struct PacketReader<'a> {
    opcode: ClientOpcode,
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(opcode: ClientOpcode, buf: &'a [u8]) -> Self {
        Self { opcode, buf }
    }

    fn underrun(&self) -> ProtocolError {
        ProtocolError::MalformedPayload {
            opcode: self.opcode.0,
        }
    }

    fn ensure(&self, len: usize) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(self.underrun());
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Read a NUL-terminated string. Invalid UTF-8 is replaced lossily.
    pub fn read_cstring(&mut self) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.underrun())?;
        let value = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.advance(end + 1);
        Ok(value)
    }

    /// Take everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reads_little_endian_fields() {
        let mut packet = ServerPacket::new(ServerOpcode::PONG);
        packet
            .put_u32(0xDEADBEEF)
            .put_cstring("ADMIN")
            .put_u64(7)
            .put_u8(3);

        let mut reader = PacketReader::new(ClientOpcode::PING, &packet.payload);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_cstring().unwrap(), "ADMIN");
        assert_eq!(reader.read_u64().unwrap(), 7);
        assert_eq!(reader.read_u8().unwrap(), 3);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_underrun_is_malformed_payload() {
        let mut reader = PacketReader::new(ClientOpcode::PING, &[1, 2, 3]);
        assert!(matches!(
            reader.read_u32(),
            Err(ProtocolError::MalformedPayload { opcode: 0x1DC })
        ));
        // a failed read does not consume anything
        assert_eq!(reader.remaining(), 3);
    }

    #[test]
    fn test_unterminated_cstring_fails() {
        let mut reader = PacketReader::new(ClientOpcode::AUTH_SESSION, b"NAME");
        assert!(reader.read_cstring().is_err());
    }

    #[test]
    fn test_read_rest_drains() {
        let mut reader = PacketReader::new(ClientOpcode::AUTH_SESSION, &[9, 8, 7]);
        assert_eq!(reader.read_u8().unwrap(), 9);
        assert_eq!(reader.read_rest(), &[8, 7]);
        assert_eq!(reader.remaining(), 0);
    }
}
