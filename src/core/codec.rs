//! # Packet Codecs
//!
//! `tokio_util` codecs that frame world packets over a byte stream.
//!
//! [`WorldCodec`] is the server end: it decodes client packets and encodes
//! server packets. [`ClientCodec`] is the mirror image used by test clients
//! and tools. Both own the connection's [`AuthCrypt`], so the cipher is never
//! shared and headers are processed strictly in wire order.
//!
//! A client header is decrypted exactly once and then held until its payload
//! has fully arrived; a partial read never re-runs the keystream.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::config::TransportConfig;
use crate::core::header::{
    ClientHeader, ServerHeader, CLIENT_HEADER_LEN, LARGE_SERVER_HEADER_LEN,
};
use crate::core::opcodes::ServerOpcode;
use crate::core::packet::{ClientPacket, ServerPacket};
use crate::error::{ProtocolError, Result};
use crate::utils::compression::{self, CompressionPolicy};
use crate::utils::crypto::{AuthCrypt, CryptRole, SessionKey};
use crate::utils::metrics::Metrics;
use crate::utils::time::ms_now;

/// Ceiling for the adaptive send buffer reservation.
pub const MAX_SEND_BUFFER_SIZE: usize = 65536;

/// Server-side codec: client packets in, server packets out.
#[derive(Debug)]
pub struct WorldCodec {
    crypt: AuthCrypt,
    pending: Option<ClientHeader>,
    max_client_packet_size: usize,
    compression: CompressionPolicy,
    send_buffer_size: usize,
    metrics: Arc<Metrics>,
}

impl WorldCodec {
    pub fn new(config: &TransportConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            crypt: AuthCrypt::new(),
            pending: None,
            max_client_packet_size: config.max_client_packet_size,
            compression: config.compression_policy(),
            send_buffer_size: config.send_buffer_size.clamp(1, MAX_SEND_BUFFER_SIZE),
            metrics,
        }
    }

    /// Start encrypting headers. Everything encoded or decoded afterwards
    /// goes through the session cipher.
    pub fn init_crypt(&mut self, key: &SessionKey) -> Result<()> {
        self.crypt.init(key, CryptRole::Server)
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypt.is_initialized()
    }

    /// Current preferred reservation for outbound writes.
    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size
    }
}

impl Decoder for WorldCodec {
    type Item = ClientPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientPacket>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < CLIENT_HEADER_LEN {
                    src.reserve(CLIENT_HEADER_LEN - src.len());
                    return Ok(None);
                }

                let mut raw = src.split_to(CLIENT_HEADER_LEN);
                self.crypt.decrypt_recv(&mut raw);
                let header = ClientHeader::decode(&raw, self.max_client_packet_size)?;
                self.pending = Some(header);
                header
            }
        };

        let size = usize::from(header.size);
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(size).freeze();
        self.metrics
            .packet_received((CLIENT_HEADER_LEN + size) as u64);
        trace!(opcode = %header.opcode, size, "C->S");

        Ok(Some(ClientPacket::new(header.opcode, payload, ms_now())))
    }
}

impl Encoder<ServerPacket> for WorldCodec {
    type Error = ProtocolError;

    fn encode(&mut self, mut packet: ServerPacket, dst: &mut BytesMut) -> Result<()> {
        if self.compression.needs_compression(&packet) {
            self.metrics.compression_attempt();
            if compression::compress_if_needed(&mut packet, &self.compression) {
                self.metrics.compression_success();
            }
        }

        let header = ServerHeader::new(packet.size(), packet.opcode)?;
        let mut encoded = header.encode();
        self.crypt.encrypt_send(encoded.as_mut_bytes());

        let total = encoded.len() + packet.size();
        if total > self.send_buffer_size {
            self.send_buffer_size = total.min(MAX_SEND_BUFFER_SIZE);
        }
        if dst.capacity() - dst.len() < total {
            dst.reserve(total.max(self.send_buffer_size));
        }

        dst.put_slice(encoded.as_bytes());
        dst.put_slice(&packet.payload);

        self.metrics.packet_sent(total as u64);
        trace!(opcode = %packet.opcode, size = packet.size(), "S->C");
        Ok(())
    }
}

/// Client-side codec: server packets in, client packets out.
///
/// Compressed update packets are inflated back into
/// `SMSG_UPDATE_OBJECT` before they are handed out.
#[derive(Debug, Default)]
pub struct ClientCodec {
    crypt: AuthCrypt,
    header_buf: [u8; LARGE_SERVER_HEADER_LEN],
    header_filled: usize,
    header_len: usize,
    pending: Option<ServerHeader>,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_crypt(&mut self, key: &SessionKey) -> Result<()> {
        self.crypt.init(key, CryptRole::Client)
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypt.is_initialized()
    }

    fn take_header(&mut self, src: &mut BytesMut) -> Result<Option<ServerHeader>> {
        if self.header_filled == 0 {
            if src.is_empty() {
                return Ok(None);
            }
            let mut first = [src.get_u8()];
            self.crypt.decrypt_recv(&mut first);
            self.header_buf[0] = first[0];
            self.header_filled = 1;
            self.header_len = ServerHeader::wire_len(first[0]);
        }

        let missing = self.header_len - self.header_filled;
        if src.len() < missing {
            return Ok(None);
        }

        let mut rest = src.split_to(missing);
        self.crypt.decrypt_recv(&mut rest);
        self.header_buf[self.header_filled..self.header_len].copy_from_slice(&rest);

        let header = ServerHeader::decode(&self.header_buf[..self.header_len])?;
        self.header_filled = 0;
        self.header_len = 0;
        Ok(Some(header))
    }
}

impl Decoder for ClientCodec {
    type Item = ServerPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerPacket>> {
        if self.pending.is_none() {
            self.pending = self.take_header(src)?;
        }
        let Some(header) = self.pending else {
            return Ok(None);
        };

        let size = header.size as usize;
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        self.pending = None;
        let mut packet = ServerPacket {
            opcode: header.opcode,
            payload: src.split_to(size),
        };
        compression::decompress_packet(&mut packet, ServerOpcode::UPDATE_OBJECT)?;
        Ok(Some(packet))
    }
}

impl Encoder<ClientPacket> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: ClientPacket, dst: &mut BytesMut) -> Result<()> {
        let mut header = ClientHeader::new(packet.size(), packet.opcode)?.encode();
        self.crypt.encrypt_send(&mut header);

        dst.reserve(CLIENT_HEADER_LEN + packet.size());
        dst.put_slice(&header);
        dst.put_slice(&packet.payload);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::opcodes::ClientOpcode;
    use crate::utils::crypto::SESSION_KEY_LEN;

    fn server_codec() -> WorldCodec {
        WorldCodec::new(&TransportConfig::default(), Arc::new(Metrics::new()))
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = server_codec();
        let mut buf = BytesMut::from(&[0x00, 0x08, 0xDC][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_header_then_split_payload() {
        let mut codec = server_codec();
        let mut buf = BytesMut::from(&[0x00, 0x0C, 0xDC, 0x01, 0x00, 0x00, 1, 2, 3][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        // header consumed, payload still waiting
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&[4, 5, 6, 7, 8]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.opcode, ClientOpcode::PING);
        assert_eq!(&packet.payload[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_header_is_an_error() {
        let mut codec = server_codec();
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xDC, 0x01, 0x00, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_encrypted_roundtrip_both_directions() {
        let key = SessionKey::new([0x5A; SESSION_KEY_LEN]);
        let mut server = server_codec();
        let mut client = ClientCodec::new();
        server.init_crypt(&key).unwrap();
        client.init_crypt(&key).unwrap();

        let mut wire = BytesMut::new();
        for counter in 0..3u32 {
            let mut payload = BytesMut::new();
            payload.put_u32_le(counter);
            payload.put_u32_le(50);
            let ping = ClientPacket::new(ClientOpcode::PING, payload.freeze(), 0);
            client.encode(ping, &mut wire).unwrap();
        }

        for counter in 0..3u32 {
            let packet = server.decode(&mut wire).unwrap().unwrap();
            assert_eq!(packet.opcode, ClientOpcode::PING);
            assert_eq!(packet.reader().read_u32().unwrap(), counter);

            let mut pong = ServerPacket::new(ServerOpcode::PONG);
            pong.put_u32(counter);
            let mut out = BytesMut::new();
            server.encode(pong, &mut out).unwrap();
            let echoed = client.decode(&mut out).unwrap().unwrap();
            assert_eq!(echoed.opcode, ServerOpcode::PONG);
            assert_eq!(&echoed.payload[..], &counter.to_le_bytes());
        }
    }

    #[test]
    fn test_large_update_compressed_and_restored() {
        let mut server = server_codec();
        let mut client = ClientCodec::new();

        let mut update = ServerPacket::new(ServerOpcode::UPDATE_OBJECT);
        update.put_bytes(&vec![7u8; 40_000]);

        let mut wire = BytesMut::new();
        server.encode(update.clone(), &mut wire).unwrap();
        assert!(wire.len() < 40_000);
        assert_eq!(
            u16::from_le_bytes([wire[2], wire[3]]),
            ServerOpcode::COMPRESSED_UPDATE_OBJECT.0
        );

        let decoded = client.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_large_header_feeds_byte_by_byte() {
        let mut server = WorldCodec::new(
            &TransportConfig {
                compression_threshold_bytes: usize::MAX,
                ..TransportConfig::default()
            },
            Arc::new(Metrics::new()),
        );
        let key = SessionKey::new([1; SESSION_KEY_LEN]);
        server.init_crypt(&key).unwrap();
        let mut client = ClientCodec::new();
        client.init_crypt(&key).unwrap();

        let mut big = ServerPacket::new(ServerOpcode::UPDATE_OBJECT);
        big.put_bytes(&vec![3u8; 0x8000]);
        let mut wire = BytesMut::new();
        server.encode(big.clone(), &mut wire).unwrap();
        assert_eq!(server.send_buffer_size(), MAX_SEND_BUFFER_SIZE.min(wire.len()));

        let mut feed = BytesMut::new();
        let mut decoded = None;
        for byte in wire.iter() {
            feed.put_u8(*byte);
            if let Some(packet) = client.decode(&mut feed).unwrap() {
                decoded = Some(packet);
            }
        }
        assert_eq!(decoded.unwrap(), big);
    }
}
