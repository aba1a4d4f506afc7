//! # Compression Codec
//!
//! Opportunistic zlib compression of large outbound update packets.
//!
//! A compressed packet has its opcode rewritten to
//! `SMSG_COMPRESSED_UPDATE_OBJECT` and its body replaced with
//! `[uncompressed_size: u32 LE][zlib stream]`. The logical size of the packet
//! is the size before compression.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{debug, error};

use crate::core::opcodes::ServerOpcode;
use crate::core::packet::ServerPacket;
use crate::error::{ProtocolError, Result};

/// Maximum output size for decompression. Mirrors the largest payload a
/// server header can describe.
pub const MAX_DECOMPRESSION_SIZE: usize = 0x7F_FFFF;

const SIZE_PREFIX_LEN: usize = 4;

/// Decides which packets get compressed and how hard.
#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    /// Payloads must be strictly larger than this to be compressed
    pub threshold_bytes: usize,
    /// zlib level, 1 (fastest) to 9 (best)
    pub level: u32,
    /// Opcodes eligible for compression
    pub opcodes: Vec<ServerOpcode>,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            threshold_bytes: 100,
            level: 1,
            opcodes: vec![ServerOpcode::UPDATE_OBJECT],
        }
    }
}

impl CompressionPolicy {
    pub fn new(threshold_bytes: usize, level: u32) -> Self {
        Self {
            threshold_bytes,
            level,
            ..Self::default()
        }
    }

    pub fn needs_compression(&self, packet: &ServerPacket) -> bool {
        packet.size() > self.threshold_bytes && self.opcodes.contains(&packet.opcode)
    }
}

/// Deflate `src` into a zlib stream.
///
/// Returns an empty vector when the compressor fails; callers treat that as
/// "send uncompressed".
pub fn compress_buffer(src: &[u8], level: u32) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(src.len() / 2 + 16),
        Compression::new(level.min(9)),
    );

    if let Err(e) = encoder.write_all(src) {
        error!(error = %e, "Can't compress update packet (deflate)");
        return Vec::new();
    }

    match encoder.finish() {
        Ok(out) => out,
        Err(e) => {
            error!(error = %e, "Can't compress update packet (deflate finish)");
            Vec::new()
        }
    }
}

/// Compress `packet` in place if the policy asks for it.
///
/// Returns whether the packet was rewritten. On compressor failure the packet
/// is left untouched.
pub fn compress_if_needed(packet: &mut ServerPacket, policy: &CompressionPolicy) -> bool {
    if !policy.needs_compression(packet) {
        return false;
    }

    let original_size = packet.size();
    let Ok(size_prefix) = u32::try_from(original_size) else {
        return false;
    };

    let compressed = compress_buffer(&packet.payload, policy.level);
    if compressed.is_empty() {
        return false;
    }

    let mut body = BytesMut::with_capacity(SIZE_PREFIX_LEN + compressed.len());
    body.put_u32_le(size_prefix);
    body.put_slice(&compressed);

    debug!(
        opcode = %packet.opcode,
        original_size,
        compressed_size = body.len(),
        "Compressed outbound packet"
    );

    packet.payload = body;
    packet.opcode = ServerOpcode::COMPRESSED_UPDATE_OBJECT;
    true
}

/// Inflate a `[size: u32 LE][zlib stream]` body.
///
/// The announced size is checked against [`MAX_DECOMPRESSION_SIZE`] before any
/// allocation and must match the inflated length exactly.
pub fn decompress_sized(body: &[u8]) -> Result<Vec<u8>> {
    decompress_sized_within(body, MAX_DECOMPRESSION_SIZE)
}

/// [`decompress_sized`] with a caller-chosen cap on the announced size.
pub fn decompress_sized_within(body: &[u8], limit: usize) -> Result<Vec<u8>> {
    if body.len() < SIZE_PREFIX_LEN {
        return Err(ProtocolError::DecompressionFailure);
    }

    let claimed = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if claimed > limit.min(MAX_DECOMPRESSION_SIZE) {
        return Err(ProtocolError::DecompressionFailure);
    }

    let mut out = Vec::with_capacity(claimed);
    // one extra byte so an oversized stream is detected instead of truncated
    let mut reader = ZlibDecoder::new(&body[SIZE_PREFIX_LEN..]).take(claimed as u64 + 1);
    reader
        .read_to_end(&mut out)
        .map_err(|_| ProtocolError::DecompressionFailure)?;

    if out.len() != claimed {
        return Err(ProtocolError::DecompressionFailure);
    }
    Ok(out)
}

/// Undo [`compress_if_needed`] for a received server packet.
pub fn decompress_packet(packet: &mut ServerPacket, original: ServerOpcode) -> Result<()> {
    if packet.opcode != ServerOpcode::COMPRESSED_UPDATE_OBJECT {
        return Ok(());
    }
    let inflated = decompress_sized(&packet.payload)?;
    packet.payload = BytesMut::from(&inflated[..]);
    packet.opcode = original;
    Ok(())
}
