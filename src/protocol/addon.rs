//! Addon list sent at the tail of `CMSG_AUTH_SESSION`.
//!
//! ```text
//! [uncompressed size: u32 LE][zlib]
//!     -> [count: u32] { [name: cstring][enabled: u8][crc: u32][unknown: u32] } * count
//!        [timestamp: u32]
//! ```
//!
//! Clients send all sorts of garbage here, so parsing is lenient: whatever
//! parsed before the first error is kept.

use bytes::BufMut;
use tracing::debug;

use crate::core::opcodes::ClientOpcode;
use crate::core::packet::PacketReader;
use crate::error::Result;
use crate::utils::compression::{compress_buffer, decompress_sized_within};

/// Hard cap on the addon count a client may announce.
const MAX_ADDONS: u32 = 512;

/// Largest inflated addon list accepted.
pub const MAX_ADDON_BLOB_SIZE: usize = 0xFFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonInfo {
    pub name: String,
    pub enabled: bool,
    pub crc: u32,
    pub unknown: u32,
}

fn read_addon(reader: &mut PacketReader<'_>) -> Result<AddonInfo> {
    Ok(AddonInfo {
        name: reader.read_cstring()?,
        enabled: reader.read_u8()? != 0,
        crc: reader.read_u32()?,
        unknown: reader.read_u32()?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddonList {
    pub addons: Vec<AddonInfo>,
    pub timestamp: Option<u32>,
}

impl AddonList {
    /// Parse the raw blob; an empty blob yields an empty list.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        if blob.is_empty() {
            return Ok(Self::default());
        }

        let inflated = decompress_sized_within(blob, MAX_ADDON_BLOB_SIZE)?;
        let mut reader = PacketReader::new(ClientOpcode::AUTH_SESSION, &inflated);
        let mut list = Self::default();

        let count = reader.read_u32()?;
        if count > MAX_ADDONS {
            debug!(count, "Addon count over limit, ignoring list");
            return Ok(list);
        }

        for _ in 0..count {
            match read_addon(&mut reader) {
                Ok(addon) => list.addons.push(addon),
                Err(e) => {
                    debug!(error = %e, parsed = list.addons.len(), "Truncated addon list");
                    return Ok(list);
                }
            }
        }

        list.timestamp = reader.read_u32().ok();
        Ok(list)
    }

    /// Build a blob the way a client does.
    pub fn to_blob(&self, level: u32) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.put_u32_le(self.addons.len() as u32);
        for addon in &self.addons {
            raw.put_slice(addon.name.as_bytes());
            raw.put_u8(0);
            raw.put_u8(u8::from(addon.enabled));
            raw.put_u32_le(addon.crc);
            raw.put_u32_le(addon.unknown);
        }
        raw.put_u32_le(self.timestamp.unwrap_or(0));

        let compressed = compress_buffer(&raw, level);
        let mut blob = Vec::with_capacity(4 + compressed.len());
        blob.put_u32_le(raw.len() as u32);
        blob.put_slice(&compressed);
        blob
    }
}
