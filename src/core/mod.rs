//! # Core Protocol Components
//!
//! Low-level packet handling: opcodes, headers, packets and stream codecs.
//!
//! ## Components
//! - **Opcodes**: direction-scoped opcode newtypes
//! - **Header**: fixed-size header encode/decode with bounds validation
//! - **Packet**: decoded packets and bounds-checked payload readers
//! - **Codec**: Tokio codecs for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! C->S  [Size(2, BE)] [Opcode(4, LE)] [Payload(N)]
//! S->C  [Size(2, BE)] [Opcode(2, LE)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Client size field bounded by `max_client_packet_size` before any allocation
//! - Opcodes outside the opcode space are rejected before the payload is read

pub mod codec;
pub mod header;
pub mod opcodes;
pub mod packet;
