//! # Utility Modules
//!
//! Supporting utilities for cryptography, compression, logging, and timing.
//!
//! ## Components
//! - **Crypto**: RC4 header cipher, session keys and the auth digest
//! - **Compression**: zlib compression of outbound update packets with size limits
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Ring Buffer**: Fixed-capacity sample history
//! - **Time**: Wrapping 32-bit millisecond clock
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Decompression bomb protection (announced size checked before inflating)
//! - Memory zeroing for session keys (zeroize crate)

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod ring_buffer;
pub mod time;
