//! Millisecond server clock.
//!
//! The protocol exchanges 32-bit millisecond timestamps that wrap roughly
//! every 49 days, so differences must always go through [`ms_diff`].

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds since the first call in this process, truncated to 32 bits.
pub fn ms_now() -> u32 {
    epoch().elapsed().as_millis() as u32
}

/// Elapsed milliseconds from `old` to `new`, tolerating one wrap.
pub fn ms_diff(old: u32, new: u32) -> u32 {
    new.wrapping_sub(old)
}
