#![no_main]

use libfuzzer_sys::fuzz_target;
use realm_wire::protocol::addon::AddonList;
use realm_wire::utils::compression::{decompress_sized, MAX_DECOMPRESSION_SIZE};

fuzz_target!(|data: &[u8]| {
    // Size limits must hold for malformed streams and lying size prefixes
    if let Ok(out) = decompress_sized(data) {
        assert!(out.len() <= MAX_DECOMPRESSION_SIZE);
    }
    let _ = AddonList::parse(data);
});
