#![no_main]

use libfuzzer_sys::fuzz_target;
use realm_wire::core::opcodes::ClientOpcode;
use realm_wire::core::packet::ClientPacket;
use realm_wire::protocol::handshake::{parse_challenge, AuthSessionPacket};

fuzz_target!(|data: &[u8]| {
    let _ = parse_challenge(data);

    let packet = ClientPacket::new(ClientOpcode::AUTH_SESSION, data.to_vec(), 0);
    if let Ok(request) = AuthSessionPacket::parse(&packet) {
        // Names are decoded lossily, so only clean UTF-8 reserializes exactly
        let name_len = request.account.len();
        if data.get(8..8 + name_len) == Some(request.account.as_bytes()) {
            assert_eq!(&request.to_packet().payload[..], data);
        }
    }
});
