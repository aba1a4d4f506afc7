#![no_main]

use std::sync::Arc;

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use realm_wire::config::TransportConfig;
use realm_wire::core::codec::WorldCodec;
use realm_wire::core::header::{ClientHeader, ServerHeader, MAX_CLIENT_PACKET_SIZE};
use realm_wire::utils::metrics::Metrics;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let _ = ClientHeader::decode(data, MAX_CLIENT_PACKET_SIZE);
    let _ = ServerHeader::decode(data);

    // Feed the raw stream through the server codec until it stalls or errors
    let mut codec = WorldCodec::new(&TransportConfig::default(), Arc::new(Metrics::new()));
    let mut buf = BytesMut::from(data);
    while let Ok(Some(packet)) = codec.decode(&mut buf) {
        assert!(packet.size() + 4 <= MAX_CLIENT_PACKET_SIZE);
    }
});
