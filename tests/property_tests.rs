//! Property-based tests using proptest
//!
//! These tests check wire-level invariants over randomly generated headers,
//! payloads and keys.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use proptest::prelude::*;
use realm_wire::core::header::{ClientHeader, ServerHeader, MAX_CLIENT_PACKET_SIZE};
use realm_wire::core::opcodes::{ClientOpcode, ServerOpcode, NUM_MSG_TYPES};
use realm_wire::core::packet::{ClientPacket, ServerPacket};
use realm_wire::error::ProtocolError;
use realm_wire::protocol::addon::AddonList;
use realm_wire::protocol::handshake::AuthSessionPacket;
use realm_wire::utils::compression::{
    compress_if_needed, decompress_packet, CompressionPolicy,
};
use realm_wire::utils::crypto::{auth_digest, AuthCrypt, CryptRole, SessionKey, SESSION_KEY_LEN};

fn session_key() -> impl Strategy<Value = SessionKey> {
    prop::collection::vec(any::<u8>(), SESSION_KEY_LEN).prop_map(|bytes| {
        let mut raw = [0u8; SESSION_KEY_LEN];
        raw.copy_from_slice(&bytes);
        SessionKey::new(raw)
    })
}

// Property: a client header survives encode/decode for every legal size
proptest! {
    #[test]
    fn prop_client_header_roundtrip(
        payload_len in 0usize..=(MAX_CLIENT_PACKET_SIZE - 4),
        opcode in 0u16..NUM_MSG_TYPES,
    ) {
        let header = ClientHeader::new(payload_len, ClientOpcode(opcode)).unwrap();
        let decoded = ClientHeader::decode(&header.encode(), MAX_CLIENT_PACKET_SIZE).unwrap();

        prop_assert_eq!(decoded, header);
        prop_assert_eq!(usize::from(decoded.size), payload_len);
    }
}

// Property: decoding arbitrary header bytes never panics, and anything it
// accepts is within bounds
proptest! {
    #[test]
    fn prop_client_header_decode_total(bytes in prop::collection::vec(any::<u8>(), 0..12)) {
        match ClientHeader::decode(&bytes, MAX_CLIENT_PACKET_SIZE) {
            Ok(header) => {
                prop_assert_eq!(bytes.len(), 6);
                prop_assert!(usize::from(header.size) + 4 <= MAX_CLIENT_PACKET_SIZE);
                prop_assert!(header.opcode.0 < NUM_MSG_TYPES);
            }
            Err(e) => {
                let malformed = matches!(e, ProtocolError::MalformedHeader { .. });
                prop_assert!(malformed, "unexpected error: {}", e);
            }
        }
    }
}

// Property: oversize or out-of-range headers are always rejected
proptest! {
    #[test]
    fn prop_client_header_limits(
        wire_size in (MAX_CLIENT_PACKET_SIZE as u16 + 1)..=u16::MAX,
        opcode in u32::from(NUM_MSG_TYPES)..=u32::MAX,
    ) {
        let mut raw = [0u8; 6];
        raw[..2].copy_from_slice(&wire_size.to_be_bytes());
        raw[2..].copy_from_slice(&0x1EDu32.to_le_bytes());
        prop_assert!(ClientHeader::decode(&raw, MAX_CLIENT_PACKET_SIZE).is_err());

        raw[..2].copy_from_slice(&8u16.to_be_bytes());
        raw[2..].copy_from_slice(&opcode.to_le_bytes());
        prop_assert!(ClientHeader::decode(&raw, MAX_CLIENT_PACKET_SIZE).is_err());
    }
}

// Property: server headers roundtrip in both the short and the large form
proptest! {
    #[test]
    fn prop_server_header_roundtrip(payload_len in 0usize..0x2_0000, opcode in any::<u16>()) {
        let header = ServerHeader::new(payload_len, ServerOpcode(opcode)).unwrap();
        let encoded = header.encode();

        let expected_len = if payload_len + 2 > 0x7FFF { 5 } else { 4 };
        prop_assert_eq!(encoded.len(), expected_len);
        prop_assert_eq!(ServerHeader::wire_len(encoded.as_bytes()[0]), expected_len);

        let decoded = ServerHeader::decode(encoded.as_bytes()).unwrap();
        prop_assert_eq!(decoded, header);
    }
}

// Property: the server's send stream is the client's receive stream and vice
// versa, for any key and any sequence of header-sized writes
proptest! {
    #[test]
    fn prop_cipher_streams_pair_up(
        key in session_key(),
        headers in prop::collection::vec(prop::collection::vec(any::<u8>(), 4..=6), 1..32),
    ) {
        let mut server = AuthCrypt::new();
        let mut client = AuthCrypt::new();
        server.init(&key, CryptRole::Server).unwrap();
        client.init(&key, CryptRole::Client).unwrap();

        for original in &headers {
            let mut data = original.clone();
            server.encrypt_send(&mut data);
            client.decrypt_recv(&mut data);
            prop_assert_eq!(&data, original);

            let mut data = original.clone();
            client.encrypt_send(&mut data);
            server.decrypt_recv(&mut data);
            prop_assert_eq!(&data, original);
        }
    }
}

// Property: the digest binds every input; flipping any single byte of the
// account, either seed or the session key changes it
proptest! {
    #[test]
    fn prop_digest_binds_inputs(
        key in session_key(),
        client_seed in any::<[u8; 4]>(),
        server_seed in any::<[u8; 4]>(),
        seed_flip in 0usize..4,
        key_flip in 0usize..SESSION_KEY_LEN,
        name_flip in 0usize..6,
        mask in 1u8..=u8::MAX,
    ) {
        let digest = auth_digest("PLAYER", &client_seed, &server_seed, &key);
        prop_assert_eq!(digest, auth_digest("PLAYER", &client_seed, &server_seed, &key));

        let mut other_server = server_seed;
        other_server[seed_flip] ^= mask;
        prop_assert_ne!(digest, auth_digest("PLAYER", &client_seed, &other_server, &key));

        let mut other_client = client_seed;
        other_client[seed_flip] ^= mask;
        prop_assert_ne!(digest, auth_digest("PLAYER", &other_client, &server_seed, &key));

        let mut raw = *key.as_bytes();
        raw[key_flip] ^= mask;
        let other_key = SessionKey::new(raw);
        prop_assert_ne!(digest, auth_digest("PLAYER", &client_seed, &server_seed, &other_key));

        // stay in ASCII so the name remains a valid string
        let mut name = *b"PLAYER";
        name[name_flip] ^= mask & 0x1F;
        if name != *b"PLAYER" {
            let other_name = std::str::from_utf8(&name).unwrap();
            prop_assert_ne!(digest, auth_digest(other_name, &client_seed, &server_seed, &key));
        }
        prop_assert_ne!(digest, auth_digest("PLAYER2", &client_seed, &server_seed, &key));
    }
}

// Property: compressed update packets inflate back to the original, and
// anything at or below the threshold is left alone
proptest! {
    #[test]
    fn prop_update_compression_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..20_000),
        level in 1u32..=9,
    ) {
        let policy = CompressionPolicy::new(100, level);
        let mut packet = ServerPacket::new(ServerOpcode::UPDATE_OBJECT);
        packet.put_bytes(&payload);

        let compressed = compress_if_needed(&mut packet, &policy);
        prop_assert_eq!(compressed, payload.len() > 100);

        if compressed {
            prop_assert_eq!(packet.opcode, ServerOpcode::COMPRESSED_UPDATE_OBJECT);
            decompress_packet(&mut packet, ServerOpcode::UPDATE_OBJECT).unwrap();
        }
        prop_assert_eq!(packet.opcode, ServerOpcode::UPDATE_OBJECT);
        prop_assert_eq!(&packet.payload[..], &payload[..]);
    }
}

// Property: the login parsers never panic on garbage
proptest! {
    #[test]
    fn prop_auth_session_parse_total(payload in prop::collection::vec(any::<u8>(), 0..256)) {
        let packet = ClientPacket::new(ClientOpcode::AUTH_SESSION, Bytes::from(payload), 0);
        let _ = AuthSessionPacket::parse(&packet);
    }

    #[test]
    fn prop_addon_parse_total(blob in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = AddonList::parse(&blob);
    }
}
