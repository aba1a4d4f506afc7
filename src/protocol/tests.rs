// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::config::{FloodPolicy, SessionConfig};
use crate::core::opcodes::{ClientOpcode, ServerOpcode};
use crate::core::packet::{ClientPacket, ServerPacket};
use crate::error::Result;
use crate::protocol::addon::AddonList;
use crate::protocol::clock_sync::ClockSync;
use crate::protocol::dispatcher::{Affinity, Dispatcher, HandlerEntry};
use crate::protocol::session::{Outbound, PacketFilter, Session, SessionLink};
use crate::service::accounts::AccountInfo;
use crate::utils::crypto::{SessionKey, SESSION_KEY_LEN};
use crate::utils::metrics::Metrics;

const ECHO: ServerOpcode = ServerOpcode(0x100);

const IN_PLACE: ClientOpcode = ClientOpcode(0x010);
const WORLD_ONLY: ClientOpcode = ClientOpcode(0x020);
const MAP_ONLY: ClientOpcode = ClientOpcode(0x030);
const EXPLODES: ClientOpcode = ClientOpcode(0x040);
const UNHANDLED: ClientOpcode = ClientOpcode(0x050);
const LIMITED: ClientOpcode = ClientOpcode(0x060);
const STAFF_ONLY: ClientOpcode = ClientOpcode(0x070);

fn echo(session: &mut Session, packet: &mut ClientPacket) -> Result<()> {
    let mut reply = ServerPacket::new(ECHO);
    reply.put_bytes(&packet.payload);
    session.send(reply);
    Ok(())
}

fn explode(_: &mut Session, _: &mut ClientPacket) -> Result<()> {
    panic!("handler bug");
}

fn dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::with_defaults();
    dispatcher
        .register(IN_PLACE, "IN_PLACE", Affinity::InPlace, echo)
        .unwrap();
    dispatcher
        .register(WORLD_ONLY, "WORLD_ONLY", Affinity::WorldThread, echo)
        .unwrap();
    dispatcher
        .register(MAP_ONLY, "MAP_ONLY", Affinity::MapThread, echo)
        .unwrap();
    dispatcher
        .register(EXPLODES, "EXPLODES", Affinity::InPlace, explode)
        .unwrap();
    dispatcher
        .register_entry(
            LIMITED,
            HandlerEntry::new("LIMITED", Affinity::InPlace, echo).with_rate_limit(3),
        )
        .unwrap();
    dispatcher
        .register_entry(
            STAFF_ONLY,
            HandlerEntry::new("STAFF_ONLY", Affinity::InPlace, echo).with_min_security(2),
        )
        .unwrap();
    dispatcher
}

struct Harness {
    session: Session,
    outbound: mpsc::Receiver<Outbound>,
    metrics: Arc<Metrics>,
}

impl Harness {
    fn new() -> Self {
        Self::with(SessionConfig::default(), 0)
    }

    fn with(config: SessionConfig, security: u8) -> Self {
        let (link, outbound) = SessionLink::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 50_000)),
            42,
            security,
            config.inbound_queue_limit,
            config.outbound_queue_limit,
        );
        let metrics = Arc::new(Metrics::new());
        let mut account = AccountInfo::new(42, "PLAYER", SessionKey::new([9; SESSION_KEY_LEN]));
        account.security = security;
        let session = Session::new(
            account,
            2,
            AddonList::default(),
            link,
            Arc::new(dispatcher()),
            &config,
            Arc::clone(&metrics),
        );
        Self {
            session,
            outbound,
            metrics,
        }
    }

    fn push(&self, opcode: ClientOpcode, tag: u8) {
        self.session
            .link()
            .enqueue(ClientPacket::new(opcode, vec![tag], 0))
            .unwrap();
    }

    fn push_at(&self, opcode: ClientOpcode, tag: u8, received_ms: u32) {
        self.session
            .link()
            .enqueue(ClientPacket::new(opcode, vec![tag], received_ms))
            .unwrap();
    }

    /// Packets sent so far.
    fn sent(&mut self) -> Vec<ServerPacket> {
        let mut packets = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            if let Outbound::Packet(packet) = message {
                packets.push(packet);
            }
        }
        packets
    }

    /// Tags echoed back so far, in order.
    fn echoed(&mut self) -> Vec<u8> {
        self.sent()
            .into_iter()
            .filter(|packet| packet.opcode == ECHO)
            .map(|packet| packet.payload[0])
            .collect()
    }

    /// Counters of the time-sync requests sent so far.
    fn time_sync_requests(&mut self) -> Vec<u32> {
        let mut counters = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            if let Outbound::Packet(packet) = message {
                if packet.opcode == ServerOpcode::TIME_SYNC_REQ {
                    let raw: [u8; 4] = packet.payload[..4].try_into().unwrap();
                    counters.push(u32::from_le_bytes(raw));
                }
            }
        }
        counters
    }
}

#[test]
fn test_world_pass_defers_map_packets_until_in_world() {
    let mut h = Harness::new();
    h.push(WORLD_ONLY, 1);
    h.push(MAP_ONLY, 2);
    h.push(WORLD_ONLY, 3);
    h.push(MAP_ONLY, 4);
    h.push(WORLD_ONLY, 5);

    assert!(h.session.update(50, PacketFilter::World));
    assert_eq!(h.echoed(), vec![1, 3, 5]);
    assert_eq!(h.session.link().queued(), 2);

    // not in world: the map pass leaves them alone
    assert!(h.session.update(50, PacketFilter::Map));
    assert!(h.echoed().is_empty());

    h.session.enter_world();
    h.session.update(50, PacketFilter::World);
    assert!(h.echoed().is_empty());

    h.session.update(50, PacketFilter::Map);
    assert_eq!(h.echoed(), vec![2, 4]);
    assert_eq!(h.session.link().queued(), 0);
}

#[test]
fn test_passes_halt_on_foreign_affinity() {
    let mut h = Harness::new();
    h.session.enter_world();
    h.time_sync_requests();

    h.push(IN_PLACE, 1);
    h.push(MAP_ONLY, 2);
    h.push(WORLD_ONLY, 3);
    h.push(IN_PLACE, 4);

    h.session.update(0, PacketFilter::World);
    assert_eq!(h.echoed(), vec![1]);

    h.session.update(0, PacketFilter::Map);
    assert_eq!(h.echoed(), vec![2]);

    h.session.update(0, PacketFilter::World);
    assert_eq!(h.echoed(), vec![3, 4]);
}

#[test]
fn test_unhandled_opcodes_are_dropped() {
    let mut h = Harness::new();
    h.push(UNHANDLED, 1);
    h.push(IN_PLACE, 2);
    h.session.update(0, PacketFilter::Map);
    assert_eq!(h.echoed(), vec![2]);
    assert_eq!(h.session.link().queued(), 0);
}

#[test]
fn test_packets_per_update_cap() {
    let mut h = Harness::new();
    for i in 0..200u32 {
        h.push(IN_PLACE, (i % 256) as u8);
    }

    h.session.update(0, PacketFilter::World);
    assert_eq!(h.echoed().len(), 150);
    assert_eq!(h.session.link().queued(), 50);

    h.session.update(0, PacketFilter::World);
    assert_eq!(h.echoed().len(), 50);
}

#[test]
fn test_deferred_packets_count_toward_cap() {
    let mut h = Harness::new();
    for _ in 0..150 {
        h.push(MAP_ONLY, 0);
    }
    h.push(WORLD_ONLY, 7);

    h.session.update(0, PacketFilter::World);
    assert!(h.echoed().is_empty());
    assert_eq!(h.session.link().queued(), 151);
}

#[test]
fn test_handler_panic_is_contained() {
    let mut h = Harness::new();
    h.push(EXPLODES, 1);
    h.push(IN_PLACE, 2);

    assert!(h.session.update(0, PacketFilter::World));
    assert_eq!(h.echoed(), vec![2]);
    assert_eq!(h.metrics.snapshot().handler_failures, 1);
    assert!(h.session.link().is_open());
}

#[test]
fn test_malformed_payload_closes_session() {
    let mut h = Harness::new();
    h.session
        .link()
        .enqueue(ClientPacket::new(ClientOpcode::TIME_SYNC_RESP, vec![1u8, 2], 0))
        .unwrap();
    h.push(IN_PLACE, 9);

    assert!(!h.session.update(0, PacketFilter::World));
    assert!(h.echoed().is_empty());
    assert_eq!(h.metrics.snapshot().protocol_errors, 1);
}

#[test]
fn test_flood_kicks_under_kick_policy() {
    let mut h = Harness::new();
    for tag in 0..5 {
        h.push(LIMITED, tag);
    }

    assert!(!h.session.update(0, PacketFilter::World));
    assert_eq!(h.echoed(), vec![0, 1, 2]);
    assert_eq!(h.metrics.snapshot().packets_throttled, 1);
    assert!(!h.session.link().is_open());
}

#[test]
fn test_flood_only_logged_under_log_policy() {
    let config = SessionConfig {
        flood_policy: FloodPolicy::Log,
        ..SessionConfig::default()
    };
    let mut h = Harness::with(config, 0);
    for tag in 0..5 {
        h.push(LIMITED, tag);
    }

    assert!(h.session.update(0, PacketFilter::World));
    assert_eq!(h.echoed(), vec![0, 1, 2, 3, 4]);
    assert_eq!(h.metrics.snapshot().packets_throttled, 2);
}

#[test]
fn test_flood_counter_resets_each_second() {
    let mut h = Harness::new();
    for tag in 0..3 {
        h.push_at(LIMITED, tag, 10_200);
    }
    for tag in 3..6 {
        h.push_at(LIMITED, tag, 11_000);
    }
    // other opcodes have their own budget
    h.push_at(IN_PLACE, 6, 11_000);

    assert!(h.session.update(0, PacketFilter::World));
    assert_eq!(h.echoed(), vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(h.metrics.snapshot().packets_throttled, 0);
}

#[test]
fn test_security_gate_refuses_players() {
    let mut h = Harness::new();
    h.push(STAFF_ONLY, 1);
    h.push(IN_PLACE, 2);

    assert!(h.session.update(0, PacketFilter::World));
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].opcode, ServerOpcode::NOTIFICATION);
    assert_eq!(sent[0].payload.last(), Some(&0));
    assert_eq!(sent[1].opcode, ECHO);
    assert_eq!(&sent[1].payload[..], &[2]);
    assert_eq!(h.metrics.snapshot().permission_denials, 1);
}

#[test]
fn test_security_gate_admits_staff() {
    let mut h = Harness::with(SessionConfig::default(), 2);
    h.push(STAFF_ONLY, 1);

    assert!(h.session.update(0, PacketFilter::World));
    assert_eq!(h.echoed(), vec![1]);
    assert_eq!(h.metrics.snapshot().permission_denials, 0);
}

#[test]
fn test_time_sync_schedule_and_response() {
    let mut h = Harness::new();
    h.session.enter_world();
    assert_eq!(h.time_sync_requests(), vec![0]);

    assert_eq!(h.session.clock().samples().count(), 0);

    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&1_000u32.to_le_bytes());
    let response = ClientPacket::new(
        ClientOpcode::TIME_SYNC_RESP,
        payload,
        crate::utils::time::ms_now(),
    );
    h.session.link().enqueue(response).unwrap();

    h.session.update(0, PacketFilter::World);
    assert_eq!(h.session.clock().samples().count(), 1);
    assert!(h.session.clock().delta().is_some());

    // the first follow-up probe is due 5 s after counter 0
    h.session.update(4_000, PacketFilter::Map);
    assert!(h.time_sync_requests().is_empty());
    h.session.update(1_000, PacketFilter::Map);
    assert_eq!(h.time_sync_requests(), vec![1]);

    // world passes never send probes
    h.session.update(60_000, PacketFilter::World);
    assert!(h.time_sync_requests().is_empty());
}

#[test]
fn test_client_time_falls_back_without_delta() {
    let h = Harness::new();
    let before = crate::utils::time::ms_now();
    let translated = h.session.client_time_to_server(123);
    assert!(translated >= before);
    assert_eq!(h.metrics.snapshot().clock_sync_fallbacks, 1);
}

/// Probe sent at `sent`, one-way delays `up`/`down`, client clock offset
/// `server - client = offset`.
fn probe(sync: &mut ClockSync, sent: u32, up: u32, down: u32, offset: i64) {
    let counter = sync.begin_request(sent);
    let client_time = (i64::from(sent + up) - offset) as u32;
    assert!(sync
        .handle_response(counter, client_time, sent + up + down)
        .is_some());
}

#[test]
fn test_delayed_sample_excluded_from_mean() {
    let offset = 2_000;
    let mut sync = ClockSync::new(6, 0);
    let jitter = [48, 50, 52];
    let mut sent = 10_000;

    for i in 0..50 {
        if i == 25 {
            // 3x the median round trip, all of it on the way back
            probe(&mut sync, sent, 50, 250, offset);
            assert!(sync.samples().any(|s| s.round_trip == 300));
        } else {
            let half = jitter[i % jitter.len()];
            probe(&mut sync, sent, half, half, offset);
        }
        // a kept delayed sample would drag the mean up by 16 ms
        assert_eq!(sync.delta(), Some(offset), "round trip {i}");
        sent += 10_000;
    }
}

#[test]
fn test_clock_sync_converges_with_outliers() {
    let offset: i64 = -12_345;
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut sync = ClockSync::new(6, 25);
    let mut sent: u32 = 100_000;
    let mut first = None;

    for i in 0..300 {
        let up = rng.random_range(40..=60);
        let mut down = rng.random_range(40..=60);
        if i % 17 == 16 {
            // retransmit
            down += rng.random_range(400..=800);
        }
        probe(&mut sync, sent, up, down, offset);

        let delta = sync.delta().unwrap();
        assert!((delta - offset).abs() <= 10, "round trip {i}: delta {delta}");
        // converged on the first sample and never moves again
        assert_eq!(*first.get_or_insert(delta), delta);
        sent += 10_000;
    }
}
