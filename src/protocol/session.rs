//! # Session
//!
//! Post-handshake state of one client.
//!
//! The network task and the world loop share a [`SessionLink`]: the network
//! task pushes decoded packets into its inbound queue and drains its outbound
//! channel into the socket, the world loop owns the [`Session`] and pops the
//! queue once per tick and per pass.
//!
//! ## Passes
//! Each tick runs a world pass then a map pass over every session:
//!
//! | affinity      | world pass                             | map pass                 |
//! |---------------|----------------------------------------|--------------------------|
//! | `InPlace`     | process                                | process                  |
//! | `WorldThread` | process                                | stop                     |
//! | `MapThread`   | in world: stop; otherwise set aside    | in world: process, else stop |
//! | unregistered  | process (logged and dropped)           | process (logged and dropped) |
//!
//! Packets set aside by the world pass go back to the front of the queue
//! when the pass ends, in their original order.
//!
//! ## Handler gates
//! Before a handler runs, its packet is counted against the handler's
//! per-second limit (see [`FloodPolicy`]) and the account's security level
//! is checked against the handler's minimum. A refused packet is dropped and
//! the client gets an `SMSG_NOTIFICATION`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace, warn};

use crate::config::{FloodPolicy, SessionConfig};
use crate::core::opcodes::ServerOpcode;
use crate::core::packet::{ClientPacket, ServerPacket};
use crate::error::{ProtocolError, Result};
use crate::protocol::addon::AddonList;
use crate::protocol::clock_sync::ClockSync;
use crate::protocol::dispatcher::{Affinity, Dispatcher, HandlerEntry};
use crate::service::accounts::AccountInfo;
use crate::utils::metrics::Metrics;
use crate::utils::time::{ms_diff, ms_now};

/// Work for the network task's writer side.
#[derive(Debug)]
pub enum Outbound {
    Packet(ServerPacket),
    /// Flush what is queued and close the socket
    Close,
}

/// State shared by the network task and the world loop.
#[derive(Debug)]
pub struct SessionLink {
    peer: SocketAddr,
    account_id: u32,
    security: u8,
    inbound: Mutex<VecDeque<ClientPacket>>,
    inbound_limit: usize,
    outbound: mpsc::Sender<Outbound>,
    outbound_limit: usize,
    open: AtomicBool,
    latency: AtomicU32,
    last_activity: AtomicU32,
}

impl SessionLink {
    pub fn new(
        peer: SocketAddr,
        account_id: u32,
        security: u8,
        inbound_limit: usize,
        outbound_limit: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(outbound_limit.max(1));
        let link = Arc::new(Self {
            peer,
            account_id,
            security,
            inbound: Mutex::new(VecDeque::new()),
            inbound_limit,
            outbound: tx,
            outbound_limit,
            open: AtomicBool::new(true),
            latency: AtomicU32::new(0),
            last_activity: AtomicU32::new(ms_now()),
        });
        (link, rx)
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<ClientPacket>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn account_id(&self) -> u32 {
        self.account_id
    }

    pub fn security(&self) -> u8 {
        self.security
    }

    /// Append a packet for the world loop. Never blocks.
    pub fn enqueue(&self, packet: ClientPacket) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut queue = self.queue();
        if queue.len() >= self.inbound_limit {
            return Err(ProtocolError::QueueFull {
                limit: self.inbound_limit,
            });
        }
        queue.push_back(packet);
        Ok(())
    }

    pub fn pop_front(&self) -> Option<ClientPacket> {
        self.queue().pop_front()
    }

    pub fn push_front(&self, packet: ClientPacket) {
        self.queue().push_front(packet);
    }

    /// Put `packets` back at the head of the queue, keeping their order.
    pub fn requeue_front(&self, packets: Vec<ClientPacket>) {
        if packets.is_empty() {
            return;
        }
        let mut queue = self.queue();
        for packet in packets.into_iter().rev() {
            queue.push_front(packet);
        }
    }

    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Hand a packet to the network task.
    ///
    /// A full outbound channel means the client stopped reading; the link is
    /// closed rather than letting the world loop wait on it.
    pub fn send(&self, packet: ServerPacket) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        match self.outbound.try_send(Outbound::Packet(packet)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(peer = %self.peer, account_id = self.account_id, "Outbound queue full, closing");
                self.close();
                Err(ProtocolError::QueueFull {
                    limit: self.outbound_limit,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::Release);
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Mark the link closed and ask the network task to hang up.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // a full channel still gets noticed: the network task checks is_open
            let _ = self.outbound.try_send(Outbound::Close);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn touch(&self, now: u32) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self, now: u32) -> u32 {
        ms_diff(self.last_activity.load(Ordering::Relaxed), now)
    }

    pub fn latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    pub fn set_latency(&self, latency: u32) {
        self.latency.store(latency, Ordering::Relaxed);
    }
}

/// Which pass of the world tick is draining the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFilter {
    World,
    Map,
}

/// What a pass does with the packet at the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Process,
    /// Set aside; re-added to the queue front after the pass
    Defer,
    /// Put back and end the pass
    Halt,
}

impl PacketFilter {
    /// `affinity` is `None` for opcodes without a registered handler.
    pub fn decide(self, affinity: Option<Affinity>, in_world: bool) -> FilterDecision {
        match (self, affinity) {
            (_, None) | (_, Some(Affinity::InPlace)) => FilterDecision::Process,
            (PacketFilter::World, Some(Affinity::WorldThread)) => FilterDecision::Process,
            (PacketFilter::World, Some(Affinity::MapThread)) if in_world => FilterDecision::Halt,
            (PacketFilter::World, Some(Affinity::MapThread)) => FilterDecision::Defer,
            (PacketFilter::Map, Some(Affinity::WorldThread)) => FilterDecision::Halt,
            (PacketFilter::Map, Some(Affinity::MapThread)) if in_world => FilterDecision::Process,
            (PacketFilter::Map, Some(Affinity::MapThread)) => FilterDecision::Halt,
        }
    }
}

/// Shown to clients invoking a handler above their security level.
const PERMISSION_DENIED: &str = "You do not have permission to use this command.";

/// Packets of one opcode seen within one wall-clock second.
#[derive(Debug, Clone, Copy, Default)]
struct PacketCounter {
    second: u32,
    count: u32,
}

/// An authenticated client, owned by the world loop.
pub struct Session {
    account: AccountInfo,
    expansion: u8,
    addons: AddonList,
    link: Arc<SessionLink>,
    dispatcher: Arc<Dispatcher>,
    clock: ClockSync,
    in_world: bool,
    max_packets_per_update: usize,
    flood_policy: FloodPolicy,
    flood_counters: HashMap<u16, PacketCounter>,
    metrics: Arc<Metrics>,
}

impl Session {
    pub fn new(
        account: AccountInfo,
        expansion: u8,
        addons: AddonList,
        link: Arc<SessionLink>,
        dispatcher: Arc<Dispatcher>,
        config: &SessionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            account,
            expansion,
            addons,
            link,
            dispatcher,
            clock: ClockSync::from_config(config),
            in_world: false,
            max_packets_per_update: config.max_packets_per_update,
            flood_policy: config.flood_policy,
            flood_counters: HashMap::new(),
            metrics,
        }
    }

    pub fn account(&self) -> &AccountInfo {
        &self.account
    }

    pub fn account_id(&self) -> u32 {
        self.account.id
    }

    pub fn security(&self) -> u8 {
        self.account.security
    }

    /// Expansion granted to this session, already clamped to the realm.
    pub fn expansion(&self) -> u8 {
        self.expansion
    }

    pub fn addons(&self) -> &AddonList {
        &self.addons
    }

    pub fn link(&self) -> &Arc<SessionLink> {
        &self.link
    }

    pub fn latency(&self) -> u32 {
        self.link.latency()
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn is_in_world(&self) -> bool {
        self.in_world
    }

    /// Queue a packet for the client. Failures close the link and are only
    /// logged; the world loop reaps the session on its next pass.
    pub fn send(&self, packet: ServerPacket) {
        let opcode = packet.opcode;
        if let Err(e) = self.link.send(packet) {
            debug!(account_id = self.account.id, %opcode, error = %e, "Dropping outbound packet");
        }
    }

    pub fn kick(&self) {
        if self.link.is_open() {
            debug!(account_id = self.account.id, peer = %self.link.peer(), "Kicking session");
        }
        self.link.close();
    }

    /// The player entered a map: restart time sync from counter 0.
    pub fn enter_world(&mut self) {
        self.in_world = true;
        self.clock.reset();
        self.send_time_sync();
    }

    pub fn leave_world(&mut self) {
        self.in_world = false;
    }

    /// Send `SMSG_TIME_SYNC_REQ` with the next counter.
    pub fn send_time_sync(&mut self) {
        let counter = self.clock.begin_request(ms_now());
        let mut packet = ServerPacket::with_capacity(ServerOpcode::TIME_SYNC_REQ, 4);
        packet.put_u32(counter);
        trace!(account_id = self.account.id, counter, "Time sync request");
        self.send(packet);
    }

    pub fn handle_time_sync_response(&mut self, counter: u32, client_time: u32, received_ms: u32) {
        match self.clock.handle_response(counter, client_time, received_ms) {
            Some(sample) => trace!(
                account_id = self.account.id,
                counter,
                delta = sample.delta,
                round_trip = sample.round_trip,
                "Time sync sample"
            ),
            None => debug!(account_id = self.account.id, counter, "Time sync response for unknown counter"),
        }
    }

    /// Map a client timestamp onto the server clock, falling back to the
    /// current server time when no sane translation exists.
    pub fn client_time_to_server(&self, client_time: u32) -> u32 {
        match self.clock.to_server_time(client_time) {
            Ok(server_time) => server_time,
            Err(e) => {
                debug!(account_id = self.account.id, error = %e, "Clock sync fallback");
                self.metrics.clock_sync_fallback();
                ms_now()
            }
        }
    }

    /// Drain the inbound queue for one pass.
    ///
    /// Returns false once the session is closed and should be dropped.
    pub fn update(&mut self, diff: u32, filter: PacketFilter) -> bool {
        let mut processed = 0;
        let mut deferred = Vec::new();

        while self.link.is_open() && processed < self.max_packets_per_update {
            let Some(mut packet) = self.link.pop_front() else {
                break;
            };
            let entry = self.dispatcher.lookup(packet.opcode);

            match filter.decide(entry.map(|e| e.affinity), self.in_world) {
                FilterDecision::Process => match entry {
                    Some(entry) => {
                        if self.within_rate_limit(&entry, &packet) && self.permitted(&entry) {
                            self.run_handler(entry, &mut packet);
                        }
                    }
                    None => debug!(
                        account_id = self.account.id,
                        opcode = %packet.opcode,
                        "Unhandled opcode"
                    ),
                },
                FilterDecision::Defer => deferred.push(packet),
                FilterDecision::Halt => {
                    self.link.push_front(packet);
                    break;
                }
            }
            processed += 1;
        }

        self.link.requeue_front(deferred);

        if filter == PacketFilter::Map
            && self.in_world
            && self.link.is_open()
            && self.clock.tick(diff)
        {
            self.send_time_sync();
        }

        self.link.is_open()
    }

    /// Count `packet` against its handler's per-second limit. False means the
    /// packet is dropped.
    fn within_rate_limit(&mut self, entry: &HandlerEntry, packet: &ClientPacket) -> bool {
        if entry.max_per_second == 0 {
            return true;
        }

        let second = packet.received_ms / 1000;
        let counter = self.flood_counters.entry(packet.opcode.0).or_default();
        if counter.second != second {
            *counter = PacketCounter { second, count: 0 };
        }
        counter.count = counter.count.saturating_add(1);
        let count = counter.count;
        if count <= entry.max_per_second {
            return true;
        }

        self.metrics.packet_throttled();
        warn!(
            account_id = self.account.id,
            peer = %self.link.peer(),
            latency = self.link.latency(),
            opcode = %packet.opcode,
            count,
            policy = ?self.flood_policy,
            "Packet flood"
        );
        match self.flood_policy {
            FloodPolicy::Log => true,
            FloodPolicy::Kick => {
                self.kick();
                false
            }
        }
    }

    fn permitted(&self, entry: &HandlerEntry) -> bool {
        if self.account.security >= entry.min_security {
            return true;
        }

        debug!(
            account_id = self.account.id,
            handler = entry.name,
            security = self.account.security,
            required = entry.min_security,
            "Permission denied"
        );
        self.metrics.permission_denied();
        let mut notice = ServerPacket::new(ServerOpcode::NOTIFICATION);
        notice.put_cstring(PERMISSION_DENIED);
        self.send(notice);
        false
    }

    fn run_handler(&mut self, entry: HandlerEntry, packet: &mut ClientPacket) {
        trace!(account_id = self.account.id, opcode = %packet.opcode, handler = entry.name, "C->S");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(self, packet)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(ProtocolError::MalformedPayload { opcode })) => {
                warn!(
                    account_id = self.account.id,
                    opcode = format_args!("{opcode:#06x}"),
                    "Malformed packet, closing session"
                );
                self.metrics.protocol_error();
                self.kick();
            }
            Ok(Err(e)) if e.is_fatal() => {
                warn!(account_id = self.account.id, handler = entry.name, error = %e, "Handler failed");
                self.metrics.handler_failure();
            }
            Ok(Err(e)) => {
                debug!(account_id = self.account.id, handler = entry.name, error = %e, "Handler recovered");
            }
            Err(_) => {
                error!(account_id = self.account.id, handler = entry.name, "Handler panicked");
                self.metrics.handler_failure();
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account_id", &self.account.id)
            .field("peer", &self.link.peer())
            .field("in_world", &self.in_world)
            .field("queued", &self.link.queued())
            .finish_non_exhaustive()
    }
}

/// `CMSG_TIME_SYNC_RESP {u32 counter, u32 client_ticks}`.
pub fn handle_time_sync_resp(session: &mut Session, packet: &mut ClientPacket) -> Result<()> {
    let mut reader = packet.reader();
    let counter = reader.read_u32()?;
    let client_time = reader.read_u32()?;
    session.handle_time_sync_response(counter, client_time, packet.received_ms);
    Ok(())
}
