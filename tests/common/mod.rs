//! Shared helpers for the socket-level tests: a server on an ephemeral port
//! and a minimal client that speaks the login sequence.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use realm_wire::config::NetworkConfig;
use realm_wire::core::codec::ClientCodec;
use realm_wire::core::opcodes::{ClientOpcode, ServerOpcode};
use realm_wire::core::packet::{ClientPacket, ServerPacket};
use realm_wire::error::Result;
use realm_wire::protocol::dispatcher::{Affinity, Dispatcher, HandlerEntry};
use realm_wire::protocol::handshake::{parse_challenge, AuthSessionPacket};
use realm_wire::protocol::session::Session;
use realm_wire::service::accounts::{AccountInfo, MemoryAccountStore};
use realm_wire::service::realm::Realm;
use realm_wire::transport::Server;
use realm_wire::utils::crypto::{SessionKey, SESSION_KEY_LEN};
use realm_wire::utils::metrics::Metrics;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// Echoed back as [`ECHO_REPLY`] by the test dispatcher.
pub const ECHO: ClientOpcode = ClientOpcode(0x0100);
pub const ECHO_REPLY: ServerOpcode = ServerOpcode(0x0101);

/// Answered with an `SMSG_UPDATE_OBJECT` as large as the requested size.
pub const BIG_UPDATE: ClientOpcode = ClientOpcode(0x0102);

/// Echo handler limited to [`FLOOD_LIMIT`] packets per second.
pub const THROTTLED_ECHO: ClientOpcode = ClientOpcode(0x0103);
pub const FLOOD_LIMIT: u32 = 3;

/// Upper bound for any single await in these tests.
pub const STEP: Duration = Duration::from_secs(5);

pub type Client = Framed<TcpStream, ClientCodec>;

fn echo(session: &mut Session, packet: &mut ClientPacket) -> Result<()> {
    let mut reply = ServerPacket::new(ECHO_REPLY);
    reply.put_bytes(&packet.payload);
    session.send(reply);
    Ok(())
}

fn big_update(session: &mut Session, packet: &mut ClientPacket) -> Result<()> {
    let len = packet.reader().read_u32()? as usize;
    let mut update = ServerPacket::with_capacity(ServerOpcode::UPDATE_OBJECT, len);
    for i in 0..len {
        update.put_u8((i % 7) as u8);
    }
    session.send(update);
    Ok(())
}

pub fn dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::with_defaults();
    dispatcher
        .register(ECHO, "CMSG_TEST_ECHO", Affinity::InPlace, echo)
        .unwrap();
    dispatcher
        .register(BIG_UPDATE, "CMSG_TEST_BIG_UPDATE", Affinity::WorldThread, big_update)
        .unwrap();
    dispatcher
        .register_entry(
            THROTTLED_ECHO,
            HandlerEntry::new("CMSG_TEST_THROTTLED_ECHO", Affinity::InPlace, echo)
                .with_rate_limit(FLOOD_LIMIT),
        )
        .unwrap();
    dispatcher
}

pub fn test_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".to_string();
        c.server.shutdown_timeout = Duration::from_secs(2);
        c.server.world_update_interval = Duration::from_millis(10);
    })
}

pub fn key_for(id: u32) -> SessionKey {
    let mut raw = [0u8; SESSION_KEY_LEN];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = (id as u8).wrapping_mul(31).wrapping_add(i as u8);
    }
    SessionKey::new(raw)
}

pub fn account(id: u32) -> AccountInfo {
    AccountInfo::new(id, format!("PLAYER{id}"), key_for(id))
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryAccountStore>,
    pub realm: Arc<Realm>,
    pub metrics: Arc<Metrics>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl TestServer {
    pub async fn start(config: NetworkConfig) -> Self {
        let store = Arc::new(MemoryAccountStore::new());
        Self::start_with_store(config, store).await
    }

    pub async fn start_with_store(config: NetworkConfig, store: Arc<MemoryAccountStore>) -> Self {
        let server = Server::bind(config, Arc::clone(&store), dispatcher())
            .await
            .expect("bind test server");
        let addr = server.local_addr().unwrap();
        let realm = server.realm();
        let metrics = server.metrics();

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        Self {
            addr,
            store,
            realm,
            metrics,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    /// Signal shutdown and wait for the server to return.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.take() {
            Some(task) => tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("server did not stop in time")
                .expect("server task panicked"),
            None => Ok(()),
        }
    }

    pub async fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        Framed::new(stream, ClientCodec::new())
    }

    /// Connect and read the challenge seed.
    pub async fn connect_challenged(&self) -> (Client, [u8; 4]) {
        let mut client = self.connect().await;
        let challenge = next(&mut client).await.expect("challenge");
        assert_eq!(challenge.opcode, ServerOpcode::AUTH_CHALLENGE);
        let seed = parse_challenge(&challenge.payload).unwrap();
        (client, seed)
    }

    /// Full login for `account`, returning the encrypted client and the
    /// `AUTH_RESPONSE` payload.
    pub async fn login(&self, account: &AccountInfo) -> (Client, ServerPacket) {
        let (mut client, seed) = self.connect_challenged().await;
        let request = AuthSessionPacket::signed(
            &account.name,
            self.realm.id(),
            &seed,
            [1, 2, 3, 4],
            &account.session_key,
        );
        client.send(request.to_packet()).await.unwrap();
        client.codec_mut().init_crypt(&account.session_key).unwrap();

        let response = next(&mut client).await.expect("auth response");
        (client, response)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Next packet, or `None` once the server closed the socket.
pub async fn next(client: &mut Client) -> Option<ServerPacket> {
    match tokio::time::timeout(STEP, client.next()).await {
        Ok(Some(Ok(packet))) => Some(packet),
        Ok(Some(Err(_)) | None) => None,
        Err(_) => panic!("no packet within {STEP:?}"),
    }
}

/// Skip time-sync probes and other unsolicited traffic until `opcode` shows up.
pub async fn next_of(client: &mut Client, opcode: ServerOpcode) -> Option<ServerPacket> {
    loop {
        let packet = next(client).await?;
        if packet.opcode == opcode {
            return Some(packet);
        }
    }
}

/// Wait for the server to close the connection, ignoring anything still
/// in flight.
pub async fn expect_closed(client: &mut Client) {
    while next(client).await.is_some() {}
}

pub fn ping(counter: u32, latency: u32) -> ClientPacket {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&counter.to_le_bytes());
    payload.extend_from_slice(&latency.to_le_bytes());
    ClientPacket::new(ClientOpcode::PING, payload, 0)
}

pub fn echo_packet(tag: &[u8]) -> ClientPacket {
    ClientPacket::new(ECHO, tag.to_vec(), 0)
}

/// Poll `check` until it holds; counters are bumped after sockets close.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 5s");
}
