//! # Connection
//!
//! Per-socket task: banned-address pre-check, auth challenge, account
//! verification, then the packet pump between the socket and the session's
//! [`SessionLink`].
//!
//! ## Flow
//! ```text
//! accept -> lookup_ip -> SMSG_AUTH_CHALLENGE -> CMSG_AUTH_SESSION
//!        -> lookup_account -> checks -> SMSG_AUTH_RESPONSE
//!        -> Session handed to the world -> pump until close
//! ```
//!
//! Rejections are answered in clear and close the socket. The header cipher
//! starts right before `AUTH_OK`, so the success response is the first
//! encrypted packet.
//!
//! Pings and keep-alives are answered on this task; everything else goes to
//! the world loop through the session's inbound queue.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{NetworkConfig, SessionConfig};
use crate::core::codec::WorldCodec;
use crate::core::opcodes::{ClientOpcode, ServerOpcode};
use crate::core::packet::{ClientPacket, ServerPacket};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::addon::AddonList;
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{
    auth_error_packet, auth_ok_packet, verify_account, AuthContext, AuthResponseCode,
    AuthSessionPacket, HandshakeState, ServerHandshake,
};
use crate::protocol::session::{Outbound, Session, SessionLink};
use crate::service::accounts::{AccountInfo, AccountStore, AuthAudit, IpInfo};
use crate::service::realm::{Realm, SEC_PLAYER};
use crate::service::world::WorldHandle;
use crate::utils::metrics::Metrics;
use crate::utils::time::ms_diff;

type WorldFramed<T> = Framed<T, WorldCodec>;

/// Services a connection task needs.
pub struct ConnectionContext<S> {
    pub store: Arc<S>,
    pub realm: Arc<Realm>,
    pub dispatcher: Arc<Dispatcher>,
    pub world: WorldHandle,
    pub config: Arc<NetworkConfig>,
    pub metrics: Arc<Metrics>,
}

impl<S> Clone for ConnectionContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            realm: Arc::clone(&self.realm),
            dispatcher: Arc::clone(&self.dispatcher),
            world: self.world.clone(),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Ping cadence tracking.
///
/// Pings closer together than the configured floor are overspeed; more than
/// `max_overspeed` of them in a row disconnect player-level accounts. A ping
/// at normal cadence clears the count.
#[derive(Debug, Clone)]
pub struct PingGuard {
    last_ping: Option<u32>,
    overspeed: u32,
    min_interval_ms: u32,
    max_overspeed: u32,
}

impl PingGuard {
    pub fn new(min_interval_ms: u32, max_overspeed: u32) -> Self {
        Self {
            last_ping: None,
            overspeed: 0,
            min_interval_ms,
            max_overspeed,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            u32::try_from(config.ping_min_interval.as_millis()).unwrap_or(u32::MAX),
            config.max_overspeed_pings,
        )
    }

    /// Record a ping received at `now`.
    pub fn check(&mut self, now: u32, security: u8) -> Result<()> {
        let Some(last) = self.last_ping.replace(now) else {
            return Ok(());
        };

        if ms_diff(last, now) >= self.min_interval_ms {
            self.overspeed = 0;
            return Ok(());
        }

        self.overspeed += 1;
        if self.max_overspeed > 0 && self.overspeed > self.max_overspeed {
            if security == SEC_PLAYER {
                return Err(ProtocolError::OverspeedPing {
                    count: self.overspeed,
                });
            }
            debug!(security, count = self.overspeed, "Overspeed pings from privileged account");
        }
        Ok(())
    }

    pub fn overspeed_count(&self) -> u32 {
        self.overspeed
    }
}

struct Authenticated {
    account: AccountInfo,
    expansion: u8,
    addons: AddonList,
}

/// Serve one client until it disconnects, is rejected or the server stops.
///
/// Generic over the stream so tests can drive it through in-memory pipes.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn handle_connection<T, S>(
    stream: T,
    peer: SocketAddr,
    ctx: ConnectionContext<S>,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AccountStore,
{
    ctx.metrics.connection_established();
    let result = serve(stream, peer, &ctx, shutdown).await;
    ctx.metrics.connection_closed();

    if let Err(e) = &result {
        if matches!(
            e,
            ProtocolError::MalformedHeader { .. } | ProtocolError::MalformedPayload { .. }
        ) {
            ctx.metrics.protocol_error();
        }
    }
    result
}

async fn serve<T, S>(
    stream: T,
    peer: SocketAddr,
    ctx: &ConnectionContext<S>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AccountStore,
{
    let mut framed = Framed::new(
        stream,
        WorldCodec::new(&ctx.config.transport, Arc::clone(&ctx.metrics)),
    );

    let ip_info = ctx.store.lookup_ip(peer.ip()).await?;
    if ip_info.banned {
        info!("Connection from banned address refused");
        ctx.store
            .record_auth_failure(AuthAudit {
                account_id: None,
                ip: peer.ip(),
                code: AuthResponseCode::Reject,
            })
            .await?;
        framed.send(auth_error_packet(AuthResponseCode::Reject)).await?;
        return Err(ProtocolError::AuthRejected(AuthResponseCode::Reject));
    }

    let mut handshake = ServerHandshake::new()?;
    framed.send(handshake.challenge_packet()).await?;

    let auth_timeout = ctx.config.server.auth_timeout;
    let authenticated = tokio::time::timeout(
        auth_timeout,
        authenticate(&mut framed, &mut handshake, peer, &ip_info, ctx),
    )
    .await
    .map_err(|_| {
        debug!(timeout_ms = auth_timeout.as_millis() as u64, "{}", constants::ERR_AUTH_TIMEOUT);
        ProtocolError::Timeout
    })??;
    drop(handshake);

    let Authenticated {
        account,
        expansion,
        addons,
    } = authenticated;
    let account_id = account.id;

    let session_config = &ctx.config.session;
    let (link, mut outbound) = SessionLink::new(
        peer,
        account.id,
        account.security,
        session_config.inbound_queue_limit,
        session_config.outbound_queue_limit,
    );
    let session = Session::new(
        account,
        expansion,
        addons,
        Arc::clone(&link),
        Arc::clone(&ctx.dispatcher),
        session_config,
        Arc::clone(&ctx.metrics),
    );
    ctx.world.add_session(session).await?;

    let mut ping_guard = PingGuard::from_config(session_config);
    let result = pump(
        &mut framed,
        &link,
        &mut outbound,
        &mut ping_guard,
        &mut shutdown,
        ctx,
    )
    .await;
    link.close();

    debug!(account_id, "Session connection closed");
    result
}

/// Read the auth packet and run the checks. Exactly one terminal handshake
/// transition happens on every path that reaches the account lookup.
async fn authenticate<T, S>(
    framed: &mut WorldFramed<T>,
    handshake: &mut ServerHandshake,
    peer: SocketAddr,
    ip_info: &IpInfo,
    ctx: &ConnectionContext<S>,
) -> Result<Authenticated>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AccountStore,
{
    let packet = framed
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed)??;
    handshake.advance(HandshakeState::AwaitingAuthPacket)?;

    if packet.opcode != ClientOpcode::AUTH_SESSION {
        handshake.advance(HandshakeState::Rejected)?;
        warn!(opcode = %packet.opcode, "{}", constants::ERR_NOT_AUTHENTICATED);
        return Err(ProtocolError::UnexpectedOpcode(u32::from(packet.opcode.0)));
    }

    ctx.metrics.handshake_attempt();
    let request = AuthSessionPacket::parse(&packet)?;
    handshake.advance(HandshakeState::AwaitingAccountLookup)?;
    debug!(account = %request.account, build = request.build, "Auth session received");

    let account = ctx
        .store
        .lookup_account(ctx.realm.id(), &request.account)
        .await?;

    let recorded_ip = if ctx.realm.log_ip_addresses() {
        peer.ip()
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    if let Some(account) = &account {
        ctx.store.record_attempt_ip(account.id, recorded_ip).await?;
    }

    let auth_ctx = AuthContext {
        realm: &ctx.realm,
        peer_ip: peer.ip(),
        recorded_ip,
        ip_info,
        server_seed: handshake.server_seed(),
    };

    let account = match verify_account(&request, account.as_ref(), &auth_ctx).cloned() {
        Ok(account) => account,
        Err(code) => {
            handshake.advance(HandshakeState::Rejected)?;
            ctx.metrics.handshake_failed();
            ctx.store
                .record_auth_failure(AuthAudit {
                    account_id: account.as_ref().map(|a| a.id),
                    ip: peer.ip(),
                    code,
                })
                .await?;
            framed.send(auth_error_packet(code)).await?;
            return Err(ProtocolError::AuthRejected(code));
        }
    };

    handshake.advance(HandshakeState::Authenticated)?;
    framed.codec_mut().init_crypt(&account.session_key)?;

    let expansion = account.expansion.min(ctx.realm.expansion());
    framed.send(auth_ok_packet(expansion)).await?;
    ctx.metrics.handshake_success();
    ctx.store.record_login_ip(account.id, recorded_ip).await?;

    let addons = AddonList::parse(&request.addon_data).unwrap_or_else(|e| {
        debug!(error = %e, "Ignoring malformed addon data");
        AddonList::default()
    });

    if ctx.realm.anticheat_enabled() {
        debug!(account_id = account.id, os = %account.os, "Anti-cheat session initialized");
    }

    info!(
        account_id = account.id,
        account = %account.name,
        expansion,
        addons = addons.addons.len(),
        "Account authenticated"
    );

    Ok(Authenticated {
        account,
        expansion,
        addons,
    })
}

async fn flush<T>(framed: &mut WorldFramed<T>) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    SinkExt::<ServerPacket>::flush(framed).await
}

/// Move packets between the socket and the session link until either side
/// closes.
async fn pump<T, S>(
    framed: &mut WorldFramed<T>,
    link: &SessionLink,
    outbound: &mut mpsc::Receiver<Outbound>,
    ping_guard: &mut PingGuard,
    shutdown: &mut watch::Receiver<bool>,
    ctx: &ConnectionContext<S>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AccountStore,
{
    loop {
        if !link.is_open() {
            flush(framed).await?;
            return Ok(());
        }

        tokio::select! {
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(packet)) => handle_inbound(framed, link, ping_guard, packet, ctx).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(Outbound::Packet(packet)) => {
                        framed.feed(packet).await?;
                        loop {
                            match outbound.try_recv() {
                                Ok(Outbound::Packet(packet)) => framed.feed(packet).await?,
                                Ok(Outbound::Close) => {
                                    flush(framed).await?;
                                    return Ok(());
                                }
                                Err(_) => break,
                            }
                        }
                        flush(framed).await?;
                    }
                    Some(Outbound::Close) | None => {
                        flush(framed).await?;
                        return Ok(());
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Server shutting down, closing connection");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_inbound<T, S>(
    framed: &mut WorldFramed<T>,
    link: &SessionLink,
    ping_guard: &mut PingGuard,
    packet: ClientPacket,
    ctx: &ConnectionContext<S>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AccountStore,
{
    match packet.opcode {
        ClientOpcode::PING => {
            let mut reader = packet.reader();
            let counter = reader.read_u32()?;
            let latency = reader.read_u32()?;

            if let Err(e) = ping_guard.check(packet.received_ms, link.security()) {
                warn!(account_id = link.account_id(), error = %e, "Kicking for overspeed pings");
                ctx.metrics.overspeed_kick();
                return Err(e);
            }
            link.set_latency(latency);

            let mut pong = ServerPacket::with_capacity(ServerOpcode::PONG, 4);
            pong.put_u32(counter);
            framed.send(pong).await?;
            trace!(counter, latency, "Ping answered");
        }
        ClientOpcode::KEEP_ALIVE => link.touch(packet.received_ms),
        ClientOpcode::AUTH_SESSION => {
            warn!(account_id = link.account_id(), "{}", constants::ERR_DUPLICATE_AUTH);
            return Err(ProtocolError::UnexpectedOpcode(u32::from(packet.opcode.0)));
        }
        opcode => {
            if opcode != ClientOpcode::WARDEN_DATA {
                link.touch(packet.received_ms);
            }
            if let Err(e) = link.enqueue(packet) {
                warn!(account_id = link.account_id(), %opcode, error = %e, "Inbound queue rejected packet");
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_ping_is_free() {
        let mut guard = PingGuard::new(27_000, 2);
        assert!(guard.check(100, SEC_PLAYER).is_ok());
        assert_eq!(guard.overspeed_count(), 0);
    }

    #[test]
    fn test_overspeed_kicks_players() {
        let mut guard = PingGuard::new(27_000, 2);
        guard.check(0, SEC_PLAYER).unwrap();
        guard.check(1_000, SEC_PLAYER).unwrap();
        guard.check(2_000, SEC_PLAYER).unwrap();
        assert!(matches!(
            guard.check(3_000, SEC_PLAYER),
            Err(ProtocolError::OverspeedPing { count: 3 })
        ));
    }

    #[test]
    fn test_overspeed_tolerated_for_staff() {
        let mut guard = PingGuard::new(27_000, 2);
        for i in 0..10 {
            assert!(guard.check(i * 100, 3).is_ok());
        }
        assert_eq!(guard.overspeed_count(), 9);
    }

    #[test]
    fn test_normal_cadence_resets() {
        let mut guard = PingGuard::new(27_000, 2);
        guard.check(0, SEC_PLAYER).unwrap();
        guard.check(1_000, SEC_PLAYER).unwrap();
        guard.check(2_000, SEC_PLAYER).unwrap();
        guard.check(30_000, SEC_PLAYER).unwrap();
        assert_eq!(guard.overspeed_count(), 0);
        guard.check(31_000, SEC_PLAYER).unwrap();
        assert_eq!(guard.overspeed_count(), 1);
    }

    #[test]
    fn test_zero_limit_disables_kicks() {
        let mut guard = PingGuard::new(27_000, 0);
        for i in 0..20 {
            assert!(guard.check(i, SEC_PLAYER).is_ok());
        }
    }
}
