//! The single world loop that owns every authenticated session.
//!
//! Connection tasks hand finished sessions over through a [`WorldHandle`];
//! the loop then drains their queues once per tick, world pass first and map
//! pass second, and reaps sessions whose link closed or went idle.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

use crate::config::SessionConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::session::{PacketFilter, Session};
use crate::utils::time::{ms_diff, ms_now};

/// Sender side used by connection tasks.
#[derive(Debug, Clone)]
pub struct WorldHandle {
    tx: mpsc::Sender<Session>,
}

impl WorldHandle {
    pub async fn add_session(&self, session: Session) -> Result<()> {
        self.tx
            .send(session)
            .await
            .map_err(|_| ProtocolError::HandlerError(constants::ERR_WORLD_STOPPED.into()))
    }
}

#[derive(Debug)]
pub struct World {
    sessions: HashMap<u32, Session>,
    incoming: mpsc::Receiver<Session>,
    idle_timeout_ms: u32,
}

impl World {
    /// `backlog` bounds how many sessions may wait for the next tick.
    pub fn new(config: &SessionConfig, backlog: usize) -> (Self, WorldHandle) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let world = Self {
            sessions: HashMap::new(),
            incoming: rx,
            idle_timeout_ms: u32::try_from(config.idle_timeout.as_millis()).unwrap_or(u32::MAX),
        };
        (world, WorldHandle { tx })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, account_id: u32) -> Option<&Session> {
        self.sessions.get(&account_id)
    }

    pub fn session_mut(&mut self, account_id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&account_id)
    }

    /// Register a session directly, kicking any older one for the account.
    pub fn add_session(&mut self, session: Session) {
        let account_id = session.account_id();
        if let Some(previous) = self.sessions.insert(account_id, session) {
            info!(account_id, peer = %previous.link().peer(), "Duplicate login, kicking older session");
            previous.kick();
        }
    }

    fn accept_sessions(&mut self) {
        while let Ok(session) = self.incoming.try_recv() {
            debug!(account_id = session.account_id(), "Session joined world");
            self.add_session(session);
        }
    }

    /// One world tick; `diff` is the time since the previous tick in ms.
    pub fn update(&mut self, diff: u32) {
        self.accept_sessions();

        for session in self.sessions.values_mut() {
            session.update(diff, PacketFilter::World);
        }
        for session in self.sessions.values_mut() {
            session.update(diff, PacketFilter::Map);
        }

        let now = ms_now();
        let idle_timeout_ms = self.idle_timeout_ms;
        self.sessions.retain(|account_id, session| {
            if session.link().is_open() && session.link().idle_for(now) > idle_timeout_ms {
                info!(account_id = *account_id, "Kicking idle session");
                session.kick();
            }
            if !session.link().is_open() {
                debug!(account_id = *account_id, "Session left world");
                return false;
            }
            true
        });
    }

    /// Tick every `interval` until `shutdown` flips to true, then kick everyone.
    #[instrument(skip_all, fields(interval_ms = interval.as_millis() as u64))]
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = ms_now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = ms_now();
                    self.update(ms_diff(last, now));
                    last = now;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(sessions = self.sessions.len(), "World loop stopping");
        for session in self.sessions.values() {
            session.kick();
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::addon::AddonList;
    use crate::protocol::dispatcher::Dispatcher;
    use crate::protocol::session::{Outbound, SessionLink};
    use crate::service::accounts::AccountInfo;
    use crate::utils::crypto::{SessionKey, SESSION_KEY_LEN};
    use crate::utils::metrics::Metrics;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    fn session(account_id: u32, port: u16) -> (Session, mpsc::Receiver<Outbound>) {
        let config = SessionConfig::default();
        let (link, rx) = SessionLink::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), account_id, 0, 64, 64);
        let session = Session::new(
            AccountInfo::new(account_id, format!("ACC{account_id}"), SessionKey::new([1; SESSION_KEY_LEN])),
            2,
            AddonList::default(),
            link,
            Arc::new(Dispatcher::with_defaults()),
            &config,
            Arc::new(Metrics::new()),
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_duplicate_login_kicks_older() {
        let (mut world, handle) = World::new(&SessionConfig::default(), 8);
        let (first, mut first_rx) = session(7, 1000);
        let first_link = Arc::clone(first.link());
        let (second, _second_rx) = session(7, 1001);

        handle.add_session(first).await.unwrap();
        world.update(0);
        handle.add_session(second).await.unwrap();
        world.update(0);

        assert_eq!(world.session_count(), 1);
        assert!(!first_link.is_open());
        assert!(matches!(first_rx.recv().await, Some(Outbound::Close)));
        assert_eq!(world.session(7).unwrap().link().peer().port(), 1001);
    }

    #[tokio::test]
    async fn test_closed_sessions_are_reaped() {
        let (mut world, _handle) = World::new(&SessionConfig::default(), 8);
        let (s, _rx) = session(3, 1000);
        let link = Arc::clone(s.link());
        world.add_session(s);
        world.update(50);
        assert_eq!(world.session_count(), 1);

        link.close();
        world.update(50);
        assert_eq!(world.session_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_kicked() {
        let config = SessionConfig {
            idle_timeout: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let (mut world, _handle) = World::new(&config, 8);
        let (s, _rx) = session(5, 1000);
        let link = Arc::clone(s.link());
        world.add_session(s);

        tokio::time::sleep(Duration::from_millis(60)).await;
        world.update(60);
        assert!(!link.is_open());
        assert_eq!(world.session_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (world, handle) = World::new(&SessionConfig::default(), 8);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(world.run(Duration::from_millis(5), rx));

        let (s, mut out) = session(9, 1000);
        handle.add_session(s).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(matches!(out.recv().await, Some(Outbound::Close)));
        assert!(handle.add_session(session(10, 1001).0).await.is_err());
    }
}
