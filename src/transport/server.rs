//! # World Server
//!
//! TCP accept loop, world loop and graceful shutdown.
//!
//! ## Lifecycle
//! 1. [`Server::bind`] validates the config and binds the listener
//! 2. [`Server::run_until`] spawns the world loop and accepts connections,
//!    one task each, bounded by `server.max_connections`
//! 3. When the shutdown future resolves every task is told to stop, and the
//!    server waits up to `server.shutdown_timeout` for connections to drain

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::service::accounts::AccountStore;
use crate::service::realm::Realm;
use crate::service::world::World;
use crate::transport::connection::{handle_connection, ConnectionContext};
use crate::utils::metrics::Metrics;

/// How often the drain loop checks for remaining connections.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Server<S> {
    listener: TcpListener,
    config: Arc<NetworkConfig>,
    store: Arc<S>,
    realm: Arc<Realm>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl<S: AccountStore> Server<S> {
    /// Validate `config` and bind `server.address`.
    pub async fn bind(config: NetworkConfig, store: Arc<S>, dispatcher: Dispatcher) -> Result<Self> {
        config.validate_strict()?;

        let listener = TcpListener::bind(&config.server.address).await?;
        info!(address = %listener.local_addr()?, realm_id = config.realm.realm_id, "Listening");

        Ok(Self {
            listener,
            realm: Arc::new(Realm::from_config(&config.realm)),
            config: Arc::new(config),
            store,
            dispatcher: Arc::new(dispatcher),
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Realm toggles stay live while the server runs.
    pub fn realm(&self) -> Arc<Realm> {
        Arc::clone(&self.realm)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Received shutdown signal, initiating graceful shutdown");
        })
        .await
    }

    /// Run until `shutdown` resolves.
    #[instrument(skip_all, fields(realm_id = self.realm.id()))]
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let server_config = &self.config.server;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (world, world_handle) = World::new(&self.config.session, server_config.max_connections);
        let world_task = tokio::spawn(world.run(server_config.world_update_interval, shutdown_rx.clone()));

        let ctx = ConnectionContext {
            store: Arc::clone(&self.store),
            realm: Arc::clone(&self.realm),
            dispatcher: Arc::clone(&self.dispatcher),
            world: world_handle,
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
        };

        let max_connections = server_config.max_connections;
        let permits = Arc::new(Semaphore::new(max_connections));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down server. Waiting for connections to close...");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        warn!(%peer, max_connections, "Connection limit reached, rejecting");
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let ctx = ctx.clone();
                    let task_shutdown = shutdown_rx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        log_connection_end(peer, handle_connection(stream, peer, ctx, task_shutdown).await);
                    });
                }
            }
        }

        let _ = shutdown_tx.send(true);
        self.drain(&permits, max_connections).await;

        if let Err(e) = world_task.await {
            error!(error = %e, "World loop task failed");
        }
        self.metrics.log_summary();
        Ok(())
    }

    async fn drain(&self, permits: &Semaphore, max_connections: usize) {
        let timeout = tokio::time::sleep(self.config.server.shutdown_timeout);
        tokio::pin!(timeout);

        loop {
            let connections = max_connections - permits.available_permits();
            if connections == 0 {
                info!("All connections closed, shutting down");
                return;
            }
            tokio::select! {
                _ = &mut timeout => {
                    warn!(connections, "Shutdown timeout reached, forcing exit");
                    return;
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {
                    debug!(connections, "Waiting for connections to close");
                }
            }
        }
    }
}

fn log_connection_end(peer: SocketAddr, result: Result<()>) {
    match result {
        Ok(()) => debug!(%peer, "Connection closed"),
        Err(ProtocolError::AuthRejected(code)) => info!(%peer, %code, "Connection rejected"),
        Err(ProtocolError::ConnectionClosed | ProtocolError::Timeout) => {
            debug!(%peer, "Connection dropped before completing")
        }
        Err(e) => warn!(%peer, error = %e, "Connection closed with error"),
    }
}
