// ABOUTME: Per-server cache of established SSH sessions.
// ABOUTME: Routes through an on-demand bastion tunnel when a server is not directly reachable.

mod error;
mod ports;

pub use error::{Error, Result};
pub use ports::PortPool;

use crate::config::{Endpoint, PortRange, Route, ServerConfig};
use crate::ssh::{Session, split_host_port};
use crate::tunnel::{self, Tunnel, TunnelConfig, TunnelRegistry, TunnelState};
use crate::types::{ServerId, TunnelId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;

/// Bind collisions with other processes tolerated before giving up.
const MAX_BIND_ATTEMPTS: usize = 8;

/// Loopback address bastion tunnels listen on.
const TUNNEL_HOST: &str = "127.0.0.1";

#[derive(Clone)]
struct Cached {
    session: Arc<Session>,
    /// Local port of the bastion tunnel, when the server is tunneled.
    port: Option<u16>,
}

/// One server's entry. `released` is claimed by whoever tears the
/// connection down, so teardown happens once even when a close races
/// an in-flight connect.
#[derive(Default)]
struct Slot {
    cell: OnceCell<Cached>,
    released: AtomicBool,
}

impl Slot {
    fn claim_release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

/// Established sessions keyed by server identity.
///
/// Concurrent first requests for the same server share one connection
/// attempt; a failed attempt leaves nothing behind.
pub struct ServerConnectionCache {
    registry: Arc<TunnelRegistry>,
    ports: PortPool,
    entries: Mutex<HashMap<ServerId, Arc<Slot>>>,
}

impl std::fmt::Debug for ServerConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnectionCache")
            .field("ports", &self.ports)
            .field("servers", &self.entries.lock().len())
            .finish()
    }
}

/// Registry id of the bastion tunnel dedicated to `server`.
pub fn bastion_tunnel_id(server: &str) -> TunnelId {
    TunnelId::new(format!("bastion:{}", server))
}

impl ServerConnectionCache {
    pub fn new(registry: Arc<TunnelRegistry>, ports: PortRange) -> Self {
        Self {
            registry,
            ports: PortPool::new(ports),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// Whether a connected session is cached for `server`.
    pub fn contains(&self, server: &str) -> bool {
        self.entries
            .lock()
            .get(server)
            .is_some_and(|slot| slot.cell.initialized())
    }

    /// The cached session for `server`, connecting on a miss.
    pub async fn get_session(&self, server: &ServerConfig) -> Result<Arc<Session>> {
        let slot = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(server.id.clone()).or_default())
        };

        let cached = match slot.cell.get_or_try_init(|| self.connect(server)).await {
            Ok(cached) => cached.clone(),
            Err(e) => {
                let mut entries = self.entries.lock();
                // Callers still waiting on this slot retry on it; only drop an
                // entry nobody else holds
                let abandoned = entries.get(&server.id).is_some_and(|current| {
                    Arc::ptr_eq(current, &slot) && Arc::strong_count(&slot) == 2
                });
                if abandoned {
                    entries.remove(&server.id);
                }
                return Err(e);
            }
        };

        let registered = self
            .entries
            .lock()
            .get(&server.id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if registered {
            return Ok(cached.session);
        }

        // Closed while connecting: close_connection saw an empty slot
        if slot.claim_release() {
            tracing::debug!(server = %server.id, "Connection closed while it was being established");
            if let Err(e) = self.release(server.id.as_str(), &cached).await {
                tracing::warn!(server = %server.id, "Failed to close connection: {}", e);
            }
        }
        Err(Error::Closed(server.id.clone()))
    }

    async fn connect(&self, server: &ServerConfig) -> Result<Cached> {
        match server.route() {
            Route::Direct => {
                tracing::debug!(server = %server.id, "Connecting directly");
                let session = Session::new(server.endpoint.session_config());
                session.connect().await?;
                Ok(Cached {
                    session: Arc::new(session),
                    port: None,
                })
            }
            Route::Bastion(bastion) => self.connect_via_bastion(server, bastion).await,
        }
    }

    async fn connect_via_bastion(&self, server: &ServerConfig, bastion: &Endpoint) -> Result<Cached> {
        let tunnel_id = bastion_tunnel_id(server.id.as_str());
        let port = self
            .ensure_tunnel(&tunnel_id, bastion, &server.endpoint.address())
            .await?;

        tracing::debug!(
            server = %server.id,
            bastion = %bastion.address(),
            port,
            "Connecting through bastion tunnel"
        );

        let mut config = server.endpoint.session_config();
        config.host = TUNNEL_HOST.to_string();
        config.port = port;
        let config = config.host_key_alias(&server.endpoint.host, server.endpoint.port);

        let session = Session::new(config);
        if let Err(e) = session.connect().await {
            self.discard_tunnel(&tunnel_id, port).await;
            return Err(e.into());
        }

        Ok(Cached {
            session: Arc::new(session),
            port: Some(port),
        })
    }

    /// Reuse the server's active tunnel or start a new one. Returns its port.
    async fn ensure_tunnel(
        &self,
        tunnel_id: &TunnelId,
        bastion: &Endpoint,
        remote_addr: &str,
    ) -> Result<u16> {
        if let Ok(existing) = self.registry.get(tunnel_id.as_str()).await {
            if let (TunnelState::Active, Some(addr)) = (existing.state(), existing.local_addr()) {
                return Ok(addr.port());
            }
            // A failed tunnel no longer reports its address; the configured one has the port
            let stale_port = split_host_port(&existing.config().local_addr)
                .ok()
                .map(|(_, port)| port);
            match self.registry.stop_tunnel(tunnel_id.as_str()).await {
                Ok(_) | Err(tunnel::Error::NotFound(_)) => {}
                Err(e) => tracing::warn!(tunnel = %tunnel_id, "Failed to stop stale tunnel: {}", e),
            }
            if let Some(port) = stale_port {
                self.ports.release(port);
            }
        }

        let mut collisions = Vec::new();
        let outcome = loop {
            let Some(port) = self.ports.claim() else {
                let range = self.ports.range();
                break Err(Error::PortsExhausted {
                    start: range.start,
                    end: range.end,
                });
            };

            let tunnel = Tunnel::over_ssh(
                tunnel_id.clone(),
                bastion.session_config(),
                TunnelConfig::new(format!("{}:{}", TUNNEL_HOST, port), remote_addr),
            );

            match self.registry.start_tunnel(tunnel).await {
                Ok(_) => break Ok(port),
                Err(tunnel::Error::Bind { addr, source }) => {
                    tracing::debug!("Local port {} unavailable: {}", addr, source);
                    collisions.push(port);
                    if collisions.len() >= MAX_BIND_ATTEMPTS {
                        break Err(tunnel::Error::Bind { addr, source }.into());
                    }
                }
                Err(e) => {
                    self.ports.release(port);
                    break Err(e.into());
                }
            }
        };

        // Ports held by other processes go back; the cursor has moved past them
        for port in collisions {
            self.ports.release(port);
        }
        outcome
    }

    async fn discard_tunnel(&self, tunnel_id: &TunnelId, port: u16) {
        match self.registry.stop_tunnel(tunnel_id.as_str()).await {
            Ok(_) | Err(tunnel::Error::NotFound(_)) => {}
            Err(e) => tracing::warn!(tunnel = %tunnel_id, "Failed to stop tunnel: {}", e),
        }
        self.ports.release(port);
    }

    /// Close and evict the server's session and stop its bastion tunnel.
    ///
    /// A connection still being established is torn down by its caller
    /// once it completes.
    pub async fn close_connection(&self, server: &str) -> Result<()> {
        let slot = self.entries.lock().remove(server);
        let cached = slot
            .as_ref()
            .and_then(|slot| slot.cell.get().cloned().filter(|_| slot.claim_release()));

        let result = match &cached {
            Some(cached) => self.release(server, cached).await,
            None => self.stop_bastion_tunnel(server).await,
        };
        tracing::debug!(server, "Connection closed");
        result
    }

    /// Close the session, stop its tunnel and return its port.
    async fn release(&self, server: &str, cached: &Cached) -> Result<()> {
        let closed = cached.session.close().await;
        let stopped = self.stop_bastion_tunnel(server).await;
        if let Some(port) = cached.port {
            self.ports.release(port);
        }
        closed?;
        stopped
    }

    async fn stop_bastion_tunnel(&self, server: &str) -> Result<()> {
        match self.registry.stop_tunnel(bastion_tunnel_id(server).as_str()).await {
            Ok(_) | Err(tunnel::Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Close every cached connection, reporting the first failure.
    pub async fn close_all(&self) -> Result<()> {
        let servers: Vec<ServerId> = self.entries.lock().keys().cloned().collect();
        let mut first_error = None;
        for server in servers {
            if let Err(e) = self.close_connection(server.as_str()).await {
                tracing::warn!(server = %server, "Failed to close connection: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
