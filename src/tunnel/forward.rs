// ABOUTME: Local TCP forwarding through a transport.
// ABOUTME: Accepts local connections and relays each one to a fixed remote address.

use super::config::TunnelConfig;
use super::error::{Error, Result};
use super::state::{StopReport, TunnelEvent, TunnelState, TunnelStats};
use crate::ssh::{self, Session, SessionConfig, Transport};
use crate::types::TunnelId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause after a failed accept so a persistent fault does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A local listener forwarding every accepted connection to `remote_addr`
/// through its transport.
pub struct Tunnel {
    shared: Arc<Shared>,
    config: TunnelConfig,
}

/// State shared between the tunnel and its background tasks.
struct Shared {
    id: TunnelId,
    transport: Arc<dyn Transport>,
    remote_addr: String,
    inner: Mutex<Inner>,
    events: broadcast::Sender<TunnelEvent>,
}

struct Inner {
    state: TunnelState,
    bound_addr: Option<SocketAddr>,
    connections: u64,
    open_connections: usize,
    last_activity: Option<DateTime<Utc>>,
    forward_failures: u64,
    accept_errors: u64,
    forced_closes: u64,
    running: Option<Running>,
}

/// Handles owned only while the accept loop exists.
struct Running {
    shutdown: CancellationToken,
    force_close: CancellationToken,
    accept_task: JoinHandle<()>,
    forwarders: TaskTracker,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.shared.id)
            .field("transport", &self.shared.transport.describe())
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Tunnel {
    pub fn new(
        id: impl Into<TunnelId>,
        transport: Arc<dyn Transport>,
        config: TunnelConfig,
    ) -> Self {
        let config = config.normalized();
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                transport,
                remote_addr: config.remote_addr.clone(),
                inner: Mutex::new(Inner {
                    state: TunnelState::Created,
                    bound_addr: None,
                    connections: 0,
                    open_connections: 0,
                    last_activity: None,
                    forward_failures: 0,
                    accept_errors: 0,
                    forced_closes: 0,
                    running: None,
                }),
                events,
            }),
            config,
        }
    }

    /// Build a tunnel that owns a fresh SSH session.
    pub fn over_ssh(id: impl Into<TunnelId>, session: SessionConfig, config: TunnelConfig) -> Self {
        Self::new(id, Arc::new(Session::new(session)), config)
    }

    pub fn id(&self) -> &TunnelId {
        &self.shared.id
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.shared.inner.lock().state
    }

    /// The address the listener is bound to, while active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.shared.inner.lock();
        match inner.state {
            TunnelState::Active => inner.bound_addr,
            _ => None,
        }
    }

    /// Subscribe to lifecycle and per-connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Connect the transport, bind the listener and start accepting.
    pub async fn start(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                TunnelState::Created => inner.state = TunnelState::Starting,
                TunnelState::Starting | TunnelState::Active => {
                    return Err(Error::AlreadyActive(self.shared.id.clone()));
                }
                state @ (TunnelState::Stopped | TunnelState::Failed) => {
                    return Err(Error::NotRestartable {
                        id: self.shared.id.clone(),
                        state,
                    });
                }
            }
        }

        let result = self.launch().await;
        if result.is_err() {
            self.shared.inner.lock().state = TunnelState::Created;
        }
        result
    }

    async fn launch(&self) -> Result<()> {
        let shared = &self.shared;

        shared
            .transport
            .connect()
            .await
            .map_err(|source| Error::Session {
                id: shared.id.clone(),
                source,
            })?;

        let (listener, bound_addr) = match bind(&self.config.local_addr).await {
            Ok(bound) => bound,
            Err(e) => {
                // Do not leak a connected but unused session
                if let Err(close_err) = shared.transport.close().await {
                    tracing::warn!(tunnel = %shared.id, "Failed to close session: {}", close_err);
                }
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let force_close = CancellationToken::new();
        let forwarders = TaskTracker::new();

        let mut inner = shared.inner.lock();
        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            Arc::clone(shared),
            AcceptLoop {
                shutdown: shutdown.clone(),
                force_close: force_close.clone(),
                forwarders: forwarders.clone(),
                poll_interval: self.config.accept_poll_interval,
                max_failures: self.config.max_accept_failures,
            },
        ));
        inner.state = TunnelState::Active;
        inner.bound_addr = Some(bound_addr);
        inner.last_activity = Some(Utc::now());
        inner.running = Some(Running {
            shutdown,
            force_close,
            accept_task,
            forwarders,
        });
        drop(inner);

        tracing::info!(
            tunnel = %shared.id,
            local = %bound_addr,
            remote = %shared.remote_addr,
            via = %shared.transport.describe(),
            "Tunnel started"
        );
        shared.publish(TunnelEvent::Started {
            local_addr: bound_addr,
        });
        Ok(())
    }

    /// Stop accepting, drain open connections and close the transport.
    ///
    /// A no-op unless the tunnel is active (or failed with resources still
    /// held). Connections still open after the drain timeout are closed
    /// by force and counted in the report.
    pub async fn stop(&self) -> Result<StopReport> {
        let running = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                TunnelState::Active => inner.state = TunnelState::Stopped,
                TunnelState::Failed => {}
                TunnelState::Created | TunnelState::Starting | TunnelState::Stopped => {
                    return Ok(StopReport::default());
                }
            }
            inner.running.take()
        };
        let Some(running) = running else {
            return Ok(StopReport::default());
        };

        running.shutdown.cancel();
        // The accept task owns the listener; once it is joined the port is free
        if let Err(e) = running.accept_task.await {
            tracing::warn!(tunnel = %self.shared.id, "Accept loop ended abnormally: {}", e);
        }

        running.forwarders.close();
        let forced = match tokio::time::timeout(
            self.config.drain_timeout,
            running.forwarders.wait(),
        )
        .await
        {
            Ok(()) => 0,
            Err(_) => {
                let remaining = running.forwarders.len();
                tracing::warn!(
                    tunnel = %self.shared.id,
                    "Closing {} connection(s) still open after {:?}",
                    remaining,
                    self.config.drain_timeout
                );
                running.force_close.cancel();
                running.forwarders.wait().await;
                remaining
            }
        };

        {
            let mut inner = self.shared.inner.lock();
            inner.forced_closes += forced as u64;
            inner.bound_addr = None;
        }

        let closed = self.shared.transport.close().await;
        tracing::info!(tunnel = %self.shared.id, forced, "Tunnel stopped");
        self.shared.publish(TunnelEvent::Stopped { forced });

        closed.map_err(|source| Error::Session {
            id: self.shared.id.clone(),
            source,
        })?;
        Ok(StopReport { forced })
    }

    /// Snapshot of the tunnel's state and counters.
    pub fn stats(&self) -> TunnelStats {
        let inner = self.shared.inner.lock();
        TunnelStats {
            id: self.shared.id.clone(),
            state: inner.state,
            active: inner.state == TunnelState::Active,
            connections: inner.connections,
            open_connections: inner.open_connections,
            last_activity: inner.last_activity,
            local_addr: inner
                .bound_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| self.config.local_addr.clone()),
            remote_addr: self.shared.remote_addr.clone(),
            forward_failures: inner.forward_failures,
            accept_errors: inner.accept_errors,
            forced_closes: inner.forced_closes,
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(running) = self.shared.inner.lock().running.take() {
            running.shutdown.cancel();
            running.force_close.cancel();
        }
    }
}

impl Shared {
    fn publish(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn connection_opened(&self) {
        let mut inner = self.inner.lock();
        inner.connections += 1;
        inner.open_connections += 1;
        inner.last_activity = Some(Utc::now());
    }

    fn connection_closed(&self, failed: bool) {
        let mut inner = self.inner.lock();
        inner.open_connections = inner.open_connections.saturating_sub(1);
        inner.last_activity = Some(Utc::now());
        if failed {
            inner.forward_failures += 1;
        }
    }

    fn accept_failed(&self) {
        self.inner.lock().accept_errors += 1;
    }

    /// Move an active tunnel to `Failed`. Returns false if it was not active.
    fn mark_failed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TunnelState::Active {
            return false;
        }
        inner.state = TunnelState::Failed;
        true
    }
}

async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr)> {
    let bind_error = |source| Error::Bind {
        addr: addr.to_string(),
        source,
    };
    let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
    let bound = listener.local_addr().map_err(bind_error)?;
    Ok((listener, bound))
}

struct AcceptLoop {
    shutdown: CancellationToken,
    force_close: CancellationToken,
    forwarders: TaskTracker,
    poll_interval: Duration,
    max_failures: u32,
}

/// Accept connections until shutdown, or until the listener keeps failing.
async fn run_accept_loop(listener: TcpListener, shared: Arc<Shared>, ctl: AcceptLoop) {
    let mut consecutive_failures = 0u32;

    loop {
        if ctl.shutdown.is_cancelled() {
            break;
        }

        // Accept with a deadline so the shutdown signal is rechecked periodically
        let accepted = tokio::select! {
            _ = ctl.shutdown.cancelled() => break,
            result = tokio::time::timeout(ctl.poll_interval, listener.accept()) => result,
        };

        match accepted {
            Err(_deadline) => continue,
            Ok(Ok((stream, peer))) => {
                consecutive_failures = 0;
                ctl.forwarders.spawn(forward_connection(
                    stream,
                    peer,
                    Arc::clone(&shared),
                    ctl.force_close.clone(),
                ));
            }
            Ok(Err(e)) => {
                if ctl.shutdown.is_cancelled() {
                    break;
                }
                consecutive_failures += 1;
                shared.accept_failed();
                tracing::warn!(
                    tunnel = %shared.id,
                    consecutive = consecutive_failures,
                    "Accept error: {}",
                    e
                );
                shared.publish(TunnelEvent::AcceptFailed {
                    reason: e.to_string(),
                    consecutive: consecutive_failures,
                });

                if consecutive_failures >= ctl.max_failures {
                    let reason = format!(
                        "listener failed {} times in a row, last error: {}",
                        consecutive_failures, e
                    );
                    if shared.mark_failed() {
                        tracing::error!(tunnel = %shared.id, "{}", reason);
                        shared.publish(TunnelEvent::Failed { reason });
                    }
                    break;
                }
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    tracing::debug!(tunnel = %shared.id, "Accept loop finished");
}

/// Forward a single accepted connection until either side finishes.
async fn forward_connection(
    local: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    force_close: CancellationToken,
) {
    shared.connection_opened();
    shared.publish(TunnelEvent::ConnectionOpened { peer });
    tracing::debug!(tunnel = %shared.id, %peer, "Connection accepted");

    // Dropping the relay future on force close drops both sockets
    let outcome = tokio::select! {
        _ = force_close.cancelled() => Ok(()),
        result = relay(local, &shared) => result,
    };

    let failed = outcome.is_err();
    shared.connection_closed(failed);
    match outcome {
        Ok(()) => {
            tracing::debug!(tunnel = %shared.id, %peer, "Connection closed");
            shared.publish(TunnelEvent::ConnectionClosed { peer });
        }
        Err(e) => {
            tracing::debug!(tunnel = %shared.id, %peer, "Forwarding failed: {}", e);
            shared.publish(TunnelEvent::ForwardFailed {
                peer,
                reason: e.to_string(),
            });
        }
    }
}

/// Copy bytes both ways. The connection is finished as soon as either
/// direction ends; the other direction is dropped with it.
async fn relay(local: TcpStream, shared: &Shared) -> ssh::Result<()> {
    let remote = shared.transport.dial(&shared.remote_addr).await?;

    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let finished = tokio::select! {
        result = tokio::io::copy(&mut local_read, &mut remote_write) => result,
        result = tokio::io::copy(&mut remote_read, &mut local_write) => result,
    };

    let _ = local_write.shutdown().await;
    let _ = remote_write.shutdown().await;

    finished.map(|_| ()).map_err(ssh::Error::Io)
}
