// ABOUTME: Tunnel lifecycle states, statistics snapshots and events.
// ABOUTME: Stats and events are serializable for JSON output.

use crate::types::TunnelId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

/// Lifecycle of a tunnel.
///
/// `Created → Starting → Active → Stopped`, or `Active → Failed` when the
/// listener keeps failing. `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Created,
    Starting,
    Active,
    Stopped,
    Failed,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Stopped | TunnelState::Failed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Created => "created",
            TunnelState::Starting => "starting",
            TunnelState::Active => "active",
            TunnelState::Stopped => "stopped",
            TunnelState::Failed => "failed",
        };
        f.pad(name)
    }
}

/// Point-in-time snapshot of a tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStats {
    pub id: TunnelId,
    pub state: TunnelState,
    pub active: bool,
    /// Connections accepted since creation, not currently open.
    pub connections: u64,
    /// Connections currently being forwarded.
    pub open_connections: usize,
    pub last_activity: Option<DateTime<Utc>>,
    /// Bound address while active, configured address otherwise.
    pub local_addr: String,
    pub remote_addr: String,
    pub forward_failures: u64,
    pub accept_errors: u64,
    /// Connections closed by force because they outlived the drain timeout.
    pub forced_closes: u64,
}

/// Outcome of stopping a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Forwarded connections that had to be closed by force.
    pub forced: usize,
}

/// Events published by a running tunnel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TunnelEvent {
    Started { local_addr: SocketAddr },
    ConnectionOpened { peer: SocketAddr },
    ConnectionClosed { peer: SocketAddr },
    ForwardFailed { peer: SocketAddr, reason: String },
    AcceptFailed { reason: String, consecutive: u32 },
    Failed { reason: String },
    Stopped { forced: usize },
}
