// ABOUTME: Error types for tunnel lifecycle and registry operations.
// ABOUTME: Every misuse (double start, duplicate id, unknown id) gets its own variant.

use super::state::TunnelState;
use crate::ssh;
use crate::types::TunnelId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `start` was called while the tunnel is starting or active.
    #[error("tunnel {0} is already active")]
    AlreadyActive(TunnelId),

    /// Stopped and failed tunnels are terminal; build a new one instead.
    #[error("tunnel {id} is {state} and cannot be restarted")]
    NotRestartable { id: TunnelId, state: TunnelState },

    #[error("tunnel {0} already exists")]
    DuplicateId(TunnelId),

    #[error("tunnel {0} not found")]
    NotFound(TunnelId),

    #[error("failed to bind local address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel {id}: {source}")]
    Session {
        id: TunnelId,
        #[source]
        source: ssh::Error,
    },

    /// Aggregate of every tunnel that failed to stop cleanly.
    #[error("{} tunnel(s) failed to stop", .failures.len())]
    StopAll { failures: Vec<(TunnelId, Error)> },
}

pub type Result<T> = std::result::Result<T, Error>;
