// ABOUTME: Error types for the per-server session cache.

use crate::types::ServerId;
use crate::{ssh, tunnel};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Ssh(#[from] ssh::Error),

    #[error(transparent)]
    Tunnel(#[from] tunnel::Error),

    #[error("no free local port in {start}..{end} for a bastion tunnel")]
    PortsExhausted { start: u16, end: u16 },

    #[error("connection to {0} was closed while it was being established")]
    Closed(ServerId),
}

pub type Result<T> = std::result::Result<T, Error>;
