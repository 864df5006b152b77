// ABOUTME: Local-to-remote TCP tunnels through SSH sessions.
// ABOUTME: A registry tracks running tunnels by identity.

mod config;
mod error;
mod forward;
mod registry;
mod state;

pub use config::TunnelConfig;
pub use error::{Error, Result};
pub use forward::Tunnel;
pub use registry::TunnelRegistry;
pub use state::{StopReport, TunnelEvent, TunnelState, TunnelStats};
