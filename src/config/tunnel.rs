// ABOUTME: Statically configured tunnels started by the `tunnels` command.

use super::Endpoint;
use super::deserialize::deserialize_endpoint;
use crate::tunnel::TunnelConfig;
use crate::types::TunnelId;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelEntry {
    pub id: TunnelId,
    /// Host the tunnel forwards through.
    #[serde(deserialize_with = "deserialize_endpoint")]
    pub via: Endpoint,
    /// Local listen address, e.g. `127.0.0.1:15432`.
    pub local: String,
    /// Address dialed from `via`, e.g. `10.0.0.5:5432`.
    pub remote: String,
    #[serde(default, with = "humantime_serde")]
    pub drain_timeout: Option<Duration>,
}

impl TunnelEntry {
    pub fn tunnel_config(&self) -> TunnelConfig {
        let config = TunnelConfig::new(&self.local, &self.remote);
        match self.drain_timeout {
            Some(timeout) => config.drain_timeout(timeout),
            None => config,
        }
    }
}
