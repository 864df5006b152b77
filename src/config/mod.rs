// ABOUTME: Configuration types and parsing for jumpwire.yml.
// ABOUTME: Describes servers (direct or behind a bastion), static tunnels and the port pool.

mod deserialize;
mod server;
mod tunnel;

pub use server::{Endpoint, Route, ServerConfig};
pub use tunnel::TunnelEntry;

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

pub const CONFIG_FILENAME: &str = "jumpwire.yml";
pub const CONFIG_FILENAME_ALT: &str = "jumpwire.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".jumpwire/config.yml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: PortRange,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
}

/// Local ports handed out to on-demand bastion tunnels, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 20000,
            end: 20100,
        }
    }
}

impl PortRange {
    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    pub fn server(&self, id: &str) -> Result<&ServerConfig> {
        self.servers
            .iter()
            .find(|server| server.id.as_str() == id)
            .ok_or_else(|| Error::UnknownServer(id.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "port range {}..{} is empty",
                self.ports.start, self.ports.end
            )));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate server id: {}",
                    server.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for tunnel in &self.tunnels {
            if !seen.insert(tunnel.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate tunnel id: {}",
                    tunnel.id
                )));
            }
            crate::ssh::split_host_port(&tunnel.remote)
                .map_err(|e| Error::InvalidConfig(format!("tunnel {}: {}", tunnel.id, e)))?;
        }

        Ok(())
    }
}
