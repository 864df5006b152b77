// ABOUTME: Server and SSH endpoint configuration.
// ABOUTME: Parses formats like "host", "user@host", "host:port", "user@host:port".

use crate::ssh::SessionConfig;
use crate::types::ServerId;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::deserialize::deserialize_endpoint_option;

/// Where and how to open one SSH session.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_pem: Option<String>,
    #[serde(default)]
    pub agent: bool,
    #[serde(default = "default_trust_first_connection")]
    pub trust_first_connection: bool,
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub command_timeout: Option<Duration>,
}

fn default_port() -> u16 {
    22
}

fn default_trust_first_connection() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>().map_err(|_| format!("invalid port: {}", s))
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("server address cannot be empty".to_string());
        }

        // Parse format: [user@]host[:port]
        let (user_part, rest) = match s.split_once('@') {
            Some((user, rest)) => (Some(user), rest),
            None => (None, s),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            // [v6] or [v6]:port
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| format!("unclosed bracket in address: {}", rest))?;
            let port = match tail {
                "" => 22,
                _ => {
                    let port_str = tail
                        .strip_prefix(':')
                        .ok_or_else(|| format!("unexpected text after bracketed host: {}", tail))?;
                    parse_port(port_str)?
                }
            };
            (host, port)
        } else if rest.matches(':').count() > 1 {
            return Err(format!(
                "IPv6 addresses must be bracketed, e.g. [{}]:22",
                rest
            ));
        } else if let Some((host, port_str)) = rest.split_once(':') {
            (host, parse_port(port_str)?)
        } else {
            (rest, 22)
        };

        if host.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }
        if user_part.is_some_and(str::is_empty) {
            return Err("user cannot be empty".to_string());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            user: user_part.map(str::to_string),
            password: None,
            key_path: None,
            key_pem: None,
            agent: false,
            trust_first_connection: default_trust_first_connection(),
            known_hosts: None,
            timeout: default_timeout(),
            command_timeout: None,
        })
    }

    /// Configured user, falling back to `$USER`, then `root`.
    pub fn user(&self) -> String {
        self.user
            .clone()
            .unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "root".to_string()))
    }

    /// `host:port`, the address this endpoint's SSH server listens on.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Session settings for connecting straight to this endpoint.
    ///
    /// Without any explicit credential the SSH agent is offered.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(&self.host, self.user())
            .port(self.port)
            .trust_on_first_use(self.trust_first_connection)
            .timeout(self.timeout);

        if let Some(password) = &self.password {
            config = config.password(password);
        }
        if let Some(path) = &self.key_path {
            config = config.key_path(expand_home(path));
        }
        if let Some(pem) = &self.key_pem {
            config = config.key_pem(pem);
        }
        if self.agent || !self.has_credentials() {
            config = config.agent(true);
        }
        if let Some(path) = &self.known_hosts {
            config = config.known_hosts_path(expand_home(path));
        }
        if let Some(timeout) = self.command_timeout {
            config = config.command_timeout(timeout);
        }
        config
    }

    fn has_credentials(&self) -> bool {
        self.password.is_some() || self.key_path.is_some() || self.key_pem.is_some()
    }
}

/// A server commands can be run against, possibly behind a bastion.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub id: ServerId,
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(default, deserialize_with = "deserialize_endpoint_option")]
    pub bastion: Option<Endpoint>,
}

/// How a server is reached.
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    Direct,
    Bastion(&'a Endpoint),
}

impl ServerConfig {
    pub fn new(id: impl Into<ServerId>, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
            bastion: None,
        }
    }

    pub fn via(mut self, bastion: Endpoint) -> Self {
        self.bastion = Some(bastion);
        self
    }

    pub fn route(&self) -> Route<'_> {
        match &self.bastion {
            Some(bastion) => Route::Bastion(bastion),
            None => Route::Direct,
        }
    }
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
