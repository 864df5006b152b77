// ABOUTME: SSH session management using russh.
// ABOUTME: Handles connect-on-first-use, authentication, command execution and dialing.

use super::error::{BatchError, Error, Result};
use parking_lot::Mutex;
use russh::client::{self, Config, Handle, Msg};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key, load_secret_key, ssh_key};
use russh::{ChannelMsg, ChannelStream, Disconnect, Sig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;

/// Configuration for establishing an SSH session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub user: String,
    /// Password authentication.
    pub password: Option<String>,
    /// Path to a private key file.
    pub key_path: Option<PathBuf>,
    /// Inline private key material (OpenSSH or PEM encoded).
    pub key_pem: Option<String>,
    /// Offer the keys held by the SSH agent.
    pub agent: bool,
    /// Whether to accept unknown hosts (Trust On First Use).
    pub trust_on_first_use: bool,
    /// Optional path to known_hosts file.
    /// If None, uses the default ~/.ssh/known_hosts.
    pub known_hosts_path: Option<PathBuf>,
    /// Identity used for host key verification instead of host/port.
    /// Set when the session reaches its target through a local tunnel.
    pub host_key_alias: Option<(String, u16)>,
    /// Connection-level timeout covering TCP connect, handshake and auth.
    pub timeout: Duration,
    /// Optional timeout applied to every `exec`.
    pub command_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            password: None,
            key_path: None,
            key_pem: None,
            agent: false,
            trust_on_first_use: false,
            known_hosts_path: None,
            host_key_alias: None,
            timeout: Duration::from_secs(10),
            command_timeout: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn key_pem(mut self, pem: impl Into<String>) -> Self {
        self.key_pem = Some(pem.into());
        self
    }

    pub fn agent(mut self, agent: bool) -> Self {
        self.agent = agent;
        self
    }

    pub fn trust_on_first_use(mut self, tofu: bool) -> Self {
        self.trust_on_first_use = tofu;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn host_key_alias(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host_key_alias = Some((host.into(), port));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// `user@host:port`, used in logs and error messages.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    fn has_credentials(&self) -> bool {
        self.password.is_some() || self.key_path.is_some() || self.key_pem.is_some() || self.agent
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("key_pem", &self.key_pem.as_ref().map(|_| "<redacted>"))
            .field("agent", &self.agent)
            .field("trust_on_first_use", &self.trust_on_first_use)
            .field("host_key_alias", &self.host_key_alias)
            .field("timeout", &self.timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

/// Output from a remote command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit code of the command, `-1` when no status was reported.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Wall-clock time from channel open to completion.
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// SSH client handler for russh.
pub(crate) struct SshHandler {
    host: String,
    port: u16,
    trust_on_first_use: bool,
    known_hosts_path: Option<PathBuf>,
}

impl SshHandler {
    fn new(config: &SessionConfig) -> Self {
        let (host, port) = config
            .host_key_alias
            .clone()
            .unwrap_or_else(|| (config.host.clone(), config.port));
        Self {
            host,
            port,
            trust_on_first_use: config.trust_on_first_use,
            known_hosts_path: config.known_hosts_path.clone(),
        }
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let check_result = match &self.known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match check_result {
            Ok(true) => Ok(true),
            Ok(false) if self.trust_on_first_use => {
                tracing::warn!(
                    "Trust-On-First-Use: accepting unknown host key for {}:{}",
                    self.host,
                    self.port
                );
                let learn_result = match &self.known_hosts_path {
                    Some(path) => {
                        learn_known_hosts_path(&self.host, self.port, server_public_key, path)
                    }
                    None => learn_known_hosts(&self.host, self.port, server_public_key),
                };
                if let Err(e) = learn_result {
                    tracing::warn!("Failed to save host key to known_hosts: {}", e);
                }
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(russh::keys::Error::KeyChanged { .. }) => {
                tracing::warn!("Host key for {}:{} has changed", self.host, self.port);
                Ok(false)
            }
            // Unreadable known_hosts: treat as unknown host
            Err(_) => Ok(self.trust_on_first_use),
        }
    }
}

/// Authentication method resolved from config.
enum AuthMethod {
    Key(Arc<ssh_key::PrivateKey>),
    Password(String),
    Agent(AgentClient<UnixStream>),
}

/// An authenticated SSH connection to one host.
///
/// A session starts unconnected. `connect` establishes the transport;
/// `exec`, `file_exists` and `dial` connect on first use.
pub struct Session {
    config: SessionConfig,
    handle: Mutex<Option<Arc<Handle<SshHandler>>>>,
    /// Serializes connection attempts so a session never double-connects.
    connecting: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Session {
    /// Create an unconnected session.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a session and connect it immediately.
    pub async fn open(config: SessionConfig) -> Result<Self> {
        let session = Self::new(config);
        session.connect().await?;
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a live transport handle is present.
    pub fn is_connected(&self) -> bool {
        self.live_handle().is_some()
    }

    fn live_handle(&self) -> Option<Arc<Handle<SshHandler>>> {
        self.handle
            .lock()
            .as_ref()
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Establish the transport. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        // Resolve credentials before any network I/O
        let auth_methods = Self::resolve_auth_methods(&self.config).await?;

        let handle = tokio::time::timeout(
            self.config.timeout,
            Self::establish(&self.config, auth_methods),
        )
        .await
        .map_err(|_| Error::Dial {
            addr: format!("{}:{}", self.config.host, self.config.port),
            reason: format!("timed out after {:?}", self.config.timeout),
        })??;

        tracing::debug!(remote = %self.config.target(), "SSH session established");
        *self.handle.lock() = Some(Arc::new(handle));
        Ok(())
    }

    async fn establish(
        config: &SessionConfig,
        auth_methods: Vec<AuthMethod>,
    ) -> Result<Handle<SshHandler>> {
        let russh_config = Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let mut handle = client::connect(
            Arc::new(russh_config),
            (config.host.as_str(), config.port),
            SshHandler::new(config),
        )
        .await
        .map_err(|e| Error::Dial {
            addr: format!("{}:{}", config.host, config.port),
            reason: e.to_string(),
        })?;

        for method in auth_methods {
            if Self::authenticate(&mut handle, &config.user, method).await? {
                return Ok(handle);
            }
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        Err(Error::AuthenticationFailed)
    }

    /// Resolve the configured credentials, in the order they are tried.
    async fn resolve_auth_methods(config: &SessionConfig) -> Result<Vec<AuthMethod>> {
        if !config.has_credentials() {
            return Err(Error::NoCredentials {
                user: config.user.clone(),
                host: config.host.clone(),
            });
        }

        let mut methods = Vec::new();

        if let Some(pem) = &config.key_pem {
            let key = decode_secret_key(pem, None).map_err(|e| Error::KeyLoadFailed {
                path: PathBuf::from("<inline>"),
                reason: e.to_string(),
            })?;
            methods.push(AuthMethod::Key(Arc::new(key)));
        }

        if let Some(key_path) = &config.key_path {
            let key = load_secret_key(key_path, None).map_err(|e| Error::KeyLoadFailed {
                path: key_path.clone(),
                reason: e.to_string(),
            })?;
            methods.push(AuthMethod::Key(Arc::new(key)));
        }

        if let Some(password) = &config.password {
            methods.push(AuthMethod::Password(password.clone()));
        }

        if config.agent {
            match AgentClient::connect_env().await {
                Ok(agent) => methods.push(AuthMethod::Agent(agent)),
                Err(e) if methods.is_empty() => {
                    return Err(Error::AgentUnavailable(e.to_string()));
                }
                Err(e) => tracing::debug!("SSH agent not available: {}", e),
            }
        }

        Ok(methods)
    }

    /// Try one authentication method.
    async fn authenticate(
        handle: &mut Handle<SshHandler>,
        user: &str,
        method: AuthMethod,
    ) -> Result<bool> {
        match method {
            AuthMethod::Key(key) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let result = handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await?;
                Ok(result.success())
            }
            AuthMethod::Password(password) => {
                let result = handle.authenticate_password(user, password).await?;
                Ok(result.success())
            }
            AuthMethod::Agent(mut agent) => {
                let keys = agent.request_identities().await.map_err(|e| {
                    Error::AgentUnavailable(format!("failed to list agent keys: {}", e))
                })?;

                for key in keys {
                    match handle
                        .authenticate_publickey_with(user, key, None, &mut agent)
                        .await
                    {
                        Ok(result) if result.success() => return Ok(true),
                        _ => continue,
                    }
                }
                Ok(false)
            }
        }
    }

    async fn handle(&self) -> Result<Arc<Handle<SshHandler>>> {
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }
        self.connect().await?;
        self.live_handle().ok_or_else(|| Error::Dial {
            addr: format!("{}:{}", self.config.host, self.config.port),
            reason: "connection closed right after it was established".to_string(),
        })
    }

    /// Check if a file or socket exists on the remote host.
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let output = self
            .exec(&format!("test -e {} && echo exists", shell_quote(path)))
            .await?;
        Ok(output.stdout == "exists\n")
    }

    /// Execute a command on the remote host.
    ///
    /// A non-zero exit is reported through `CommandResult::exit_code`, not
    /// as an error.
    pub async fn exec(&self, command: &str) -> Result<CommandResult> {
        match self.config.command_timeout {
            Some(timeout) => self.exec_with_timeout(command, timeout).await,
            None => self.exec_inner(command).await,
        }
    }

    /// Execute a command with a custom timeout.
    pub async fn exec_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult> {
        match tokio::time::timeout(timeout, self.exec_inner(command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::CommandTimeout(timeout)),
        }
    }

    /// Execute commands in order, stopping at the first non-zero exit.
    pub async fn exec_all<S: AsRef<str>>(
        &self,
        commands: &[S],
    ) -> std::result::Result<Vec<CommandResult>, BatchError> {
        let mut results = Vec::with_capacity(commands.len());

        for (index, command) in commands.iter().enumerate() {
            let command = command.as_ref();
            match self.exec(command).await {
                Ok(result) => {
                    let exit_code = result.exit_code;
                    results.push(result);
                    if exit_code != 0 {
                        return Err(BatchError {
                            index,
                            results,
                            source: Error::NonZeroExit {
                                command: command.to_string(),
                                exit_code,
                            },
                        });
                    }
                }
                Err(source) => {
                    return Err(BatchError {
                        index,
                        results,
                        source,
                    });
                }
            }
        }

        Ok(results)
    }

    async fn exec_inner(&self, command: &str) -> Result<CommandResult> {
        let handle = self.handle().await?;
        let started = Instant::now();

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to exec command: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        let mut got_eof = false;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        // stderr
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(i32::try_from(exit_status).unwrap_or(i32::MAX));
                    if got_eof {
                        break;
                    }
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    tracing::debug!("Remote command terminated by signal {:?}", signal_name);
                    exit_code = Some(signal_exit_code(&signal_name));
                    if got_eof {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    got_eof = true;
                    if exit_code.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) => {
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }

        let mut result = CommandResult {
            exit_code: exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: started.elapsed(),
        };

        // The channel closed without an exit status: abnormal termination
        // (connection timeout, network issue). Keep what was captured.
        if exit_code.is_none() {
            result.exit_code = -1;
            return Err(Error::ChannelClosed {
                partial: Box::new(result),
            });
        }

        Ok(result)
    }

    /// Open a forwarded byte stream to an address reachable from the remote host.
    pub async fn dial(&self, remote_addr: &str) -> Result<ChannelStream<Msg>> {
        let (host, port) = split_host_port(remote_addr)?;
        let handle = self.handle().await?;

        let channel = handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| Error::Dial {
                addr: remote_addr.to_string(),
                reason: format!("direct-tcpip via {}: {}", self.config.target(), e),
            })?;

        Ok(channel.into_stream())
    }

    /// Release the transport. A no-op on an unconnected session.
    pub async fn close(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        tracing::debug!(remote = %self.config.target(), "Closing SSH session");
        if handle.is_closed() {
            return Ok(());
        }
        handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(Error::Protocol)
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(Error::InvalidAddress(addr.to_string()));
    }
    Ok((host, port))
}

/// Quote a string for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Shell convention for processes killed by a signal: 128 + signal number.
fn signal_exit_code(signal: &Sig) -> i32 {
    let number = match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        _ => return -1,
    };
    128 + number
}
