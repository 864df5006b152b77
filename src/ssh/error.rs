// ABOUTME: SSH-specific error types.
// ABOUTME: Covers credential, dial, command execution and batch failures.

use super::client::CommandResult;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication failed: no credential configured for {user}@{host}")]
    NoCredentials { user: String, host: String },

    #[error("authentication failed: no valid credentials")]
    AuthenticationFailed,

    #[error("SSH agent not available: {0}")]
    AgentUnavailable(String),

    #[error("failed to load key from {path}: {reason}")]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("invalid address {0:?}: expected host:port")]
    InvalidAddress(String),

    #[error("command execution failed: {0}")]
    CommandFailed(String),

    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    /// The channel ended before reporting an exit status. Whatever output
    /// arrived before that is kept in `partial` (exit code `-1`).
    #[error("channel closed unexpectedly without exit status")]
    ChannelClosed { partial: Box<CommandResult> },

    #[error("command {command:?} exited with status {exit_code}")]
    NonZeroExit { command: String, exit_code: i32 },

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error came from credential resolution or rejection.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Error::NoCredentials { .. }
                | Error::AuthenticationFailed
                | Error::AgentUnavailable(_)
                | Error::KeyLoadFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a sequential command batch.
///
/// `results` holds every result gathered up to and including the command
/// that stopped the batch, so callers can see how far execution got.
#[derive(Debug, Error)]
#[error("command {index} of batch failed: {source}")]
pub struct BatchError {
    pub index: usize,
    pub results: Vec<CommandResult>,
    #[source]
    pub source: Error,
}
