// ABOUTME: Application-wide error types for jumpwire.
// ABOUTME: Uses thiserror for ergonomic error handling.

use crate::{cache, ssh, tunnel};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found in {0}")]
    ConfigNotFound(PathBuf),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Ssh(#[from] ssh::Error),

    #[error(transparent)]
    Batch(#[from] ssh::BatchError),

    #[error(transparent)]
    Tunnel(#[from] tunnel::Error),

    #[error(transparent)]
    Cache(#[from] cache::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
