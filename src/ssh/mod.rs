// ABOUTME: SSH client module for remote server connections.
// ABOUTME: Sessions execute commands and dial forwarded streams through the remote host.

mod client;
mod error;
mod transport;

pub use client::{CommandResult, Session, SessionConfig, split_host_port};
pub use error::{BatchError, Error, Result};
pub use transport::{BoxedStream, RemoteStream, Transport};
