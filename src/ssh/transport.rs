// ABOUTME: Transport seam between tunnels and the SSH session that carries them.
// ABOUTME: A tunnel only needs to connect, dial forwarded streams and close.

use super::client::Session;
use super::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream opened through a transport.
pub trait RemoteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RemoteStream for T {}

pub type BoxedStream = Box<dyn RemoteStream>;

/// The capabilities a tunnel needs from the connection it forwards through.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying connection.
    async fn connect(&self) -> Result<()>;

    /// Open a stream to `remote_addr` as seen from the far end.
    async fn dial(&self, remote_addr: &str) -> Result<BoxedStream>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<()>;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl Transport for Session {
    async fn connect(&self) -> Result<()> {
        Session::connect(self).await
    }

    async fn dial(&self, remote_addr: &str) -> Result<BoxedStream> {
        let stream = Session::dial(self, remote_addr).await?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> Result<()> {
        Session::close(self).await
    }

    fn describe(&self) -> String {
        self.config().target()
    }
}
