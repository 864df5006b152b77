// ABOUTME: Transport that dials plain TCP on the local machine.
// ABOUTME: Lets tunnel tests run against real sockets without an SSH server.

use async_trait::async_trait;
use jumpwire::ssh::{self, BoxedStream, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Counts lifecycle calls so tests can check sessions are not leaked.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub dials: AtomicUsize,
    pub refuse_connect: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing() -> Arc<Self> {
        let transport = Self::default();
        transport.refuse_connect.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> ssh::Result<()> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(ssh::Error::AuthenticationFailed);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dial(&self, remote_addr: &str) -> ssh::Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect(remote_addr)
            .await
            .map_err(|e| ssh::Error::Dial {
                addr: remote_addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> ssh::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}

/// A "remote" server that echoes every byte back on each connection.
pub async fn echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    (addr, task)
}

/// A "remote" server that accepts and immediately closes each connection.
pub async fn closing_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    (addr, task)
}

/// A "remote" server that writes `payload` to each connection, then closes it.
pub async fn sending_server(payload: Vec<u8>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = Arc::new(payload);
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let payload = Arc::clone(&payload);
            tokio::spawn(async move {
                let _ = stream.write_all(&payload).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, task)
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Deterministic payload spanning many copy buffers.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Read exactly `len` bytes or fail the test after `timeout`.
pub async fn read_exact_within(stream: &mut TcpStream, len: usize, timeout: Duration) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(timeout, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// A server that drops its first connection and holds every later one open
/// without answering. Returns the number of connections accepted so far.
pub async fn stalling_server() -> (SocketAddr, Arc<AtomicUsize>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                held.push(stream);
            }
        }
    });
    (addr, accepted, task)
}
