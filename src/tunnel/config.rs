// ABOUTME: Tunnel configuration: endpoints plus accept and drain timing.

use std::time::Duration;

/// Shortest accept deadline; anything lower turns the accept loop into a spin.
const MIN_ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local address to listen on; port 0 picks a free port.
    pub local_addr: String,
    /// `host:port` dialed from the far end of the transport.
    pub remote_addr: String,
    /// Accept deadline after which the loop rechecks for shutdown.
    pub accept_poll_interval: Duration,
    /// How long `stop` waits for open connections before closing them.
    pub drain_timeout: Duration,
    /// Consecutive accept failures before the tunnel is marked failed.
    pub max_accept_failures: u32,
    /// Buffered events per subscriber.
    pub event_capacity: usize,
}

impl TunnelConfig {
    pub fn new(local_addr: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
            accept_poll_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
            max_accept_failures: 5,
            event_capacity: 64,
        }
    }

    pub fn accept_poll_interval(mut self, interval: Duration) -> Self {
        self.accept_poll_interval = interval.max(MIN_ACCEPT_POLL_INTERVAL);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn max_accept_failures(mut self, failures: u32) -> Self {
        self.max_accept_failures = failures.max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Bring values set directly on the fields into their valid ranges.
    pub(crate) fn normalized(mut self) -> Self {
        self.accept_poll_interval = self.accept_poll_interval.max(MIN_ACCEPT_POLL_INTERVAL);
        self.max_accept_failures = self.max_accept_failures.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self
    }
}
