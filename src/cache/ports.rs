// ABOUTME: Local port allocation for on-demand bastion tunnels.
// ABOUTME: Ports are claimed atomically from a fixed range and released on close.

use crate::config::PortRange;
use parking_lot::Mutex;

/// A fixed range of local ports with claim/release bookkeeping.
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    claimed: Vec<bool>,
    /// Where the next scan starts, so recently released ports rest a while.
    cursor: usize,
}

impl PortPool {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            state: Mutex::new(PoolState {
                claimed: vec![false; range.len()],
                cursor: 0,
            }),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Claim the next free port, or `None` when every port is taken.
    pub fn claim(&self) -> Option<u16> {
        let mut state = self.state.lock();
        let len = state.claimed.len();
        let start = state.cursor;

        let offset = (0..len)
            .map(|i| (start + i) % len)
            .find(|&slot| !state.claimed[slot])?;

        state.claimed[offset] = true;
        state.cursor = (offset + 1) % len;
        // offset < range.len(), which itself fits in u16
        Some(self.range.start + offset as u16)
    }

    /// Return a port to the pool. Ports outside the range are ignored.
    pub fn release(&self, port: u16) {
        if port < self.range.start || port >= self.range.end {
            return;
        }
        let slot = usize::from(port - self.range.start);
        self.state.lock().claimed[slot] = false;
    }

    /// Number of unclaimed ports.
    pub fn available(&self) -> usize {
        self.state.lock().claimed.iter().filter(|c| !**c).count()
    }
}
