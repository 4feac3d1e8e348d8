//! Run-wide query policy

use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRIES: u32 = 1;
pub const DEFAULT_MAX_SOCKETS: usize = 256;
/// Largest UDP payload we accept in one datagram
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65_535;

/// Timeouts and limits shared by every server in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPolicy {
    /// How long one attempt waits for a complete answer
    pub timeout: Duration,
    /// Re-sends after the first attempt times out
    pub retries: u32,
    /// Upper bound on sockets open at the same time
    pub max_sockets: usize,
    pub recv_buffer_size: usize,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            max_sockets: DEFAULT_MAX_SOCKETS,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

impl QueryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Zero is treated as one; a run always needs a socket
    pub fn with_max_sockets(mut self, max_sockets: usize) -> Self {
        self.max_sockets = max_sockets.max(1);
        self
    }

    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    /// Sends per phase, first attempt included
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}
