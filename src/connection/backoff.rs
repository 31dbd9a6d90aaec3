use std::time::Duration;

/// The longest we ever wait between two connection attempts, in milliseconds.
pub const MAX_RECONNECT_WAIT_MS: u64 = 30_000;

/// Retry timing for connection attempts.
///
/// The wait starts at zero and grows on every failure: `1, 2` milliseconds for the first two
/// retries, then it is squared (`4, 16, 256, ...`) until it hits the 30 seconds ceiling,
/// where it stays. A successful connection resets it to zero.
///
/// ```rust
/// use carrot_tether::connection::Backoff;
///
/// let mut backoff = Backoff::default();
/// let waits: Vec<u128> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
/// assert_eq!(waits, [1, 2, 4, 16, 256, 30_000, 30_000]);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    wait_ms: u64,
}

impl Backoff {
    /// The delay computed by the last call to [`Backoff::next_delay`].
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    /// Register a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.wait_ms = if self.wait_ms >= MAX_RECONNECT_WAIT_MS {
            self.wait_ms
        } else if self.wait_ms < 2 {
            self.wait_ms + 1
        } else {
            self.wait_ms
                .saturating_mul(self.wait_ms)
                .min(MAX_RECONNECT_WAIT_MS)
        };
        self.current()
    }

    pub fn reset(&mut self) {
        self.wait_ms = 0;
    }
}
