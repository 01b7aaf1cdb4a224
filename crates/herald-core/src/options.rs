//! Engine options with documented defaults.
//!
//! Every field may be left at zero; [`HeraldOptions::normalized`] replaces
//! zero values with the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default write deadline per frame.
pub const DEFAULT_WRITE_WAIT_MS: u64 = 10_000;
/// Default read deadline, extended by every inbound frame.
pub const DEFAULT_PONG_WAIT_MS: u64 = 60_000;
/// Default capacity of outbound and subscriber queues.
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 4096;
/// Default delay between a close-session broadcast and the forced close.
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 3_000;
/// Default capacity of the hub and pub/sub command queues.
pub const DEFAULT_COMMAND_BUFFER_SIZE: usize = 256;

/// Tunables shared by the hub, the pub/sub actor and every session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldOptions {
    /// Milliseconds a single frame write may take.
    pub write_wait_ms: u64,
    /// Milliseconds without inbound traffic before the peer is dropped.
    pub pong_wait_ms: u64,
    /// Milliseconds between keep-alive pings (default: 9/10 of `pong_wait_ms`).
    pub ping_period_ms: u64,
    /// Capacity of each session's outbound queue and subscriber queue.
    pub channel_buffer_size: usize,
    /// Milliseconds between a close-session message and the forced close.
    pub close_grace_ms: u64,
    /// Capacity of the hub and pub/sub command queues.
    pub command_buffer_size: usize,
}

impl Default for HeraldOptions {
    fn default() -> Self {
        Self {
            write_wait_ms: DEFAULT_WRITE_WAIT_MS,
            pong_wait_ms: DEFAULT_PONG_WAIT_MS,
            ping_period_ms: DEFAULT_PONG_WAIT_MS * 9 / 10,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            command_buffer_size: DEFAULT_COMMAND_BUFFER_SIZE,
        }
    }
}

impl HeraldOptions {
    /// Replace every zero value with its default.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.write_wait_ms == 0 {
            self.write_wait_ms = DEFAULT_WRITE_WAIT_MS;
        }
        if self.pong_wait_ms == 0 {
            self.pong_wait_ms = DEFAULT_PONG_WAIT_MS;
        }
        if self.ping_period_ms == 0 {
            self.ping_period_ms = (self.pong_wait_ms * 9 / 10).max(1);
        }
        if self.channel_buffer_size == 0 {
            self.channel_buffer_size = DEFAULT_CHANNEL_BUFFER_SIZE;
        }
        if self.close_grace_ms == 0 {
            self.close_grace_ms = DEFAULT_CLOSE_GRACE_MS;
        }
        if self.command_buffer_size == 0 {
            self.command_buffer_size = DEFAULT_COMMAND_BUFFER_SIZE;
        }
        self
    }

    /// Write deadline.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// Read deadline.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Keep-alive period.
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    /// Forced-close grace period.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}
