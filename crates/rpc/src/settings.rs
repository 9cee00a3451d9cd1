//! Runtime settings shared by servers and session agents.

use std::time::Duration;

use eloquent_wire::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};

/// Default heartbeat period in milliseconds.
pub const DEFAULT_HEARTBEAT_MS: u64 = 1000;

/// Default number of missed heartbeats tolerated before a session is terminated.
pub const DEFAULT_MAX_HEARTBEAT_LOST: u32 = 5;

/// Default timeout for a single send or receive.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for a [`Server`](crate::Server) or [`SessionAgent`](crate::SessionAgent).
///
/// Deserializes from a map with every field optional; durations are in milliseconds:
///
/// ```json
/// { "heartbeat_ms": 250, "max_heartbeat_lost": 3, "receive_timeout": 5000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Heartbeat period in milliseconds; `0` disables heartbeats and liveness checks.
    pub heartbeat_ms: u64,
    /// Missed heartbeats tolerated before the server drops a session.
    pub max_heartbeat_lost: u32,
    /// Timeout for writing a message.
    #[serde(with = "millis")]
    pub send_timeout: Duration,
    /// Timeout for waiting on a reply.
    #[serde(with = "millis")]
    pub receive_timeout: Duration,
    /// Largest frame accepted off a stream.
    pub max_frame_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            max_heartbeat_lost: DEFAULT_MAX_HEARTBEAT_LOST,
            send_timeout: DEFAULT_IO_TIMEOUT,
            receive_timeout: DEFAULT_IO_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Settings {
    /// Heartbeat period, or `None` when heartbeats are disabled.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Option<Duration> {
        if self.heartbeat_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.heartbeat_ms))
        }
    }

    /// Set the heartbeat period in milliseconds.
    #[must_use]
    pub const fn with_heartbeat_ms(mut self, heartbeat_ms: u64) -> Self {
        self.heartbeat_ms = heartbeat_ms;
        self
    }

    /// Set how many heartbeats may be missed.
    #[must_use]
    pub const fn with_max_heartbeat_lost(mut self, max_heartbeat_lost: u32) -> Self {
        self.max_heartbeat_lost = max_heartbeat_lost;
        self
    }

    /// Set the send timeout.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the receive timeout.
    #[must_use]
    pub const fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
