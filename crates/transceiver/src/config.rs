//! Configuration for reactors and transceivers.
//!
//! Both structs deserialise with every field optional, so a host
//! application can embed them in its own configuration file:
//!
//! ```
//! use transceiver::TransceiverOptions;
//!
//! let options: TransceiverOptions = serde_json::from_str(
//!     r#"{ "rx_buffer_size": 4096, "reactor": { "poll_timeout_ms": 250 } }"#,
//! )?;
//! assert_eq!(options.rx_buffer_size, Some(4096));
//! # Ok::<(), serde_json::Error>(())
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Receive buffer capacity used when none is requested.
pub const DEFAULT_BUFFER_SIZE: usize = 524_288;

/// Settings for a [`Reactor`](crate::Reactor).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReactorConfig {
    /// Capacity of each client's receive buffer unless overridden on attach.
    pub buffer_size: usize,
    /// Upper bound on one poll wait, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Readiness events collected per poll.
    pub event_capacity: usize,
    /// Worker thread name.
    pub name: Option<String>,
}

impl ReactorConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_timeout_ms: 1000,
            event_capacity: 1024,
            name: None,
        }
    }
}

/// Settings for a [`Transceiver`](crate::Transceiver) connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransceiverOptions {
    /// Receive buffer capacity for this connection.
    pub rx_buffer_size: Option<usize>,
    /// Extra connection attempts, with exponential backoff from 200ms.
    pub connect_retries: usize,
    /// Configuration of the private reactor, when one is created.
    pub reactor: ReactorConfig,
}
