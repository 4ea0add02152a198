//! TCP transceiver
//!
//! This crate turns a non-blocking TCP socket into a managed two-way
//! conversation whose halves can be shut down independently, and optionally
//! splits the incoming byte stream into frames.
//!
//! - [`Transmitter`] sends synchronously on the caller's thread.
//! - [`Reactor`] receives for any number of sockets on one worker thread,
//!   using edge-triggered readiness and draining each socket on every wakeup.
//! - [`Transceiver`] ties both halves to one socket and releases it exactly
//!   once, after both halves have stopped, however the shutdown is triggered.
//! - [`Protocol`] layers a [`FrameBuffer`] over a transceiver.
//!
//! The crate reports through [`tracing`] and never installs a subscriber.
pub mod config;
mod error;
pub mod framing;
pub mod protocol;
pub mod reactor;
pub mod socket;
mod sync;
mod transceiver;
pub mod transmitter;

pub use config::{DEFAULT_BUFFER_SIZE, ReactorConfig, TransceiverOptions};
pub use error::{Error, Result};
pub use framing::{Delimiter, FrameBuffer, Limiter};
pub use protocol::{FrameHandler, Protocol};
pub use reactor::Reactor;
pub use transceiver::{Handler, State, Transceiver};
pub use transmitter::Transmitter;
