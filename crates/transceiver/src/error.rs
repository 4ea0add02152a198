//! Error types for the transceiver.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while setting up or driving a conversation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The address could not be resolved.
    #[error("resolving address: {0}")]
    Resolve(#[source] io::Error),

    /// The address resolved, but not to any IPv4 endpoint.
    #[error("no IPv4 address to connect to")]
    NoIpv4Address,

    /// Every connection attempt failed.
    #[error("connecting to {addresses:?} after {tries} attempt(s)")]
    Connect {
        /// The candidate addresses.
        addresses: Vec<SocketAddr>,
        /// How many attempts were made.
        tries: u64,
        /// The error from the final attempt.
        #[source]
        source: io::Error,
    },

    /// Setting a socket option failed.
    #[error("configuring socket: {0}")]
    Configure(#[source] io::Error),

    /// `transmit` was called after the write half was stopped.
    #[error("write half has been stopped")]
    WriteStopped,

    /// Sending bytes failed.
    #[error("transmitting: {0}")]
    Transmit(#[source] io::Error),

    /// Creating, registering or waiting on a poller failed.
    #[error("poller: {0}")]
    Poll(#[source] io::Error),

    /// The descriptor is already attached to this reactor.
    #[error("descriptor {0} is already attached")]
    AlreadyAttached(RawFd),

    /// `start` was called on a reactor whose worker has already been spawned.
    #[error("reactor has already been started")]
    AlreadyStarted,

    /// The reactor worker thread could not be spawned.
    #[error("spawning reactor worker: {0}")]
    Spawn(#[source] io::Error),

    /// The reactor worker thread panicked.
    #[error("reactor worker panicked")]
    WorkerPanicked,

    /// A fixed-length limiter was configured with a length of zero.
    #[error("fixed frame length must be greater than zero")]
    ZeroFrameLength,

    /// A delimiter limiter was configured with an empty delimiter.
    #[error("frame delimiter must not be empty")]
    EmptyDelimiter,
}
