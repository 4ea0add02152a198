//! Splitting a byte stream into frames.
//!
//! A [`FrameBuffer`] accumulates received bytes and hands back complete frames
//! according to its [`Limiter`]. It holds nothing but bytes that have not yet
//! been delivered as part of a frame.

use std::fmt;
use std::num::NonZeroUsize;

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;

use crate::error::{Error, Result};

/// A non-empty byte sequence that separates frames.
#[derive(Clone, PartialEq, Eq)]
pub struct Delimiter(Bytes);

impl Delimiter {
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::EmptyDelimiter);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Delimiter({:?})", self.0)
    }
}

/// Where one frame ends and the next begins.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "LimiterConfig")]
pub enum Limiter {
    /// Everything received so far is one frame.
    #[default]
    DeliverAll,
    /// Frames are exactly this many bytes long.
    FixedLength(NonZeroUsize),
    /// Frames are terminated by this sequence, which is not part of the frame.
    Delimiter(Delimiter),
}

impl Limiter {
    pub fn fixed_length(length: usize) -> Result<Self> {
        NonZeroUsize::new(length)
            .map(Limiter::FixedLength)
            .ok_or(Error::ZeroFrameLength)
    }

    pub fn delimiter(bytes: impl Into<Bytes>) -> Result<Self> {
        Delimiter::new(bytes).map(Limiter::Delimiter)
    }
}

/// Serialised form of a [`Limiter`]:
/// `"deliver_all"`, `{ "fixed_length": 5 }` or `{ "delimiter": "\r\n" }`.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum LimiterConfig {
    DeliverAll,
    FixedLength(usize),
    Delimiter(String),
}

impl TryFrom<LimiterConfig> for Limiter {
    type Error = Error;

    fn try_from(config: LimiterConfig) -> Result<Self> {
        match config {
            LimiterConfig::DeliverAll => Ok(Limiter::DeliverAll),
            LimiterConfig::FixedLength(length) => Limiter::fixed_length(length),
            LimiterConfig::Delimiter(delimiter) => Limiter::delimiter(delimiter),
        }
    }
}

/// Accumulates a byte stream and extracts frames from its front.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
    limiter: Limiter,
    // bytes already searched for the delimiter without a match
    scanned: usize,
}

impl FrameBuffer {
    pub fn new(limiter: Limiter) -> Self {
        Self {
            buffer: BytesMut::new(),
            limiter,
            scanned: 0,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Remove and return the next complete frame, if there is one.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        match &self.limiter {
            Limiter::DeliverAll => {
                self.scanned = 0;
                Some(self.buffer.split().freeze())
            }
            Limiter::FixedLength(length) => {
                let length = length.get();
                (self.buffer.len() >= length).then(|| self.buffer.split_to(length).freeze())
            }
            Limiter::Delimiter(delimiter) => {
                let delimiter = delimiter.as_bytes();
                // a match may straddle the previously scanned region
                let from = self.scanned.saturating_sub(delimiter.len() - 1);
                match find(&self.buffer[from..], delimiter) {
                    Some(offset) => {
                        let end = from + offset;
                        let frame = self.buffer.split_to(end).freeze();
                        self.buffer.advance(delimiter.len());
                        self.scanned = 0;
                        Some(frame)
                    }
                    None => {
                        self.scanned = self.buffer.len();
                        None
                    }
                }
            }
        }
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// Switch policy. Buffered bytes are kept and framed under the new policy.
    pub fn set_limiter(&mut self, limiter: Limiter) {
        self.limiter = limiter;
        self.scanned = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
