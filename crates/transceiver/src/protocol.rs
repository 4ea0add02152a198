//! Framed conversations.
//!
//! A [`Protocol`] applies structure to a [`Transceiver`]: received bytes are
//! collected in a [`FrameBuffer`] and delivered frame by frame to a
//! [`FrameHandler`].
//!
//! ```no_run
//! use bytes::Bytes;
//! use transceiver::{FrameHandler, Limiter, Protocol, TransceiverOptions};
//!
//! struct Lines;
//!
//! impl FrameHandler for Lines {
//!     fn on_data(&self, frame: Bytes) {
//!         println!("{}", String::from_utf8_lossy(&frame));
//!     }
//! }
//!
//! let protocol = Protocol::connect(
//!     "127.0.0.1:7000",
//!     Limiter::delimiter("\r\n")?,
//!     Lines,
//!     &TransceiverOptions::default(),
//! )?;
//! protocol.transmit(&[b"HELLO\r\n"])?;
//! # Ok::<(), transceiver::Error>(())
//! ```

use std::net::{TcpStream, ToSocketAddrs};
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::config::TransceiverOptions;
use crate::error::Result;
use crate::framing::{FrameBuffer, Limiter};
use crate::reactor::Reactor;
use crate::sync::with_lock;
use crate::transceiver::{Handler, Transceiver};

/// Receives the frames of a [`Protocol`].
///
/// Every method runs on the reactor's worker thread except `on_stop` and
/// `on_close`, which run wherever the conversation is stopped. None of them
/// may block.
pub trait FrameHandler: Send + Sync + 'static {
    /// One complete frame, delimiter excluded.
    fn on_data(&self, frame: Bytes);

    /// The peer has finished sending. Bytes of an incomplete frame stay
    /// buffered.
    fn on_finish(&self) {}

    /// The read half is about to stop.
    fn on_stop(&self) {}

    /// The socket has been released.
    fn on_close(&self) {}
}

/// A [`Transceiver`] whose received bytes are split into frames.
///
/// Dereferences to the underlying [`Transceiver`] for transmission and
/// shutdown.
#[derive(Clone)]
pub struct Protocol {
    transceiver: Transceiver,
    frames: Arc<Mutex<FrameBuffer>>,
}

struct Framed<H> {
    frames: Arc<Mutex<FrameBuffer>>,
    handler: H,
}

impl Protocol {
    pub fn connect<A, H>(
        address: A,
        limiter: Limiter,
        handler: H,
        options: &TransceiverOptions,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        H: FrameHandler,
    {
        let (framed, frames) = Framed::new(limiter, handler);
        let transceiver = Transceiver::connect(address, framed, options)?;
        Ok(Self {
            transceiver,
            frames,
        })
    }

    pub fn connect_shared<A, H>(
        address: A,
        limiter: Limiter,
        handler: H,
        reactor: &Reactor,
        options: &TransceiverOptions,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        H: FrameHandler,
    {
        let (framed, frames) = Framed::new(limiter, handler);
        let transceiver = Transceiver::connect_shared(address, framed, reactor, options)?;
        Ok(Self {
            transceiver,
            frames,
        })
    }

    pub fn from_stream<H>(
        stream: TcpStream,
        limiter: Limiter,
        handler: H,
        reactor: Option<&Reactor>,
        options: &TransceiverOptions,
    ) -> Result<Self>
    where
        H: FrameHandler,
    {
        let (framed, frames) = Framed::new(limiter, handler);
        let transceiver = Transceiver::from_stream(stream, framed, reactor, options)?;
        Ok(Self {
            transceiver,
            frames,
        })
    }

    /// Change how frames are delimited, from the next frame boundary on.
    pub fn set_limiter(&self, limiter: Limiter) {
        with_lock("Protocol.frames", &self.frames, |mut frames| {
            frames.set_limiter(limiter)
        });
    }

    pub fn limiter(&self) -> Limiter {
        with_lock("Protocol.frames", &self.frames, |frames| {
            frames.limiter().clone()
        })
    }

    /// Number of received bytes not yet delivered as part of a frame.
    pub fn buffered(&self) -> usize {
        with_lock("Protocol.frames", &self.frames, |frames| {
            frames.pending().len()
        })
    }
}

impl Deref for Protocol {
    type Target = Transceiver;

    fn deref(&self) -> &Self::Target {
        &self.transceiver
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("transceiver", &self.transceiver)
            .field("limiter", &self.limiter())
            .finish()
    }
}

impl<H> Framed<H>
where
    H: FrameHandler,
{
    fn new(limiter: Limiter, handler: H) -> (Self, Arc<Mutex<FrameBuffer>>) {
        let frames = Arc::new(Mutex::new(FrameBuffer::new(limiter)));
        let framed = Self {
            frames: Arc::clone(&frames),
            handler,
        };
        (framed, frames)
    }
}

impl<H> Handler for Framed<H>
where
    H: FrameHandler,
{
    fn on_receive(&self, view: &[u8]) {
        with_lock("Framed.frames", &self.frames, |mut frames| frames.extend(view));
        // the lock is dropped between frames so on_data may change the limiter
        while let Some(frame) =
            with_lock("Framed.frames", &self.frames, |mut frames| frames.next_frame())
        {
            self.handler.on_data(frame);
        }
    }

    fn on_finish(&self) {
        self.handler.on_finish()
    }

    fn on_stop(&self) {
        self.handler.on_stop()
    }

    fn on_close(&self) {
        self.handler.on_close()
    }
}
