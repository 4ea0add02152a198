//! Two-way conversations over one socket.
//!
//! A [`Transceiver`] blends a [`Transmitter`] for the outgoing half with a
//! [`Reactor`] attachment for the incoming half, and owns the socket
//! underneath both. Either half can be stopped on its own; the socket is
//! released once both are.

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use crate::config::TransceiverOptions;
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::socket::{self, is_disconnect};
use crate::sync::{OperationGuard, with_lock};
use crate::transmitter::Transmitter;

mod lifecycle;

use lifecycle::{Half, Lifecycle, Transition};
pub use lifecycle::State;

/// Hooks into a conversation. Every method defaults to doing nothing.
///
/// `on_receive` and `on_finish` run on the reactor's worker thread. A
/// reactor may serve many conversations, so these must not block.
pub trait Handler: Send + Sync + 'static {
    /// Bytes arrived. `view` is only valid for the duration of the call.
    fn on_receive(&self, view: &[u8]) {
        let _ = view;
    }

    /// The peer has finished sending. The read half is stopped right after.
    fn on_finish(&self) {}

    /// The read half is about to stop.
    fn on_stop(&self) {}

    /// The socket has been released.
    fn on_close(&self) {}
}

/// A handler that ignores everything, for send-only conversations.
impl Handler for () {}

/// Handle to one conversation.
///
/// Clones refer to the same conversation; it is closed when the last clone is
/// dropped, if not before.
#[derive(Clone)]
pub struct Transceiver {
    inner: Arc<Inner>,
}

/// Where the read half is attached.
enum Attachment<'a> {
    /// A fresh reactor serving only this conversation.
    Private,
    /// A reactor supplied by the caller.
    Shared(&'a Reactor),
}

struct Inner {
    fd: RawFd,
    peer: Option<SocketAddr>,
    handler: Arc<dyn Handler>,
    socket: Mutex<Option<Arc<TcpStream>>>,
    transmitter: Mutex<Option<Arc<Transmitter>>>,
    reactor: Mutex<Option<Reactor>>,
    lifecycle: Lifecycle,
    stopping_tx: OperationGuard,
    stopping_rx: OperationGuard,
    closing: OperationGuard,
}

impl Transceiver {
    /// Connect to `address` and receive on a reactor of this conversation's
    /// own.
    pub fn connect<A, H>(address: A, handler: H, options: &TransceiverOptions) -> Result<Self>
    where
        A: ToSocketAddrs,
        H: Handler,
    {
        let stream = socket::connect(address, options.connect_retries)?;
        Self::establish(stream, Arc::new(handler), Attachment::Private, options)
    }

    /// Connect to `address` and receive on `reactor`, which may serve other
    /// conversations too.
    pub fn connect_shared<A, H>(
        address: A,
        handler: H,
        reactor: &Reactor,
        options: &TransceiverOptions,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        H: Handler,
    {
        let stream = socket::connect(address, options.connect_retries)?;
        Self::establish(stream, Arc::new(handler), Attachment::Shared(reactor), options)
    }

    /// Take over an already connected stream, such as one returned by
    /// [`TcpListener::accept`](std::net::TcpListener::accept).
    ///
    /// Without a `reactor` a private one is created.
    pub fn from_stream<H>(
        stream: TcpStream,
        handler: H,
        reactor: Option<&Reactor>,
        options: &TransceiverOptions,
    ) -> Result<Self>
    where
        H: Handler,
    {
        socket::configure(&stream)?;
        let attachment = reactor.map_or(Attachment::Private, Attachment::Shared);
        Self::establish(stream, Arc::new(handler), attachment, options)
    }

    fn establish(
        stream: TcpStream,
        handler: Arc<dyn Handler>,
        attachment: Attachment<'_>,
        options: &TransceiverOptions,
    ) -> Result<Self> {
        let fd = stream.as_raw_fd();
        let peer = stream.peer_addr().ok();
        let socket = Arc::new(stream);
        tracing::info!(fd, ?peer, "connected");

        let transmitter = Transmitter::new(Arc::clone(&socket))?;
        let (reactor, private) = match attachment {
            Attachment::Private => (Reactor::single_use(options.reactor.clone())?, true),
            Attachment::Shared(reactor) => (reactor.clone(), false),
        };

        let inner = Arc::new(Inner {
            fd,
            peer,
            handler,
            socket: Mutex::new(Some(Arc::clone(&socket))),
            transmitter: Mutex::new(Some(Arc::new(transmitter))),
            reactor: Mutex::new(Some(reactor.clone())),
            lifecycle: Lifecycle::new(),
            stopping_tx: OperationGuard::new("stop_tx"),
            stopping_rx: OperationGuard::new("stop_rx"),
            closing: OperationGuard::new("close"),
        });

        let on_receive = {
            let handler = Arc::clone(&inner.handler);
            Box::new(move |view: &[u8]| handler.on_receive(view))
        };
        let on_finish = {
            let inner: Weak<Inner> = Arc::downgrade(&inner);
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.handler.on_finish();
                    inner.stop_rx();
                }
            })
        };
        reactor.attach(&socket, on_receive, on_finish, options.rx_buffer_size)?;
        if private {
            reactor.start()?;
        }

        Ok(Self { inner })
    }

    /// Send the concatenation of `chunks`, blocking until it has all been
    /// handed to the kernel.
    pub fn transmit<B>(&self, chunks: &[B]) -> Result<usize>
    where
        B: AsRef<[u8]>,
    {
        // cloned out so a blocked send does not hold up stop_tx
        let transmitter = with_lock("Transceiver.transmitter", &self.inner.transmitter, |tx| {
            tx.clone()
        })
        .ok_or(Error::WriteStopped)?;
        transmitter.transmit(chunks)
    }

    /// Stop the outgoing half. Idempotent.
    pub fn stop_tx(&self) {
        self.inner.stop_tx()
    }

    /// Stop the incoming half. Idempotent.
    pub fn stop_rx(&self) {
        self.inner.stop_rx()
    }

    /// Stop both halves and release the socket. Idempotent.
    ///
    /// If another thread is already closing, this waits for it to finish.
    pub fn close(&self) {
        self.inner.close()
    }

    /// Which halves have stopped so far.
    pub fn state(&self) -> State {
        self.inner.lifecycle.state()
    }

    /// Descriptor of the socket, kept for logging after release.
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// Remote address, if known when the conversation was established.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }
}

impl fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transceiver #{}", self.inner.fd)
    }
}

impl Inner {
    fn stop_tx(&self) {
        let Some(entered) = self.stopping_tx.enter() else {
            return;
        };
        let Some(transmitter) =
            with_lock("Transceiver.transmitter", &self.transmitter, |mut tx| {
                tx.take()
            })
        else {
            return;
        };

        tracing::info!(fd = self.fd, "write half stopped");
        transmitter.finish();
        drop(transmitter);

        let transition = self.lifecycle.stop(Half::Tx);
        drop(entered);
        if transition == Transition::BothStopped {
            self.close();
        }
    }

    fn stop_rx(&self) {
        let Some(entered) = self.stopping_rx.enter() else {
            return;
        };
        let Some(reactor) = with_lock("Transceiver.reactor", &self.reactor, |mut reactor| {
            reactor.take()
        }) else {
            return;
        };

        // the half is stopped whatever the hook does; a panic is re-raised
        // once the stop is complete
        let hook = panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_stop()));
        if hook.is_err() {
            tracing::error!(fd = self.fd, "on_stop panicked");
        }
        tracing::info!(fd = self.fd, "read half stopped");
        if let Some(socket) = self.socket() {
            match socket.shutdown(Shutdown::Read) {
                Ok(()) => {}
                Err(e) if is_disconnect(&e) => {
                    tracing::debug!(fd = self.fd, error = %e, "read half already disconnected")
                }
                Err(e) => tracing::error!(fd = self.fd, error = %e, "shutting down read half"),
            }
            reactor.detach(&socket);
        }
        drop(reactor);

        let transition = self.lifecycle.stop(Half::Rx);
        drop(entered);
        if transition == Transition::BothStopped {
            self.close();
        }
        if let Err(payload) = hook {
            panic::resume_unwind(payload);
        }
    }

    fn close(&self) {
        let Some(entered) = self.closing.enter() else {
            return;
        };
        self.stop_tx();
        self.stop_rx();

        // a stop_rx further up this thread's stack may still be running, in
        // which case it closes again once it has finished
        if self.lifecycle.state() != State::Closed {
            return;
        }
        if let Some(socket) = with_lock("Transceiver.socket", &self.socket, |mut s| s.take()) {
            drop(socket);
            tracing::info!(fd = self.fd, "closed");
            self.handler.on_close();
        }
    }

    fn socket(&self) -> Option<Arc<TcpStream>> {
        with_lock("Transceiver.socket", &self.socket, |socket| socket.clone())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}
