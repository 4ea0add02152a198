//! Edge-triggered receive multiplexer.
//!
//! A [`Reactor`] owns the incoming halves of any number of conversations. One
//! dedicated worker thread waits on a [`mio::Poll`] and, for every socket that
//! became readable, reads until the socket would block, handing each filled
//! buffer prefix to that socket's receive callback.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use std::sync::Arc;
//!
//! use transceiver::{Reactor, ReactorConfig};
//!
//! let reactor = Reactor::new(ReactorConfig::default())?;
//! reactor.start()?;
//!
//! let stream = TcpStream::connect("127.0.0.1:7687")?;
//! transceiver::socket::configure(&stream)?;
//! let stream = Arc::new(stream);
//!
//! reactor.attach(
//!     &stream,
//!     Box::new(|view: &[u8]| println!("received {} bytes", view.len())),
//!     Box::new(|| println!("peer finished")),
//!     None,
//! )?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::sync::with_lock;

mod client;
#[cfg(test)]
mod tests;

use client::{Client, Drain};
pub use client::{FinishCallback, ReceiveCallback};

// descriptors are never negative, so this cannot collide with a client token
const WAKE_TOKEN: Token = Token(usize::MAX);

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// When the worker leaves its loop of its own accord.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifetime {
    /// Runs until [`Reactor::stop`] is called.
    LongLived,
    /// Also exits as soon as no clients remain attached.
    SingleUse,
}

/// Handle to a receive multiplexer and its worker thread.
///
/// Handles are cheap to clone; all clones drive the same worker.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

struct Shared {
    id: usize,
    config: ReactorConfig,
    lifetime: Lifetime,
    registry: Registry,
    waker: Waker,
    clients: Mutex<HashMap<RawFd, Arc<Mutex<Client>>>>,
    // handed to the worker on start
    poll: Mutex<Option<Poll>>,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
    stopped: AtomicBool,
}

impl Reactor {
    /// Create a reactor whose worker runs until explicitly stopped.
    pub fn new(config: ReactorConfig) -> Result<Self> {
        Self::with_lifetime(config, Lifetime::LongLived)
    }

    /// Create a reactor whose worker exits once its last client detaches.
    ///
    /// Attach at least one client before calling [`start`](Self::start), or
    /// the worker exits immediately.
    pub fn single_use(config: ReactorConfig) -> Result<Self> {
        Self::with_lifetime(config, Lifetime::SingleUse)
    }

    fn with_lifetime(config: ReactorConfig, lifetime: Lifetime) -> Result<Self> {
        let poll = Poll::new().map_err(Error::Poll)?;
        let registry = poll.registry().try_clone().map_err(Error::Poll)?;
        let waker = Waker::new(&registry, WAKE_TOKEN).map_err(Error::Poll)?;
        Ok(Self {
            shared: Arc::new(Shared {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                config,
                lifetime,
                registry,
                waker,
                clients: Mutex::new(HashMap::new()),
                poll: Mutex::new(Some(poll)),
                worker: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<()> {
        let poll = with_lock("Reactor.poll", &self.shared.poll, |mut poll| poll.take())
            .ok_or(Error::AlreadyStarted)?;
        let name = self
            .shared
            .config
            .name
            .clone()
            .unwrap_or_else(|| format!("reactor-{}", self.shared.id));

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || shared.run(poll))
            .map_err(Error::Spawn)?;
        with_lock("Reactor.worker", &self.shared.worker, |mut worker| {
            *worker = Some(handle)
        });
        tracing::info!(reactor = self.shared.id, "started");
        Ok(())
    }

    /// Register `socket` for readable notifications.
    ///
    /// The reactor keeps only a weak reference and never closes the socket.
    /// Detach before releasing the last strong reference; an attachment
    /// whose socket has gone is dropped at its next notification.
    pub fn attach(
        &self,
        socket: &Arc<TcpStream>,
        on_receive: ReceiveCallback,
        on_finish: FinishCallback,
        buffer_size: Option<usize>,
    ) -> Result<()> {
        let fd = socket.as_raw_fd();
        let buffer_size = buffer_size
            .unwrap_or(self.shared.config.buffer_size)
            .max(1);
        let client = Client::new(Arc::downgrade(socket), buffer_size, on_receive, on_finish);

        with_lock("Reactor.clients", &self.shared.clients, |mut clients| {
            if clients.contains_key(&fd) {
                return Err(Error::AlreadyAttached(fd));
            }
            // registered while the map is locked so the worker never sees an
            // event for a descriptor it has no entry for
            self.shared
                .registry
                .register(&mut SourceFd(&fd), token(fd), Interest::READABLE)
                .map_err(Error::Poll)?;
            clients.insert(fd, Arc::new(Mutex::new(client)));
            Ok(())
        })?;

        tracing::debug!(reactor = self.shared.id, fd, buffer_size, "attached");
        Ok(())
    }

    /// Stop delivering data from `socket`. Calling this more than once, or
    /// for a socket that was never attached, is harmless.
    pub fn detach(&self, socket: &TcpStream) {
        // the peer may already have gone, which is fine
        let _ = socket.shutdown(Shutdown::Read);
        self.shared.remove(socket.as_raw_fd());
    }

    /// Ask the worker to exit. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!(reactor = self.shared.id, "stopping");
            self.shared.wake();
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Whether the worker thread has been started and has not yet exited.
    pub fn is_running(&self) -> bool {
        with_lock("Reactor.worker", &self.shared.worker, |worker| {
            worker.as_ref().is_some_and(|handle| !handle.is_finished())
        })
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        with_lock("Reactor.clients", &self.shared.clients, |clients| {
            clients.len()
        })
    }

    /// Wait for the worker thread to exit, returning the error that ended it,
    /// if any. Returns immediately if the worker was never started, was
    /// already joined, or if called from the worker itself.
    pub fn join(&self) -> Result<()> {
        let handle = with_lock("Reactor.worker", &self.shared.worker, |mut worker| {
            match worker.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => None,
                _ => worker.take(),
            }
        });
        match handle {
            Some(handle) => handle.join().map_err(|_| Error::WorkerPanicked)?,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.shared.id)
            .field("lifetime", &self.shared.lifetime)
            .field("clients", &self.client_count())
            .field("stopped", &self.stopped())
            .finish()
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

impl Shared {
    fn run(&self, mut poll: Poll) -> Result<()> {
        let mut events = Events::with_capacity(self.config.event_capacity.max(1));
        let timeout = self.config.poll_timeout();

        while !self.should_exit() {
            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(reactor = self.id, error = %e, "polling failed");
                return Err(Error::Poll(e));
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    Token(fd) => self.service(fd as RawFd),
                }
            }
        }

        tracing::info!(reactor = self.id, "stopped");
        Ok(())
    }

    fn should_exit(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
            || (self.lifetime == Lifetime::SingleUse
                && with_lock("Reactor.clients", &self.clients, |clients| {
                    clients.is_empty()
                }))
    }

    /// Drain one readable client. Callbacks run without the client map
    /// locked, so they are free to attach and detach.
    fn service(&self, fd: RawFd) {
        let Some(client) = with_lock("Reactor.clients", &self.clients, |clients| {
            clients.get(&fd).cloned()
        }) else {
            tracing::trace!(reactor = self.id, fd, "event for detached descriptor");
            return;
        };

        let on_finish = with_lock("Reactor.client", &client, |mut client| {
            match client.drain(fd) {
                Drain::Pending => None,
                Drain::Finished => client.take_finish(),
            }
        });

        // a callback that detached mid-drain has already abandoned the stream
        if let Some(on_finish) = on_finish {
            if self.remove_client(fd, &client) {
                on_finish();
            }
        }
    }

    /// Remove `fd` only if it still maps to `client`; a detach and re-attach
    /// from a callback may already have replaced it.
    fn remove_client(&self, fd: RawFd, client: &Arc<Mutex<Client>>) -> bool {
        let removed = with_lock("Reactor.clients", &self.clients, |mut clients| {
            match clients.get(&fd) {
                Some(current) if Arc::ptr_eq(current, client) => {
                    self.deregister(fd);
                    clients.remove(&fd)
                }
                _ => None,
            }
        });
        if removed.is_some() {
            tracing::debug!(reactor = self.id, fd, "detached at end of stream");
        }
        removed.is_some()
    }

    fn remove(&self, fd: RawFd) {
        let removed = with_lock("Reactor.clients", &self.clients, |mut clients| {
            let removed = clients.remove(&fd);
            if removed.is_some() {
                self.deregister(fd);
            }
            removed
        });
        if removed.is_some() {
            tracing::debug!(reactor = self.id, fd, "detached");
            // wake a single-use worker so it notices it has nothing left to do
            if self.lifetime == Lifetime::SingleUse {
                self.wake();
            }
        }
    }

    fn deregister(&self, fd: RawFd) {
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            tracing::debug!(reactor = self.id, fd, error = %e, "deregistering");
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!(reactor = self.id, error = %e, "waking worker");
        }
    }
}
