//! Outgoing half of a conversation.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};
use crate::socket::is_disconnect;
use crate::sync::with_lock;

/// Longest single wait for send buffer space before re-checking whether the
/// write half was stopped underneath us.
const WRITABLE_WAIT: Duration = Duration::from_millis(100);

/// A Transmitter handles the outgoing half of a network conversation.
///
/// Transmission is synchronous: [`transmit`](Self::transmit) blocks the
/// calling thread until every byte has been handed to the kernel. The socket
/// itself is non-blocking, so a full send buffer is waited out on a private
/// writability poller.
pub struct Transmitter {
    socket: Arc<TcpStream>,
    fd: RawFd,
    // doubles as the lock that keeps concurrent transmissions from interleaving
    writable: Mutex<Poll>,
    finished: AtomicBool,
}

impl Transmitter {
    pub fn new(socket: Arc<TcpStream>) -> Result<Self> {
        let fd = socket.as_raw_fd();
        let poll = Poll::new().map_err(Error::Poll)?;
        poll.registry()
            .register(&mut SourceFd(&fd), Token(0), Interest::WRITABLE)
            .map_err(Error::Poll)?;
        Ok(Self {
            socket,
            fd,
            writable: Mutex::new(poll),
            finished: AtomicBool::new(false),
        })
    }

    /// Send the concatenation of `chunks`, returning the number of bytes sent.
    #[tracing::instrument(skip(self, chunks), level = "trace", fields(fd = self.fd))]
    pub fn transmit<B>(&self, chunks: &[B]) -> Result<usize>
    where
        B: AsRef<[u8]>,
    {
        if self.is_finished() {
            return Err(Error::WriteStopped);
        }
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.as_ref()).copied().collect();
        tracing::trace!(fd = self.fd, data = %joined.escape_ascii(), "transmit");

        with_lock("Transmitter.writable", &self.writable, |mut poll| {
            self.send_all(&joined, &mut poll)
        })
    }

    fn send_all(&self, data: &[u8], poll: &mut Poll) -> Result<usize> {
        let mut events = Events::with_capacity(4);
        let mut sent = 0;
        while sent < data.len() {
            match (&*self.socket).write(&data[sent..]) {
                Ok(0) => {
                    return Err(self.failed(io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.is_finished() {
                        return Err(Error::WriteStopped);
                    }
                    match poll.poll(&mut events, Some(WRITABLE_WAIT)) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(Error::Poll(e)),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.failed(e)),
            }
        }
        Ok(sent)
    }

    fn failed(&self, error: io::Error) -> Error {
        tracing::error!(fd = self.fd, %error, "transmit failed");
        Error::Transmit(error)
    }

    /// Shut down the write half. Only the first call has any effect.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.socket.shutdown(Shutdown::Write) {
            Ok(()) => tracing::debug!(fd = self.fd, "write half shut down"),
            Err(e) if is_disconnect(&e) => {
                tracing::debug!(fd = self.fd, error = %e, "write half already disconnected")
            }
            Err(e) => tracing::error!(fd = self.fd, error = %e, "shutting down write half"),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmitter")
            .field("fd", &self.fd)
            .field("finished", &self.is_finished())
            .finish()
    }
}
