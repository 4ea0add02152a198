use std::io::{self, Read};
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::sync::Weak;

use crate::socket::is_disconnect;

/// Called with a view over the bytes just read.
///
/// The slice borrows the client's receive buffer, which is overwritten by the
/// next read: copy anything that must outlive the call.
pub type ReceiveCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Called once when the peer has finished sending.
pub type FinishCallback = Box<dyn FnOnce() + Send>;

/// Outcome of draining one readiness notification.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Drain {
    /// The socket would block; wait for the next notification.
    Pending,
    /// End of stream, an unrecoverable read error, or the socket is gone.
    Finished,
}

pub(crate) struct Client {
    socket: Weak<TcpStream>,
    buffer: Box<[u8]>,
    on_receive: ReceiveCallback,
    on_finish: Option<FinishCallback>,
}

impl Client {
    pub(crate) fn new(
        socket: Weak<TcpStream>,
        buffer_size: usize,
        on_receive: ReceiveCallback,
        on_finish: FinishCallback,
    ) -> Self {
        Self {
            socket,
            buffer: vec![0; buffer_size].into_boxed_slice(),
            on_receive,
            on_finish: Some(on_finish),
        }
    }

    /// Read until the socket would block.
    ///
    /// Readiness is edge-triggered, so stopping early would leave bytes in the
    /// kernel that no later notification announces.
    pub(crate) fn drain(&mut self, fd: RawFd) -> Drain {
        let Some(socket) = self.socket.upgrade() else {
            tracing::debug!(fd, "socket released while attached");
            return Drain::Finished;
        };
        let Self {
            buffer, on_receive, ..
        } = self;

        loop {
            match (&*socket).read(buffer) {
                Ok(0) => {
                    tracing::debug!(fd, "end of stream");
                    return Drain::Finished;
                }
                Ok(n) => {
                    let view = &buffer[..n];
                    tracing::trace!(fd, data = %view.escape_ascii(), "receive");
                    on_receive(view);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Drain::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_disconnect(&e) => {
                    tracing::debug!(fd, error = %e, "disconnected while reading");
                    return Drain::Finished;
                }
                Err(e) => {
                    tracing::error!(fd, error = %e, "reading from socket");
                    return Drain::Finished;
                }
            }
        }
    }

    pub(crate) fn take_finish(&mut self) -> Option<FinishCallback> {
        self.on_finish.take()
    }
}
