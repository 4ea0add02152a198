//! Socket creation.
//!
//! Every conversation runs over an IPv4 TCP stream with Nagle's algorithm
//! disabled, switched to non-blocking mode before it is handed to a reactor.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use retry::{delay::Exponential, retry};

use crate::error::{Error, Result};

/// Connect to the first reachable IPv4 address that `address` resolves to.
///
/// `retries` extra attempts are made with exponential backoff starting at
/// 200ms.
pub fn connect<A>(address: A, retries: usize) -> Result<TcpStream>
where
    A: ToSocketAddrs,
{
    let addresses = ipv4_addresses(address)?;

    let stream = retry(Exponential::from_millis(200).take(retries), || {
        tracing::debug!(?addresses, "trying to make connection");
        match TcpStream::connect(addresses.as_slice()) {
            Ok(stream) => {
                tracing::debug!("connection made");
                Ok(stream)
            }
            Err(e) => {
                tracing::debug!(error = %e, "error making connection");
                Err(e)
            }
        }
    })
    .map_err(|e| Error::Connect {
        addresses: addresses.clone(),
        tries: e.tries,
        source: e.error,
    })?;

    configure(&stream)?;
    Ok(stream)
}

/// Apply the options every attached stream needs.
pub fn configure(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true).map_err(Error::Configure)?;
    stream.set_nonblocking(true).map_err(Error::Configure)?;
    Ok(())
}

fn ipv4_addresses<A>(address: A) -> Result<Vec<SocketAddr>>
where
    A: ToSocketAddrs,
{
    let addresses: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(Error::Resolve)?
        .filter(SocketAddr::is_ipv4)
        .collect();
    if addresses.is_empty() {
        return Err(Error::NoIpv4Address);
    }
    Ok(addresses)
}

/// Errors a shutdown or read can report once the peer, or another thread,
/// has already torn the connection down.
pub(crate) fn is_disconnect(error: &io::Error) -> bool {
    // EBADF is 9 on Linux, macOS and the BSDs
    const EBADF: i32 = 9;

    matches!(
        error.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    ) || error.raw_os_error() == Some(EBADF)
}
