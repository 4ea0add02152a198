//! Tests for the reactor

use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};

use super::*;
use crate::socket;

const TIMEOUT: Duration = Duration::from_secs(5);

fn quick() -> ReactorConfig {
    ReactorConfig {
        poll_timeout_ms: 20,
        ..ReactorConfig::default()
    }
}

fn pair() -> (Arc<TcpStream>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = socket::connect(listener.local_addr().unwrap(), 0).unwrap();
    let (peer, _) = listener.accept().unwrap();
    (Arc::new(stream), peer)
}

#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Data(Vec<u8>),
    Finished,
}

fn recording(
    reactor: &Reactor,
    socket: &Arc<TcpStream>,
    buffer_size: Option<usize>,
) -> Receiver<Seen> {
    let (tx, rx) = unbounded();
    let finish_tx = tx.clone();
    reactor
        .attach(
            socket,
            Box::new(move |view: &[u8]| {
                let _ = tx.send(Seen::Data(view.to_vec()));
            }),
            Box::new(move || {
                let _ = finish_tx.send(Seen::Finished);
            }),
            buffer_size,
        )
        .unwrap();
    rx
}

fn collect_until_finished(rx: &Receiver<Seen>) -> Vec<u8> {
    let mut data = Vec::new();
    loop {
        match rx.recv_timeout(TIMEOUT).expect("reactor stalled") {
            Seen::Data(chunk) => data.extend(chunk),
            Seen::Finished => return data,
        }
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < TIMEOUT, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn drains_everything_through_a_small_buffer() {
    let reactor = Reactor::new(quick()).unwrap();
    reactor.start().unwrap();
    let (socket, mut peer) = pair();
    let rx = recording(&reactor, &socket, Some(16));

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    peer.write_all(&payload).unwrap();
    drop(peer);

    assert_eq!(collect_until_finished(&rx), payload);

    reactor.stop();
    reactor.join().unwrap();
}

#[test]
fn peer_close_finishes_once_and_removes_client() {
    let reactor = Reactor::new(quick()).unwrap();
    reactor.start().unwrap();
    let (socket, mut peer) = pair();
    let rx = recording(&reactor, &socket, None);
    assert_eq!(reactor.client_count(), 1);

    peer.write_all(b"bye").unwrap();
    drop(peer);

    assert_eq!(collect_until_finished(&rx), b"bye");
    assert_eq!(reactor.client_count(), 0);

    // several more poll cycles: nothing else may be reported
    match rx.recv_timeout(Duration::from_millis(200)) {
        Err(RecvTimeoutError::Timeout) => {}
        other => panic!("unexpected callback after finish: {other:?}"),
    }

    reactor.stop();
    reactor.join().unwrap();
}

#[test]
fn detach_is_idempotent() {
    let reactor = Reactor::new(quick()).unwrap();
    let (socket, _peer) = pair();
    let _rx = recording(&reactor, &socket, None);
    assert_eq!(reactor.client_count(), 1);

    reactor.detach(&socket);
    reactor.detach(&socket);
    assert_eq!(reactor.client_count(), 0);
}

#[test]
fn attaching_twice_is_rejected() {
    let reactor = Reactor::new(quick()).unwrap();
    let (socket, _peer) = pair();
    let _rx = recording(&reactor, &socket, None);

    let res = reactor.attach(&socket, Box::new(|_: &[u8]| {}), Box::new(|| {}), None);
    assert!(matches!(res, Err(Error::AlreadyAttached(fd)) if fd == socket.as_raw_fd()));
}

#[test]
fn starting_twice_is_rejected() {
    let reactor = Reactor::new(quick()).unwrap();
    reactor.start().unwrap();
    assert!(matches!(reactor.start(), Err(Error::AlreadyStarted)));
    reactor.stop();
    reactor.stop();
    assert!(reactor.stopped());
    reactor.join().unwrap();
    assert!(!reactor.is_running());
}

#[test]
fn single_use_reactor_exits_when_idle() {
    let reactor = Reactor::single_use(quick()).unwrap();
    let (socket, _peer) = pair();
    let _rx = recording(&reactor, &socket, None);
    reactor.start().unwrap();
    assert!(reactor.is_running());

    reactor.detach(&socket);
    reactor.join().unwrap();
    assert!(!reactor.stopped());
    assert!(!reactor.is_running());
}

#[test]
fn one_worker_serves_many_sockets() {
    let reactor = Reactor::new(quick()).unwrap();
    reactor.start().unwrap();

    let connections: Vec<_> = (0..8)
        .map(|_| {
            let (socket, peer) = pair();
            let rx = recording(&reactor, &socket, Some(64));
            (socket, peer, rx)
        })
        .collect();
    assert_eq!(reactor.client_count(), 8);

    for (i, (_, peer, _)) in connections.iter().enumerate() {
        let mut peer = peer;
        write!(peer, "connection {i}").unwrap();
        peer.shutdown(Shutdown::Write).unwrap();
    }

    for (i, (_, _, rx)) in connections.iter().enumerate() {
        assert_eq!(collect_until_finished(rx), format!("connection {i}").as_bytes());
    }
    wait_for(|| reactor.client_count() == 0);

    reactor.stop();
    reactor.join().unwrap();
}

#[test]
fn detaching_from_a_callback_suppresses_finish() {
    let reactor = Reactor::new(quick()).unwrap();
    reactor.start().unwrap();
    let (socket, mut peer) = pair();

    let finished = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(AtomicUsize::new(0));
    {
        let reactor2 = reactor.clone();
        let weak = Arc::downgrade(&socket);
        let received = Arc::clone(&received);
        let finished = Arc::clone(&finished);
        reactor
            .attach(
                &socket,
                Box::new(move |view: &[u8]| {
                    received.fetch_add(view.len(), Ordering::SeqCst);
                    if let Some(socket) = weak.upgrade() {
                        reactor2.detach(&socket);
                    }
                }),
                Box::new(move || {
                    finished.fetch_add(1, Ordering::SeqCst);
                }),
                None,
            )
            .unwrap();
    }

    peer.write_all(b"stop after this").unwrap();
    wait_for(|| received.load(Ordering::SeqCst) > 0);
    wait_for(|| reactor.client_count() == 0);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    reactor.stop();
    reactor.join().unwrap();
}

#[test]
fn released_socket_is_dropped_from_the_map() {
    let reactor = Reactor::new(quick()).unwrap();
    reactor.start().unwrap();
    let (socket, mut peer) = pair();
    let rx = recording(&reactor, &socket, None);

    // keep the descriptor open through a clone so only the reactor's weak
    // reference is invalidated
    let _keep = socket.try_clone().unwrap();
    drop(socket);
    peer.write_all(b"anyone there?").unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Seen::Finished);
    assert_eq!(reactor.client_count(), 0);

    reactor.stop();
    reactor.join().unwrap();
}
