#![allow(dead_code)]

use std::io::IsTerminal;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;
use transceiver::{FrameHandler, Handler};

pub const TIMEOUT: Duration = Duration::from_secs(5);

// test suite "constructor"
#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

/// A listening socket standing in for the remote end of a conversation.
pub struct Peer {
    listener: TcpListener,
}

impl Peer {
    pub fn bind() -> eyre::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").wrap_err("binding peer listener")?;
        Ok(Self { listener })
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("listener has an address")
    }

    pub fn accept(&self) -> eyre::Result<TcpStream> {
        let (stream, _) = self.listener.accept().wrap_err("accepting connection")?;
        Ok(stream)
    }
}

/// Everything a [`Recorder`] has been told, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Data(Vec<u8>),
    Frame(Bytes),
    Finished,
    Stopped,
    Closed,
}

/// Forwards every hook invocation to a channel and counts the lifecycle ones.
#[derive(Clone)]
pub struct Recorder {
    events: Sender<Event>,
    pub finishes: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn new() -> (Self, Receiver<Event>) {
        let (events, rx) = unbounded();
        let recorder = Self {
            events,
            finishes: Arc::default(),
            stops: Arc::default(),
            closes: Arc::default(),
        };
        (recorder, rx)
    }

    pub fn finishes(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

impl Handler for Recorder {
    fn on_receive(&self, view: &[u8]) {
        self.record(Event::Data(view.to_vec()));
    }

    fn on_finish(&self) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        self.record(Event::Finished);
    }

    fn on_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.record(Event::Stopped);
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.record(Event::Closed);
    }
}

impl FrameHandler for Recorder {
    fn on_data(&self, frame: Bytes) {
        self.record(Event::Frame(frame));
    }

    fn on_finish(&self) {
        Handler::on_finish(self)
    }

    fn on_stop(&self) {
        Handler::on_stop(self)
    }

    fn on_close(&self) {
        Handler::on_close(self)
    }
}

/// Concatenate received data until the peer finishes sending.
pub fn data_until_finished(events: &Receiver<Event>) -> eyre::Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        match events
            .recv_timeout(TIMEOUT)
            .wrap_err("waiting for data")?
        {
            Event::Data(chunk) => data.extend(chunk),
            Event::Finished => return Ok(data),
            other => eyre::bail!("unexpected event {other:?}"),
        }
    }
}

/// Next frame, skipping nothing.
pub fn next_frame(events: &Receiver<Event>) -> eyre::Result<Bytes> {
    match events
        .recv_timeout(TIMEOUT)
        .wrap_err("waiting for frame")?
    {
        Event::Frame(frame) => Ok(frame),
        other => eyre::bail!("expected a frame, got {other:?}"),
    }
}

pub fn wait_for(message: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > TIMEOUT {
            panic!("timeout waiting for {message}");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
