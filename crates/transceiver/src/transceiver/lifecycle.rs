use std::sync::atomic::{AtomicU8, Ordering};

/// Where a conversation is in its shutdown.
///
/// ```text
///          stop_tx            stop_rx
///   Open ───────────▶ TxStopped ──────────▶ Closed
///     │                                       ▲
///     │   stop_rx                    stop_tx  │
///     └─────────────▶ RxStopped ──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Open = 0,
    TxStopped = TX,
    RxStopped = RX,
    Closed = TX | RX,
}

const TX: u8 = 0b01;
const RX: u8 = 0b10;

/// One direction of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Half {
    Tx,
    Rx,
}

impl Half {
    const fn bit(self) -> u8 {
        match self {
            Half::Tx => TX,
            Half::Rx => RX,
        }
    }
}

/// Result of marking a half as stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// The other half is still running.
    HalfStopped,
    /// This call stopped the last running half.
    BothStopped,
    /// This half had already been marked.
    Unchanged,
}

/// Atomically updated [`State`].
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(State::Open as u8))
    }

    pub(crate) fn state(&self) -> State {
        from_bits(self.0.load(Ordering::Acquire))
    }

    /// Move to the state with `half` stopped. Of any number of concurrent
    /// callers, exactly one observes [`Transition::BothStopped`].
    pub(crate) fn stop(&self, half: Half) -> Transition {
        let bit = half.bit();
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current & bit == 0).then_some(current | bit)
            }) {
            Err(_) => Transition::Unchanged,
            Ok(previous) if previous | bit == State::Closed as u8 => Transition::BothStopped,
            Ok(_) => Transition::HalfStopped,
        }
    }
}

fn from_bits(bits: u8) -> State {
    match bits & (TX | RX) {
        TX => State::TxStopped,
        RX => State::RxStopped,
        0 => State::Open,
        _ => State::Closed,
    }
}
