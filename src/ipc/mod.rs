//! In-process IPC primitives.
//!
//! The multiplexer's client side talks to the dispatcher over these rather
//! than over host file descriptors: a [`Channel`] carries framed messages (and
//! handles), a [`StreamPipe`] carries a bounded byte stream with half-close,
//! and the dispatcher observes both through a cookie-keyed wait-set. Every
//! endpoint exposes a signal word ([`Signals`]) that is updated by its peer;
//! the user signals (`CONNECTED`, `INCOMING`, `OUTGOING`) are asserted
//! explicitly via `signal_peer`.

mod channel;
mod stream;
mod waitset;

pub use channel::{Channel, ChannelMessage};
pub use stream::StreamPipe;
pub(crate) use waitset::{WaitResult, WaitSet};

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::status::Status;
use waitset::WaitSetCore;

bitflags::bitflags! {
    /// Signal bits observable on an IPC endpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Signals: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const PEER_CLOSED = 1 << 2;
        /// The peer closed its write side; reads drain what is left.
        const HALF_CLOSED = 1 << 3;
        /// User signal: stream connection established.
        const CONNECTED = 1 << 4;
        /// User signal: a connection is waiting to be accepted.
        const INCOMING = 1 << 5;
        /// User signal: an outbound connect attempt has resolved.
        const OUTGOING = 1 << 6;
    }
}

impl Signals {
    pub const USER: Signals = Signals::CONNECTED
        .union(Signals::INCOMING)
        .union(Signals::OUTGOING);
}

/// The asserted-signal word of one endpoint, plus its wakeup plumbing.
///
/// `wait` services single-handle waits; attached wait-sets are poked on every
/// state change. Lock order is always endpoint state, then wait-set
/// generation; `update` drops the state lock before notifying.
pub(crate) struct SignalCell {
    state: Mutex<Signals>,
    cond: Condvar,
    watchers: Mutex<Vec<Weak<WaitSetCore>>>,
}

impl SignalCell {
    pub(crate) fn new(initial: Signals) -> Arc<SignalCell> {
        Arc::new(SignalCell {
            state: Mutex::new(initial),
            cond: Condvar::new(),
            watchers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn peek(&self) -> Signals {
        *self.state.lock().unwrap()
    }

    pub(crate) fn update(&self, clear: Signals, set: Signals) {
        {
            let mut st = self.state.lock().unwrap();
            let next = (*st - clear) | set;
            if next == *st {
                return;
            }
            *st = next;
        }
        self.cond.notify_all();
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|w| match w.upgrade() {
            Some(core) => {
                core.notify();
                true
            }
            None => false,
        });
    }

    /// Block until any signal in `mask` is asserted. Returns the full
    /// observed set, which may contain bits outside `mask`.
    pub(crate) fn wait(&self, mask: Signals, timeout: Option<Duration>) -> Result<Signals, Status> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.state.lock().unwrap();
        loop {
            if st.intersects(mask) {
                return Ok(*st);
            }
            match deadline {
                None => st = self.cond.wait(st).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Status::TimedOut);
                    }
                    let (guard, _) = self.cond.wait_timeout(st, deadline - now).unwrap();
                    st = guard;
                }
            }
        }
    }

    pub(crate) fn attach(&self, core: &Arc<WaitSetCore>) {
        self.watchers.lock().unwrap().push(Arc::downgrade(core));
    }

    pub(crate) fn detach(&self, core: &Arc<WaitSetCore>) {
        let mut watchers = self.watchers.lock().unwrap();
        if let Some(i) = watchers
            .iter()
            .position(|w| w.upgrade().is_some_and(|c| Arc::ptr_eq(&c, core)))
        {
            watchers.swap_remove(i);
        }
    }
}

/// A transferable endpoint, as carried in [`ChannelMessage`] handle slots.
pub enum Handle {
    Channel(Channel),
    Stream(StreamPipe),
}

impl Handle {
    pub fn into_channel(self) -> Option<Channel> {
        match self {
            Handle::Channel(c) => Some(c),
            Handle::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<StreamPipe> {
        match self {
            Handle::Stream(s) => Some(s),
            Handle::Channel(_) => None,
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handle::Channel(_) => f.write_str("Handle::Channel"),
            Handle::Stream(_) => f.write_str("Handle::Stream"),
        }
    }
}
