use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{SignalCell, Signals};
use crate::status::Status;

/// Bytes buffered per direction before writers see `ShouldWait`.
pub const STREAM_CAPACITY: usize = 256 * 1024;

struct PipeBuf {
    data: VecDeque<u8>,
    /// The writer feeding this buffer has half-closed; no more bytes arrive.
    writer_closed: bool,
}

struct StreamEnd {
    cell: Arc<SignalCell>,
    inbound: Mutex<PipeBuf>,
    open: AtomicBool,
}

impl StreamEnd {
    fn new() -> StreamEnd {
        StreamEnd {
            cell: SignalCell::new(Signals::WRITABLE),
            inbound: Mutex::new(PipeBuf {
                data: VecDeque::new(),
                writer_closed: false,
            }),
            open: AtomicBool::new(true),
        }
    }
}

struct StreamShared {
    ends: [StreamEnd; 2],
}

struct EndGuard {
    shared: Arc<StreamShared>,
    side: usize,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.shared.ends[self.side].open.store(false, Ordering::SeqCst);
        let peer = &self.shared.ends[1 - self.side];
        peer.cell.update(Signals::WRITABLE, Signals::PEER_CLOSED);
    }
}

/// A bounded, bidirectional byte pipe with half-close.
///
/// `write` transfers as much as fits and reports `ShouldWait` only when the
/// peer's buffer is completely full; `read` reports `ShouldWait` on empty.
/// `half_close` stops this end's writes and asserts `HALF_CLOSED` on the peer,
/// which keeps draining buffered bytes. A dropped endpoint asserts
/// `PEER_CLOSED` on its peer.
#[derive(Clone)]
pub struct StreamPipe {
    side: usize,
    shared: Arc<StreamShared>,
    _guard: Arc<EndGuard>,
}

impl StreamPipe {
    pub fn pair() -> (StreamPipe, StreamPipe) {
        let shared = Arc::new(StreamShared {
            ends: [StreamEnd::new(), StreamEnd::new()],
        });
        let mk = |side: usize| StreamPipe {
            side,
            shared: shared.clone(),
            _guard: Arc::new(EndGuard {
                shared: shared.clone(),
                side,
            }),
        };
        (mk(0), mk(1))
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, Status> {
        let own = &self.shared.ends[self.side];
        let peer = &self.shared.ends[1 - self.side];
        if !peer.open.load(Ordering::SeqCst) {
            return Err(Status::PeerClosed);
        }
        let mut inbound = peer.inbound.lock().unwrap();
        if inbound.writer_closed {
            // we already half-closed our write side
            return Err(Status::BadState);
        }
        let space = STREAM_CAPACITY - inbound.data.len();
        if space == 0 {
            drop(inbound);
            own.cell.update(Signals::WRITABLE, Signals::empty());
            return Err(Status::ShouldWait);
        }
        let n = space.min(buf.len());
        inbound.data.extend(&buf[..n]);
        let full = inbound.data.len() == STREAM_CAPACITY;
        drop(inbound);
        if n > 0 {
            peer.cell.update(Signals::empty(), Signals::READABLE);
        }
        if full {
            own.cell.update(Signals::WRITABLE, Signals::empty());
        }
        Ok(n)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Status> {
        let own = &self.shared.ends[self.side];
        let peer = &self.shared.ends[1 - self.side];
        let mut inbound = own.inbound.lock().unwrap();
        if inbound.data.is_empty() {
            if !peer.open.load(Ordering::SeqCst) {
                return Err(Status::PeerClosed);
            }
            // a half-closed peer is surfaced through HALF_CLOSED, not here
            return Err(Status::ShouldWait);
        }
        let n = inbound.data.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(inbound.data.drain(..n)) {
            *dst = src;
        }
        let empty = inbound.data.is_empty();
        drop(inbound);
        if empty {
            own.cell.update(Signals::READABLE, Signals::empty());
        }
        if peer.open.load(Ordering::SeqCst) {
            peer.cell.update(Signals::empty(), Signals::WRITABLE);
        }
        Ok(n)
    }

    /// Close this end's write side. Buffered bytes stay readable on the peer.
    pub fn half_close(&self) -> Result<(), Status> {
        let own = &self.shared.ends[self.side];
        let peer = &self.shared.ends[1 - self.side];
        if !peer.open.load(Ordering::SeqCst) {
            return Err(Status::PeerClosed);
        }
        peer.inbound.lock().unwrap().writer_closed = true;
        peer.cell.update(Signals::empty(), Signals::HALF_CLOSED);
        own.cell.update(Signals::WRITABLE, Signals::empty());
        Ok(())
    }

    pub fn signal_peer(&self, clear: Signals, set: Signals) -> Result<(), Status> {
        let peer = &self.shared.ends[1 - self.side];
        if !peer.open.load(Ordering::SeqCst) {
            return Err(Status::PeerClosed);
        }
        peer.cell.update(clear & Signals::USER, set & Signals::USER);
        Ok(())
    }

    pub fn signals(&self) -> Signals {
        self.shared.ends[self.side].cell.peek()
    }

    pub fn wait_signals(&self, mask: Signals, timeout: Option<Duration>) -> Result<Signals, Status> {
        self.shared.ends[self.side].cell.wait(mask, timeout)
    }

    pub(crate) fn cell(&self) -> &Arc<SignalCell> {
        &self.shared.ends[self.side].cell
    }
}
