use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::{Handle, SignalCell, Signals};
use crate::status::Status;

/// One datagram on a [`Channel`]: a byte payload plus transferred endpoints.
pub struct ChannelMessage {
    pub data: Bytes,
    pub handles: Vec<Handle>,
}

impl ChannelMessage {
    pub fn from_bytes(data: Bytes) -> ChannelMessage {
        ChannelMessage {
            data,
            handles: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ChannelMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMessage")
            .field("data", &self.data)
            .field("handles", &self.handles.len())
            .finish()
    }
}

struct ChannelEnd {
    cell: Arc<SignalCell>,
    queue: Mutex<VecDeque<ChannelMessage>>,
    open: AtomicBool,
}

impl ChannelEnd {
    fn new() -> ChannelEnd {
        ChannelEnd {
            cell: SignalCell::new(Signals::WRITABLE),
            queue: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
        }
    }
}

struct ChannelShared {
    ends: [ChannelEnd; 2],
}

// Marks the endpoint closed when the last clone of one side goes away.
struct EndGuard {
    shared: Arc<ChannelShared>,
    side: usize,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.shared.ends[self.side].open.store(false, Ordering::SeqCst);
        let peer = &self.shared.ends[1 - self.side];
        peer.cell.update(Signals::WRITABLE, Signals::PEER_CLOSED);
    }
}

/// A bidirectional, unbounded message pipe.
///
/// Writes never block and never return `ShouldWait`; reads return `ShouldWait`
/// on an empty queue and `PeerClosed` once the queue is drained and the peer
/// endpoint is gone. Queued messages survive a peer close.
#[derive(Clone)]
pub struct Channel {
    side: usize,
    shared: Arc<ChannelShared>,
    _guard: Arc<EndGuard>,
}

impl Channel {
    pub fn pair() -> (Channel, Channel) {
        let shared = Arc::new(ChannelShared {
            ends: [ChannelEnd::new(), ChannelEnd::new()],
        });
        let mk = |side: usize| Channel {
            side,
            shared: shared.clone(),
            _guard: Arc::new(EndGuard {
                shared: shared.clone(),
                side,
            }),
        };
        (mk(0), mk(1))
    }

    pub fn write(&self, msg: ChannelMessage) -> Result<(), Status> {
        let peer = &self.shared.ends[1 - self.side];
        if !peer.open.load(Ordering::SeqCst) {
            return Err(Status::PeerClosed);
        }
        peer.queue.lock().unwrap().push_back(msg);
        peer.cell.update(Signals::empty(), Signals::READABLE);
        Ok(())
    }

    pub fn read(&self) -> Result<ChannelMessage, Status> {
        let own = &self.shared.ends[self.side];
        let mut queue = own.queue.lock().unwrap();
        match queue.pop_front() {
            Some(msg) => {
                let emptied = queue.is_empty();
                drop(queue);
                if emptied {
                    own.cell.update(Signals::READABLE, Signals::empty());
                }
                Ok(msg)
            }
            None => {
                if self.shared.ends[1 - self.side].open.load(Ordering::SeqCst) {
                    Err(Status::ShouldWait)
                } else {
                    Err(Status::PeerClosed)
                }
            }
        }
    }

    /// Assert or clear user signals on the peer endpoint.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let (a, b) = Channel::pair();
        a.write(ChannelMessage::from_bytes(Bytes::from_static(b"hi")))
            .unwrap();
        assert!(b.signals().contains(Signals::READABLE));
        let msg = b.read().unwrap();
        assert_eq!(&msg.data[..], b"hi");
        assert!(!b.signals().contains(Signals::READABLE));
        assert_eq!(b.read().unwrap_err(), Status::ShouldWait);
    }

    #[test]
    fn drop_asserts_peer_closed() {
        let (a, b) = Channel::pair();
        a.write(ChannelMessage::from_bytes(Bytes::from_static(b"last")))
            .unwrap();
        drop(a);
        assert!(b.signals().contains(Signals::PEER_CLOSED));
        // queued message still drains, then the close is reported
        assert_eq!(&b.read().unwrap().data[..], b"last");
        assert_eq!(b.read().unwrap_err(), Status::PeerClosed);
        assert_eq!(
            b.write(ChannelMessage::from_bytes(Bytes::new())).unwrap_err(),
            Status::PeerClosed
        );
    }

    #[test]
    fn clones_share_one_endpoint() {
        let (a, b) = Channel::pair();
        let a2 = a.clone();
        drop(a);
        // one clone still alive: not closed yet
        assert!(!b.signals().contains(Signals::PEER_CLOSED));
        drop(a2);
        assert!(b.signals().contains(Signals::PEER_CLOSED));
    }

    #[test]
    fn user_signals() {
        let (a, b) = Channel::pair();
        a.signal_peer(Signals::empty(), Signals::INCOMING).unwrap();
        assert!(b.signals().contains(Signals::INCOMING));
        a.signal_peer(Signals::INCOMING, Signals::empty()).unwrap();
        assert!(!b.signals().contains(Signals::INCOMING));
        // non-user bits are ignored
        a.signal_peer(Signals::empty(), Signals::READABLE).unwrap();
        assert!(!b.signals().contains(Signals::READABLE));
    }

    #[test]
    fn handles_transfer() {
        let (a, b) = Channel::pair();
        let (x, _y) = Channel::pair();
        a.write(ChannelMessage {
            data: Bytes::new(),
            handles: vec![Handle::Channel(x)],
        })
        .unwrap();
        let msg = b.read().unwrap();
        assert_eq!(msg.handles.len(), 1);
        assert!(msg.handles.into_iter().next().unwrap().into_channel().is_some());
    }
}
