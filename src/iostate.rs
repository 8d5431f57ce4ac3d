use std::os::unix::io::RawFd;

use crate::buffer::{BufferPool, RwBuf};
use crate::ipc::{Channel, Signals, StreamPipe};
use crate::net::socket;
use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleType {
    None,
    Stream,
    Dgram,
}

/// The IPC transport carrying application bytes for one logical socket.
#[derive(Clone)]
pub(crate) enum DataTransport {
    None,
    Stream(StreamPipe),
    Dgram(Channel),
}

impl DataTransport {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, DataTransport::None)
    }

    pub(crate) fn signal_peer(&self, clear: Signals, set: Signals) -> Result<(), Status> {
        match self {
            DataTransport::None => Err(Status::BadHandle),
            DataTransport::Stream(s) => s.signal_peer(clear, set),
            DataTransport::Dgram(c) => c.signal_peer(clear, set),
        }
    }

    pub(crate) fn cell(&self) -> Option<&std::sync::Arc<crate::ipc::SignalCell>> {
        match self {
            DataTransport::None => None,
            DataTransport::Stream(s) => Some(s.cell()),
            DataTransport::Dgram(c) => Some(c.cell()),
        }
    }
}

/// Per-logical-socket bookkeeping record. Mutated only by the dispatcher.
pub(crate) struct IoState {
    pub handle_type: HandleType,
    /// Host socket fd, or -1 once closed.
    pub sockfd: RawFd,
    /// Server end of this socket's request channel.
    pub rio: Option<Channel>,
    pub data: DataTransport,
    /// Exactly the mask registered in the wait-set for the data transport.
    pub watching_signals: Signals,

    pub rbuf: Option<RwBuf>,
    pub rlen: usize,
    pub roff: usize,
    pub wbuf: Option<RwBuf>,
    pub wlen: usize,
    pub woff: usize,

    pub read_net_read: u64,
    pub read_socket_write: u64,
    pub write_socket_read: u64,
    pub write_net_write: u64,

    pub last_errno: i32,
    refcount: u32,
}

impl Drop for IoState {
    fn drop(&mut self) {
        if self.sockfd >= 0 {
            socket::close(self.sockfd);
        }
    }
}

impl IoState {
    fn new() -> IoState {
        IoState {
            handle_type: HandleType::None,
            sockfd: -1,
            rio: None,
            data: DataTransport::None,
            watching_signals: Signals::empty(),
            rbuf: None,
            rlen: 0,
            roff: 0,
            wbuf: None,
            wlen: 0,
            woff: 0,
            read_net_read: 0,
            read_socket_write: 0,
            write_socket_read: 0,
            write_net_write: 0,
            last_errno: 0,
            refcount: 1,
        }
    }
}

const REQUEST_TAG: u64 = 1 << 63;
const GEN_MASK: u32 = 0x7fff_ffff;

/// Which of an iostate's two IPC handles a wait-set cookie names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CookieKind {
    Data,
    Request,
}

/// Generational arena index, doubling as the wait-set cookie payload. A
/// freed slot bumps its generation so stale cookies no longer resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct IosId {
    slot: u32,
    generation: u32,
}

impl IosId {
    pub(crate) fn cookie(self, kind: CookieKind) -> u64 {
        let base = (self.slot as u64) | ((self.generation as u64) << 32);
        match kind {
            CookieKind::Data => base,
            CookieKind::Request => base | REQUEST_TAG,
        }
    }

    pub(crate) fn from_cookie(cookie: u64) -> (IosId, CookieKind) {
        let kind = if cookie & REQUEST_TAG != 0 {
            CookieKind::Request
        } else {
            CookieKind::Data
        };
        let cookie = cookie & !REQUEST_TAG;
        (
            IosId {
                slot: cookie as u32,
                generation: (cookie >> 32) as u32,
            },
            kind,
        )
    }
}

struct Slot {
    generation: u32,
    state: Option<IoState>,
}

/// Arena of live iostates.
pub(crate) struct IosTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl IosTable {
    pub(crate) fn new() -> IosTable {
        IosTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self) -> IosId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].state = Some(IoState::new());
                IosId {
                    slot,
                    generation: self.slots[slot as usize].generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    state: Some(IoState::new()),
                });
                IosId {
                    slot,
                    generation: 0,
                }
            }
        }
    }

    pub(crate) fn get(&self, id: IosId) -> Option<&IoState> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.state.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: IosId) -> Option<&mut IoState> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.state.as_mut()
    }

    pub(crate) fn acquire(&mut self, id: IosId) {
        if let Some(ios) = self.get_mut(id) {
            ios.refcount += 1;
        }
    }

    /// Drop one reference; on the last one, close whatever is still open and
    /// free the slot. Returns true when the iostate was destroyed.
    pub(crate) fn release(&mut self, id: IosId, pool: &mut BufferPool) -> bool {
        let Some(ios) = self.get_mut(id) else {
            return false;
        };
        ios.refcount -= 1;
        if ios.refcount > 0 {
            return false;
        }
        let slot = &mut self.slots[id.slot as usize];
        let Some(mut ios) = slot.state.take() else {
            return false;
        };
        slot.generation = (slot.generation + 1) & GEN_MASK;
        self.free.push(id.slot);
        if let Some(buf) = ios.rbuf.take() {
            pool.release(buf);
        }
        if let Some(buf) = ios.wbuf.take() {
            pool.release(buf);
        }
        // dropping the record closes any still-open host fd
        true
    }

    pub(crate) fn live_ids(&self) -> Vec<IosId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state.is_some())
            .map(|(i, s)| IosId {
                slot: i as u32,
                generation: s.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_round_trip() {
        let id = IosId {
            slot: 42,
            generation: 7,
        };
        for kind in [CookieKind::Data, CookieKind::Request] {
            let (back, k) = IosId::from_cookie(id.cookie(kind));
            assert_eq!(back, id);
            assert_eq!(k, kind);
        }
        assert_ne!(id.cookie(CookieKind::Data), id.cookie(CookieKind::Request));
    }

    #[test]
    fn stale_id_does_not_resolve() {
        let mut table = IosTable::new();
        let mut pool = BufferPool::new(0);
        let id = table.alloc();
        assert!(table.get(id).is_some());
        assert!(table.release(id, &mut pool));
        assert!(table.get(id).is_none());
        // the slot is reused with a new generation
        let id2 = table.alloc();
        assert!(table.get(id).is_none());
        assert!(table.get(id2).is_some());
    }

    #[test]
    fn refcount_delays_destruction() {
        let mut table = IosTable::new();
        let mut pool = BufferPool::new(0);
        let id = table.alloc();
        table.acquire(id);
        assert!(!table.release(id, &mut pool));
        assert!(table.get(id).is_some());
        assert!(table.release(id, &mut pool));
        assert!(table.get(id).is_none());
    }

    #[test]
    fn release_returns_buffers() {
        let mut table = IosTable::new();
        let mut pool = BufferPool::new(0);
        let id = table.alloc();
        table.get_mut(id).unwrap().rbuf = Some(pool.acquire());
        table.get_mut(id).unwrap().wbuf = Some(pool.acquire());
        assert_eq!(pool.free_count(), 0);
        assert!(table.release(id, &mut pool));
        assert_eq!(pool.free_count(), 2);
    }
}
