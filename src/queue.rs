use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;

use crate::request::Request;

/// Per-fd FIFO of deferred requests. One instance per readiness domain
/// (network fds, IPC data handles); envelopes for one fd leave in the order
/// they were put.
pub(crate) struct WaitQueue {
    queues: HashMap<RawFd, VecDeque<Request>>,
}

impl WaitQueue {
    pub(crate) fn new() -> WaitQueue {
        WaitQueue {
            queues: HashMap::new(),
        }
    }

    pub(crate) fn put(&mut self, fd: RawFd, rq: Request) {
        self.queues.entry(fd).or_default().push_back(rq);
    }

    pub(crate) fn get(&mut self, fd: RawFd) -> Option<Request> {
        let queue = self.queues.get_mut(&fd)?;
        let rq = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&fd);
        }
        rq
    }

    /// Atomically take the whole list for `fd`, leaving it empty. Callers
    /// either run every envelope (drain) or free them (discard on close).
    pub(crate) fn swap(&mut self, fd: RawFd) -> VecDeque<Request> {
        self.queues.remove(&fd).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self, fd: RawFd) -> usize {
        self.queues.get(&fd).map_or(0, |q| q.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OpCode;

    fn rq(op: OpCode) -> Request {
        Request {
            op,
            msg: None,
            ios: None,
        }
    }

    #[test]
    fn fifo_order_per_fd() {
        let mut q = WaitQueue::new();
        q.put(3, rq(OpCode::Read));
        q.put(3, rq(OpCode::Write));
        q.put(3, rq(OpCode::SigConnR));
        q.put(4, rq(OpCode::Close));
        assert_eq!(q.get(3).unwrap().op, OpCode::Read);
        assert_eq!(q.get(3).unwrap().op, OpCode::Write);
        assert_eq!(q.get(3).unwrap().op, OpCode::SigConnR);
        assert!(q.get(3).is_none());
        assert_eq!(q.get(4).unwrap().op, OpCode::Close);
    }

    #[test]
    fn swap_takes_everything() {
        let mut q = WaitQueue::new();
        q.put(5, rq(OpCode::Read));
        q.put(5, rq(OpCode::Write));
        let drained = q.swap(5);
        assert_eq!(
            drained.iter().map(|r| r.op).collect::<Vec<_>>(),
            vec![OpCode::Read, OpCode::Write]
        );
        assert_eq!(q.len(5), 0);
        assert!(q.get(5).is_none());
    }

    #[test]
    fn swap_on_empty_fd() {
        let mut q = WaitQueue::new();
        assert!(q.swap(9).is_empty());
    }
}
