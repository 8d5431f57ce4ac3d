use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::net::fd::Fd;

bitflags::bitflags! {
    /// Network readiness interest/delivery bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FdEvents: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXCEPT = 1 << 2;
    }
}

/// Per-fd bitmap of poll interests. An fd enters the poll set while any bit
/// is set; EXCEPT stays set for a socket's whole open lifetime.
pub(crate) struct FdEventTable {
    interests: HashMap<RawFd, FdEvents>,
}

impl FdEventTable {
    pub(crate) fn new() -> FdEventTable {
        FdEventTable {
            interests: HashMap::new(),
        }
    }

    pub(crate) fn set(&mut self, fd: RawFd, events: FdEvents) {
        *self.interests.entry(fd).or_insert(FdEvents::empty()) |= events;
    }

    pub(crate) fn clear(&mut self, fd: RawFd, events: FdEvents) {
        if let Some(mask) = self.interests.get_mut(&fd) {
            *mask -= events;
            if mask.is_empty() {
                self.interests.remove(&fd);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, fd: RawFd) -> FdEvents {
        self.interests.get(&fd).copied().unwrap_or(FdEvents::empty())
    }

    /// Build the poll set: every interested fd plus the interrupt pipe.
    pub(crate) fn pollfds(&self, interrupt_fd: RawFd) -> Vec<libc::pollfd> {
        let mut fds = Vec::with_capacity(self.interests.len() + 1);
        fds.push(libc::pollfd {
            fd: interrupt_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        for (&fd, &mask) in &self.interests {
            let mut events = 0;
            if mask.contains(FdEvents::READ) {
                events |= libc::POLLIN;
            }
            if mask.contains(FdEvents::WRITE) {
                events |= libc::POLLOUT;
            }
            if mask.contains(FdEvents::EXCEPT) {
                events |= libc::POLLPRI;
            }
            fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
        fds
    }
}

/// Map delivered poll bits back to event-table bits. Error and hangup are
/// surfaced as readability so the pending handler runs and observes the
/// failure from the socket itself.
pub(crate) fn events_of(revents: libc::c_short) -> FdEvents {
    let mut events = FdEvents::empty();
    if revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
        events |= FdEvents::READ;
    }
    if revents & (libc::POLLOUT | libc::POLLERR) != 0 {
        events |= FdEvents::WRITE;
    }
    if revents & libc::POLLPRI != 0 {
        events |= FdEvents::EXCEPT;
    }
    events
}

/// Level-triggered poll over the built set. EINTR reports as zero ready fds
/// so the caller keeps its start/stop handshake balanced.
pub(crate) fn poll(fds: &mut [libc::pollfd]) -> io::Result<usize> {
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(n as usize)
}

/// Write end of the interrupt pipe; owned by the watcher thread.
pub(crate) struct InterruptTx {
    fd: Fd,
}

impl InterruptTx {
    /// One byte per wakeup; the value is ignored and a full pipe is as good
    /// as a delivered byte.
    pub(crate) fn trigger(&self) -> io::Result<()> {
        match self.fd.write(&[1u8]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Read end of the interrupt pipe; polled by the dispatcher.
pub(crate) struct InterruptRx {
    fd: Fd,
}

impl InterruptRx {
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = self.fd.read(&mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }
}

impl AsRawFd for InterruptRx {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub(crate) fn interrupt_pipe() -> io::Result<(InterruptTx, InterruptRx)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let read_fd = Fd { inner: fds[0] };
    let write_fd = Fd { inner: fds[1] };
    read_fd.set_nonblocking(true)?;
    write_fd.set_nonblocking(true)?;
    Ok((InterruptTx { fd: write_fd }, InterruptRx { fd: read_fd }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bits_accumulate_and_clear() {
        let mut table = FdEventTable::new();
        table.set(5, FdEvents::EXCEPT);
        table.set(5, FdEvents::READ);
        assert_eq!(table.get(5), FdEvents::READ | FdEvents::EXCEPT);
        table.clear(5, FdEvents::READ);
        assert_eq!(table.get(5), FdEvents::EXCEPT);
        table.clear(5, FdEvents::all());
        assert_eq!(table.get(5), FdEvents::empty());
        // cleared fds leave the poll set entirely
        assert_eq!(table.pollfds(0).len(), 1);
    }

    #[test]
    fn pollfds_include_interrupt_first() {
        let mut table = FdEventTable::new();
        table.set(7, FdEvents::READ | FdEvents::WRITE);
        let fds = table.pollfds(42);
        assert_eq!(fds[0].fd, 42);
        assert_eq!(fds[0].events, libc::POLLIN);
        assert_eq!(fds[1].fd, 7);
        assert_eq!(fds[1].events, libc::POLLIN | libc::POLLOUT);
    }

    #[test]
    fn interrupt_pipe_wakes_and_drains() {
        let (tx, rx) = interrupt_pipe().unwrap();
        tx.trigger().unwrap();
        tx.trigger().unwrap();
        let mut fds = [libc::pollfd {
            fd: rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        assert_eq!(poll(&mut fds).unwrap(), 1);
        rx.drain();
        let n = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        assert_eq!(n, 0, "pipe should be drained");
    }

    #[test]
    fn revents_mapping() {
        assert_eq!(events_of(libc::POLLIN), FdEvents::READ);
        assert_eq!(events_of(libc::POLLOUT), FdEvents::WRITE);
        assert_eq!(
            events_of(libc::POLLERR),
            FdEvents::READ | FdEvents::WRITE
        );
        assert_eq!(events_of(libc::POLLPRI), FdEvents::EXCEPT);
    }
}
