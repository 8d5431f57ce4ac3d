use std::io;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace};

use crate::events::InterruptTx;
use crate::iostate::{CookieKind, IoState, IosId};
use crate::ipc::{Channel, ChannelMessage, Signals, WaitSet};
use crate::status::Status;

/// Reserved cookie marking the watcher command channel in the wait-set.
pub(crate) const CTRL_COOKIE: u64 = u64::MAX;
/// Reserved cookie for the root request channel.
pub(crate) const ROOT_COOKIE: u64 = u64::MAX - 1;

const CMD_START: u8 = 1;
const CMD_ABORT: u8 = 2;

/// Update the watched-signal mask and the wait-set registration in one step,
/// keeping `ios.watching_signals` equal to what is actually registered.
fn signals_change(waitset: &WaitSet, id: IosId, ios: &mut IoState, new_sigs: Signals) {
    let old_sigs = ios.watching_signals;
    trace!("signals_change: ios={id:?} {old_sigs:?} -> {new_sigs:?}");
    if !old_sigs.is_empty() {
        waitset.remove(id.cookie(CookieKind::Data));
    }
    if !new_sigs.is_empty() {
        match ios.data.cell() {
            Some(cell) => waitset.add(id.cookie(CookieKind::Data), cell, new_sigs),
            None => {
                error!("signals_change: ios={id:?} has no data transport");
                ios.watching_signals = Signals::empty();
                return;
            }
        }
    }
    ios.watching_signals = new_sigs;
}

pub(crate) fn signals_set(waitset: &WaitSet, id: IosId, ios: &mut IoState, sigs: Signals) {
    if ios.watching_signals.contains(sigs) {
        return;
    }
    signals_change(waitset, id, ios, ios.watching_signals | sigs);
}

pub(crate) fn signals_clear(waitset: &WaitSet, id: IosId, ios: &mut IoState, sigs: Signals) {
    if (ios.watching_signals & sigs).is_empty() {
        return;
    }
    signals_change(waitset, id, ios, ios.watching_signals - sigs);
}

fn command(byte: u8) -> ChannelMessage {
    ChannelMessage::from_bytes(Bytes::copy_from_slice(&[byte]))
}

/// The secondary thread bridging IPC readiness into the dispatcher's poll.
///
/// The dispatcher sends START before blocking in poll and STOP right after;
/// in between, the watcher blocks in the wait-set. A non-control entry
/// becoming ready makes the watcher write one byte to the interrupt pipe
/// (unblocking the poll) and reply FOUND. Watcher failures are fatal: the
/// thread exits and the next command fails with `PeerClosed`.
pub(crate) struct Watcher {
    ctl: Option<Channel>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Watcher {
    pub(crate) fn spawn(
        waitset: WaitSet,
        interrupt: InterruptTx,
        max_results: usize,
    ) -> io::Result<Watcher> {
        let (watcher_end, dispatcher_end) = Channel::pair();
        waitset.add(
            CTRL_COOKIE,
            watcher_end.cell(),
            Signals::READABLE | Signals::PEER_CLOSED,
        );
        let thread = thread::Builder::new()
            .name("sockmux-watcher".to_string())
            .spawn(move || watcher_loop(watcher_end, waitset, interrupt, max_results))?;
        Ok(Watcher {
            ctl: Some(dispatcher_end),
            thread: Some(thread),
        })
    }

    fn ctl(&self) -> Result<&Channel, Status> {
        self.ctl.as_ref().ok_or(Status::BadState)
    }

    /// Send START; the watcher enters its blocking wait.
    pub(crate) fn start(&self) -> Result<(), Status> {
        trace!("watcher: send START");
        self.ctl()?.write(command(CMD_START))
    }

    /// Collect the round's result. If no reply is pending yet, abort the
    /// wait first. Returns whether any IPC handle was found ready.
    pub(crate) fn stop(&self) -> Result<bool, Status> {
        let ctl = self.ctl()?;
        let pending = match ctl.wait_signals(
            Signals::READABLE | Signals::PEER_CLOSED,
            Some(Duration::ZERO),
        ) {
            Ok(observed) if observed.contains(Signals::READABLE) => true,
            Ok(_) => return Err(Status::PeerClosed),
            Err(Status::TimedOut) => false,
            Err(e) => return Err(e),
        };
        if !pending {
            trace!("watcher: send ABORT");
            ctl.write(command(CMD_ABORT))?;
        }
        let observed = ctl.wait_signals(Signals::READABLE | Signals::PEER_CLOSED, None)?;
        if !observed.contains(Signals::READABLE) {
            return Err(Status::PeerClosed);
        }
        let reply = ctl.read()?;
        let found = reply.data.first().copied().unwrap_or(0) != 0;
        trace!("watcher: recv => {}", if found { "FOUND" } else { "NOT FOUND" });
        Ok(found)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        // closing the command channel lets the idle watcher exit
        self.ctl.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watcher_loop(ctl: Channel, waitset: WaitSet, interrupt: InterruptTx, max_results: usize) {
    debug!("watcher: start");
    let mut results = Vec::with_capacity(max_results);
    loop {
        // wait for START; a stale ABORT from the previous round is consumed
        let observed = match ctl.wait_signals(Signals::READABLE | Signals::PEER_CLOSED, None) {
            Ok(observed) => observed,
            Err(e) => {
                error!("watcher: control wait failed ({e})");
                return;
            }
        };
        if !observed.contains(Signals::READABLE) {
            debug!("watcher: control closed, exiting");
            return;
        }
        let cmd = match ctl.read() {
            Ok(msg) => msg.data.first().copied().unwrap_or(0),
            Err(e) => {
                error!("watcher: control read failed ({e})");
                return;
            }
        };
        if cmd == CMD_ABORT {
            trace!("watcher: stale ABORT");
            continue;
        }
        if cmd != CMD_START {
            error!("watcher: unknown command {cmd}");
            return;
        }

        waitset.wait(None, max_results, &mut results);
        let found = results
            .iter()
            .any(|r| r.cookie != CTRL_COOKIE && !r.observed.is_empty());
        trace!(
            "watcher: wait done, {} results, {}",
            results.len(),
            if found { "FOUND" } else { "NOT FOUND" }
        );
        if found {
            if let Err(e) = interrupt.trigger() {
                error!("watcher: interrupt failed ({e})");
                return;
            }
        }
        if let Err(e) = ctl.write(command(found as u8)) {
            error!("watcher: reply failed ({e})");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::interrupt_pipe;
    use crate::ipc::Channel;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn found_when_watched_handle_ready() {
        let waitset = WaitSet::new();
        let (tx, rx) = interrupt_pipe().unwrap();
        let watcher = Watcher::spawn(waitset.clone(), tx, 16).unwrap();

        let (a, b) = Channel::pair();
        waitset.add(1, b.cell(), Signals::READABLE);

        watcher.start().unwrap();
        a.write(ChannelMessage::from_bytes(Bytes::from_static(b"x")))
            .unwrap();
        assert!(watcher.stop().unwrap());

        // the interrupt pipe received a wakeup byte
        let mut fds = [libc::pollfd {
            fd: rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        assert_eq!(crate::events::poll(&mut fds).unwrap(), 1);
        rx.drain();
        waitset.remove(1);
    }

    #[test]
    fn abort_reports_not_found() {
        let waitset = WaitSet::new();
        let (tx, _rx) = interrupt_pipe().unwrap();
        let watcher = Watcher::spawn(waitset.clone(), tx, 16).unwrap();

        let (_a, b) = Channel::pair();
        waitset.add(2, b.cell(), Signals::READABLE);

        watcher.start().unwrap();
        // nothing is ready: stop() aborts the wait
        assert!(!watcher.stop().unwrap());

        // the handshake stays balanced for the next round
        watcher.start().unwrap();
        assert!(!watcher.stop().unwrap());
        waitset.remove(2);
    }

    #[test]
    fn watching_mask_matches_registration() {
        let waitset = WaitSet::new();
        let mut table = crate::iostate::IosTable::new();
        let id = table.alloc();
        let (local, _peer) = crate::ipc::StreamPipe::pair();
        let ios = table.get_mut(id).unwrap();
        ios.data = crate::iostate::DataTransport::Stream(local);
        let cookie = id.cookie(CookieKind::Data);

        signals_set(&waitset, id, ios, Signals::READABLE | Signals::PEER_CLOSED);
        assert_eq!(
            ios.watching_signals,
            Signals::READABLE | Signals::PEER_CLOSED
        );
        assert_eq!(waitset.watched(cookie), Some(ios.watching_signals));

        // nonempty -> nonempty re-registers with the widened mask
        signals_set(&waitset, id, ios, Signals::WRITABLE);
        assert_eq!(waitset.watched(cookie), Some(ios.watching_signals));

        signals_clear(&waitset, id, ios, Signals::READABLE | Signals::WRITABLE);
        assert_eq!(ios.watching_signals, Signals::PEER_CLOSED);
        assert_eq!(waitset.watched(cookie), Some(Signals::PEER_CLOSED));

        // nonempty -> empty removes the registration entirely
        signals_clear(&waitset, id, ios, Signals::PEER_CLOSED);
        assert_eq!(ios.watching_signals, Signals::empty());
        assert_eq!(waitset.watched(cookie), None);
    }

    #[test]
    fn drop_shuts_watcher_down() {
        let waitset = WaitSet::new();
        let (tx, _rx) = interrupt_pipe().unwrap();
        let watcher = Watcher::spawn(waitset, tx, 16).unwrap();
        drop(watcher); // joins without hanging
    }
}
