use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{SignalCell, Signals};

struct WaitEntry {
    cookie: u64,
    cell: Arc<SignalCell>,
    signals: Signals,
}

pub(crate) struct WaitSetCore {
    entries: Mutex<Vec<WaitEntry>>,
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitSetCore {
    pub(crate) fn notify(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitResult {
    pub cookie: u64,
    pub observed: Signals,
}

/// Cookie-keyed blocking wait over many IPC endpoints, level-triggered.
///
/// An entry is ready while its cell's asserted signals intersect the
/// registered mask. `wait` with a zero timeout is a plain scan.
#[derive(Clone)]
pub(crate) struct WaitSet {
    core: Arc<WaitSetCore>,
}

impl WaitSet {
    pub(crate) fn new() -> WaitSet {
        WaitSet {
            core: Arc::new(WaitSetCore {
                entries: Mutex::new(Vec::new()),
                generation: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn add(&self, cookie: u64, cell: &Arc<SignalCell>, signals: Signals) {
        cell.attach(&self.core);
        self.core.entries.lock().unwrap().push(WaitEntry {
            cookie,
            cell: cell.clone(),
            signals,
        });
    }

    pub(crate) fn remove(&self, cookie: u64) {
        let entry = {
            let mut entries = self.core.entries.lock().unwrap();
            entries
                .iter()
                .position(|e| e.cookie == cookie)
                .map(|i| entries.swap_remove(i))
        };
        if let Some(entry) = entry {
            entry.cell.detach(&self.core);
        }
    }

    /// The mask currently registered for `cookie`, if any.
    pub(crate) fn watched(&self, cookie: u64) -> Option<Signals> {
        self.core
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.cookie == cookie)
            .map(|e| e.signals)
    }

    fn scan(&self, max_results: usize, out: &mut Vec<WaitResult>) {
        let entries = self.core.entries.lock().unwrap();
        for entry in entries.iter() {
            let observed = entry.cell.peek();
            if observed.intersects(entry.signals) {
                out.push(WaitResult {
                    cookie: entry.cookie,
                    observed,
                });
                if out.len() == max_results {
                    break;
                }
            }
        }
    }

    /// Collect ready entries, blocking until at least one is ready or the
    /// timeout expires. On timeout `out` is left empty.
    pub(crate) fn wait(
        &self,
        timeout: Option<Duration>,
        max_results: usize,
        out: &mut Vec<WaitResult>,
    ) {
        out.clear();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut generation = self.core.generation.lock().unwrap();
        loop {
            self.scan(max_results, out);
            if !out.is_empty() {
                return;
            }
            match deadline {
                None => generation = self.core.cond.wait(generation).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    let (guard, _) = self
                        .core
                        .cond
                        .wait_timeout(generation, deadline - now)
                        .unwrap();
                    generation = guard;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Channel;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn scan_reports_ready_entries() {
        let ws = WaitSet::new();
        let (a, b) = Channel::pair();
        ws.add(7, b.cell(), Signals::READABLE);
        let mut results = Vec::new();
        ws.wait(Some(Duration::ZERO), 16, &mut results);
        assert!(results.is_empty());
        a.write(crate::ipc::ChannelMessage::from_bytes(Bytes::from_static(b"x")))
            .unwrap();
        ws.wait(Some(Duration::ZERO), 16, &mut results);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cookie, 7);
        assert!(results[0].observed.contains(Signals::READABLE));
    }

    #[test]
    fn blocking_wait_wakes_on_signal() {
        let ws = WaitSet::new();
        let (a, b) = Channel::pair();
        ws.add(1, b.cell(), Signals::READABLE);
        let ws2 = ws.clone();
        let t = std::thread::spawn(move || {
            let mut results = Vec::new();
            ws2.wait(None, 16, &mut results);
            results
        });
        std::thread::sleep(Duration::from_millis(20));
        a.write(crate::ipc::ChannelMessage::from_bytes(Bytes::from_static(b"x")))
            .unwrap();
        let results = t.join().unwrap();
        assert_eq!(results[0].cookie, 1);
    }

    #[test]
    fn remove_stops_reporting() {
        let ws = WaitSet::new();
        let (a, b) = Channel::pair();
        ws.add(3, b.cell(), Signals::READABLE);
        a.write(crate::ipc::ChannelMessage::from_bytes(Bytes::from_static(b"x")))
            .unwrap();
        ws.remove(3);
        assert_eq!(ws.watched(3), None);
        let mut results = Vec::new();
        ws.wait(Some(Duration::ZERO), 16, &mut results);
        assert!(results.is_empty());
    }

    #[test]
    fn mask_is_respected() {
        let ws = WaitSet::new();
        let (a, b) = Channel::pair();
        ws.add(9, b.cell(), Signals::INCOMING);
        a.write(crate::ipc::ChannelMessage::from_bytes(Bytes::from_static(b"x")))
            .unwrap();
        let mut results = Vec::new();
        ws.wait(Some(Duration::ZERO), 16, &mut results);
        assert!(results.is_empty(), "READABLE alone must not satisfy INCOMING");
        a.signal_peer(Signals::empty(), Signals::INCOMING).unwrap();
        ws.wait(Some(Duration::ZERO), 16, &mut results);
        assert_eq!(results.len(), 1);
        assert!(results[0].observed.contains(Signals::INCOMING | Signals::READABLE));
    }
}
