use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;
use std::time::Duration;

use log::{debug, error, trace};

use crate::buffer::BufferPool;
use crate::events::{self, FdEventTable, FdEvents, InterruptRx};
use crate::iostate::{CookieKind, IosId, IosTable};
use crate::ipc::{Channel, Signals, WaitResult, WaitSet};
use crate::net::config::{HostNetConfig, NetConfig};
use crate::proto::{Message, CHUNK_SIZE, MAX_HANDLES};
use crate::queue::WaitQueue;
use crate::request::{OpCode, Request};
use crate::status::Status;
use crate::watcher::{self, Watcher, CTRL_COOKIE, ROOT_COOKIE};

/// What a handler did with its request.
pub(crate) enum Disposition {
    /// Completed with the given result; the dispatcher replies if the op does.
    Done(Result<(), Status>),
    /// Park the envelope until the host fd signals readiness.
    PendingNet,
    /// Park the envelope until the data transport signals readiness.
    PendingSocket,
}

/// Multiplexer tuning knobs.
pub struct Config {
    pub(crate) prewarm_buffers: usize,
    pub(crate) max_wait_results: usize,
    pub(crate) netcfg: Option<Box<dyn NetConfig>>,
}

impl Config {
    pub fn new() -> Config {
        Config {
            prewarm_buffers: 0,
            max_wait_results: 256,
            netcfg: None,
        }
    }

    /// Pre-populate the scratch buffer pool.
    pub fn prewarm_buffers(mut self, count: usize) -> Config {
        self.prewarm_buffers = count;
        self
    }

    /// Upper bound on wait-set results collected per drain.
    pub fn max_wait_results(mut self, count: usize) -> Config {
        self.max_wait_results = count.max(2);
        self
    }

    /// Replace the network-configuration backend.
    pub fn netcfg(mut self, netcfg: Box<dyn NetConfig>) -> Config {
        self.netcfg = Some(netcfg);
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

/// All dispatcher-owned mutable state, passed to handlers by reference.
pub(crate) struct Ctx {
    pub(crate) ios: IosTable,
    pub(crate) pool: BufferPool,
    pub(crate) wait_net: WaitQueue,
    pub(crate) wait_socket: WaitQueue,
    pub(crate) fd_events: FdEventTable,
    pub(crate) waitset: WaitSet,
    pub(crate) netcfg: Box<dyn NetConfig>,
    pub(crate) root: Channel,
}

impl Ctx {
    pub(crate) fn signals_set(&mut self, id: IosId, sigs: Signals) {
        let waitset = self.waitset.clone();
        if let Some(ios) = self.ios.get_mut(id) {
            watcher::signals_set(&waitset, id, ios, sigs);
        }
    }

    pub(crate) fn signals_clear(&mut self, id: IosId, sigs: Signals) {
        let waitset = self.waitset.clone();
        if let Some(ios) = self.ios.get_mut(id) {
            watcher::signals_clear(&waitset, id, ios, sigs);
        }
    }

    pub(crate) fn sockfd(&self, id: IosId) -> Option<RawFd> {
        self.ios.get(id).map(|i| i.sockfd).filter(|&fd| fd >= 0)
    }

    pub(crate) fn set_last_errno(&mut self, id: IosId, errno: i32) {
        if let Some(ios) = self.ios.get_mut(id) {
            ios.last_errno = errno;
        }
    }

    pub(crate) fn release_ios(&mut self, id: IosId) {
        if self.ios.release(id, &mut self.pool) {
            trace!("ios={id:?} destroyed");
        }
    }

    pub(crate) fn free_request(&mut self, rq: Request) {
        if let Some(id) = rq.ios {
            self.release_ios(id);
        }
    }

    /// Schedule an internal request against a live iostate and run it now.
    pub(crate) fn synthesize(&mut self, op: OpCode, id: IosId, signals: Signals) {
        if self.ios.get(id).is_none() {
            return;
        }
        debug!("synthesize: op={op:?} ios={id:?}");
        self.ios.acquire(id);
        self.handle_request(Request::internal(op, id), FdEvents::empty(), signals);
    }

    /// Decode-level entry: wrap a wire message into an envelope and run it.
    pub(crate) fn dispatch_wire(&mut self, msg: Message, ios: Option<IosId>) {
        let op = match OpCode::from_u32(msg.op) {
            Some(op) if !op.is_internal() && op != OpCode::Status => op,
            _ => {
                error!("dispatch: unknown or internal op {} on the wire", msg.op);
                self.reply_invalid(msg, ios);
                return;
            }
        };
        if let Some(id) = ios {
            self.ios.acquire(id);
        }
        self.handle_request(Request::wire(op, msg, ios), FdEvents::empty(), Signals::empty());
    }

    fn reply_invalid(&mut self, msg: Message, ios: Option<IosId>) {
        let mut rq = Request {
            op: OpCode::Status,
            msg: Some(msg),
            ios,
        };
        self.send_status(&mut rq, Status::InvalidArgs.code());
    }

    /// Invoke the op handler and park, reply, or free per its disposition.
    pub(crate) fn handle_request(&mut self, mut rq: Request, events: FdEvents, signals: Signals) {
        trace!(
            "handle_request: op={:?} ios={:?} events={events:?} signals={signals:?}",
            rq.op,
            rq.ios
        );
        let disposition = match rq.op {
            OpCode::Open => self.do_open(&mut rq),
            OpCode::Close => self.do_close(&mut rq),
            OpCode::Read => self.do_read(&mut rq),
            OpCode::Write => self.do_write(&mut rq, signals),
            OpCode::Connect => self.do_connect(&mut rq),
            OpCode::Bind => self.do_bind(&mut rq),
            OpCode::Listen => self.do_listen(&mut rq),
            OpCode::Ioctl => self.do_ioctl(&mut rq),
            OpCode::GetAddrInfo => self.do_getaddrinfo(&mut rq),
            OpCode::GetSockName => self.do_getsockname(&mut rq),
            OpCode::GetPeerName => self.do_getpeername(&mut rq),
            OpCode::GetSockOpt => self.do_getsockopt(&mut rq),
            OpCode::SetSockOpt => self.do_setsockopt(&mut rq),
            OpCode::HalfClose => self.do_halfclose(&mut rq),
            OpCode::SigConnR => self.do_sigconn_r(&mut rq),
            OpCode::SigConnW => self.do_sigconn_w(&mut rq),
            OpCode::Status => Disposition::Done(Err(Status::InvalidArgs)),
        };
        match disposition {
            Disposition::PendingNet => {
                trace!("pending on net: op={:?}", rq.op);
                match rq.ios.and_then(|id| self.sockfd(id)) {
                    Some(fd) => self.wait_net.put(fd, rq),
                    None => self.free_request(rq),
                }
            }
            Disposition::PendingSocket => {
                trace!("pending on socket: op={:?}", rq.op);
                match rq.ios.and_then(|id| self.sockfd(id)) {
                    Some(fd) => self.wait_socket.put(fd, rq),
                    None => self.free_request(rq),
                }
            }
            Disposition::Done(result) => {
                let status = match result {
                    Ok(()) => 0,
                    Err(status) => status.code(),
                };
                if rq.op.replies() {
                    self.send_status(&mut rq, status);
                }
                self.free_request(rq);
            }
        }
    }

    /// Reply with a STATUS envelope on the request channel the message came
    /// from. Oversized or failed replies are squashed to a bare status with
    /// their handles discarded.
    fn send_status(&mut self, rq: &mut Request, status: i32) {
        let mut msg = rq.msg.take().unwrap_or_else(|| Message::new(OpCode::Status));
        msg.op = OpCode::Status.raw();
        msg.arg = status;
        if msg.arg < 0 || msg.data.len() > CHUNK_SIZE || msg.handles.len() > MAX_HANDLES {
            msg.data.clear();
            msg.handles.clear();
            if msg.arg >= 0 {
                msg.arg = Status::Internal.code();
            }
        }
        trace!("send_status: arg={}", msg.arg);
        let target = match rq.ios {
            Some(id) => self.ios.get(id).and_then(|i| i.rio.clone()),
            None => Some(self.root.clone()),
        };
        match target {
            Some(channel) => {
                if let Err(e) = channel.write(msg.encode()) {
                    debug!("send_status: write failed ({e})");
                }
            }
            None => debug!("send_status: no reply channel"),
        }
    }

    /// A data transport reported ready: narrow the watched mask first, then
    /// close, half-close, or run the parked continuations.
    fn data_ready(&mut self, id: IosId, observed: Signals) {
        let Some(ios) = self.ios.get(id) else {
            return;
        };
        let watching = ios.watching_signals;
        let sockfd = ios.sockfd;
        trace!("data_ready: ios={id:?} observed={observed:?} watching={watching:?}");
        self.signals_clear(id, observed);
        if observed.contains(Signals::PEER_CLOSED) && !observed.contains(Signals::READABLE) {
            // peer closed and no outstanding data to read
            self.synthesize(OpCode::Close, id, observed);
        } else if observed.contains(Signals::HALF_CLOSED) && !observed.contains(Signals::READABLE)
        {
            // peer half closed and no outstanding data to read
            self.synthesize(OpCode::HalfClose, id, observed);
        } else if observed.intersects(watching) {
            for rq in self.wait_socket.swap(sockfd) {
                self.handle_request(rq, FdEvents::empty(), observed);
            }
        }
    }
}

pub(crate) struct Dispatcher {
    pub(crate) ctx: Ctx,
    watcher: Watcher,
    intr_rx: InterruptRx,
    max_results: usize,
}

fn watcher_fatal(status: Status) -> io::Error {
    io::Error::other(format!("handle watcher failed ({status})"))
}

impl Dispatcher {
    fn run(&mut self) -> io::Result<()> {
        debug!("dispatcher: start");
        let mut results: Vec<WaitResult> = Vec::with_capacity(self.max_results);
        loop {
            let mut pollfds = self.ctx.fd_events.pollfds(self.intr_rx.as_raw_fd());
            self.watcher.start().map_err(watcher_fatal)?;
            let polled = events::poll(&mut pollfds);
            let ipc_ready = self.watcher.stop().map_err(watcher_fatal)?;
            polled?;
            self.intr_rx.drain();

            if ipc_ready {
                self.drain_waitset(&mut results);
            }

            let interrupt_fd = self.intr_rx.as_raw_fd();
            for pfd in &pollfds {
                if pfd.revents == 0 || pfd.fd == interrupt_fd {
                    continue;
                }
                let events = events::events_of(pfd.revents);
                trace!("net ready: fd={} events={events:?}", pfd.fd);
                self.ctx
                    .fd_events
                    .clear(pfd.fd, events & (FdEvents::READ | FdEvents::WRITE));
                let queue = self.ctx.wait_net.swap(pfd.fd);
                if queue.is_empty()
                    && pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
                {
                    // poll reports errors unconditionally; a dead fd with no
                    // consumer left would spin the loop
                    trace!("net ready: fd={} errored with no consumer", pfd.fd);
                    self.ctx.fd_events.clear(pfd.fd, FdEvents::all());
                }
                for rq in queue {
                    self.ctx.handle_request(rq, events, Signals::empty());
                }
            }

            if !self.drain_requests() {
                break;
            }
        }
        debug!("dispatcher: shutdown");
        Ok(())
    }

    fn drain_waitset(&mut self, results: &mut Vec<WaitResult>) {
        self.ctx
            .waitset
            .wait(Some(Duration::ZERO), self.max_results, results);
        trace!("waitset drain: {} results", results.len());
        for result in results.iter() {
            match result.cookie {
                CTRL_COOKIE | ROOT_COOKIE => continue,
                cookie => {
                    let (id, kind) = IosId::from_cookie(cookie);
                    if kind == CookieKind::Request {
                        // request channels are drained below
                        continue;
                    }
                    self.ctx.data_ready(id, result.observed);
                }
            }
        }
    }

    /// Pull new remote-I/O messages off every request channel. Returns false
    /// once the root channel is gone and the loop should stop.
    fn drain_requests(&mut self) -> bool {
        loop {
            match self.ctx.root.read() {
                Ok(wire) => match Message::decode(wire) {
                    Ok(msg) => self.ctx.dispatch_wire(msg, None),
                    Err(e) => debug!("dispatcher: bad message on root channel ({e})"),
                },
                Err(Status::ShouldWait) => break,
                Err(_) => {
                    debug!("dispatcher: root channel closed");
                    return false;
                }
            }
        }
        for id in self.ctx.ios.live_ids() {
            loop {
                let Some(rio) = self.ctx.ios.get(id).and_then(|i| i.rio.clone()) else {
                    break;
                };
                match rio.read() {
                    Ok(wire) => match Message::decode(wire) {
                        Ok(msg) => self.ctx.dispatch_wire(msg, Some(id)),
                        Err(e) => debug!("dispatcher: bad message on ios={id:?} ({e})"),
                    },
                    Err(Status::ShouldWait) => break,
                    Err(_) => {
                        // client dropped its socket handle
                        self.ctx.synthesize(OpCode::Close, id, Signals::empty());
                        break;
                    }
                }
            }
        }
        true
    }
}

/// A running multiplexer: a dispatcher thread plus its handle watcher.
///
/// Clients open logical sockets by sending OPEN requests on [`control`], and
/// shut the whole thing down by dropping it (or calling [`shutdown`], which
/// also joins the dispatcher).
///
/// [`control`]: Multiplexer::control
/// [`shutdown`]: Multiplexer::shutdown
pub struct Multiplexer {
    control: Channel,
    thread: thread::JoinHandle<io::Result<()>>,
}

impl Multiplexer {
    pub fn spawn(config: Config) -> io::Result<Multiplexer> {
        let waitset = WaitSet::new();
        let (intr_tx, intr_rx) = events::interrupt_pipe()?;
        let watcher = Watcher::spawn(waitset.clone(), intr_tx, config.max_wait_results)?;
        let (root_server, root_client) = Channel::pair();
        waitset.add(
            ROOT_COOKIE,
            root_server.cell(),
            Signals::READABLE | Signals::PEER_CLOSED,
        );
        let mut dispatcher = Dispatcher {
            ctx: Ctx {
                ios: IosTable::new(),
                pool: BufferPool::new(config.prewarm_buffers),
                wait_net: WaitQueue::new(),
                wait_socket: WaitQueue::new(),
                fd_events: FdEventTable::new(),
                waitset,
                netcfg: config
                    .netcfg
                    .unwrap_or_else(|| Box::new(HostNetConfig::new())),
                root: root_server,
            },
            watcher,
            intr_rx,
            max_results: config.max_wait_results,
        };
        let thread = thread::Builder::new()
            .name("sockmux-dispatch".to_string())
            .spawn(move || {
                let result = dispatcher.run();
                if let Err(e) = &result {
                    error!("dispatcher: fatal ({e})");
                }
                result
            })?;
        Ok(Multiplexer {
            control: root_client,
            thread,
        })
    }

    /// The client end of the root request channel.
    pub fn control(&self) -> &Channel {
        &self.control
    }

    /// Close the root channel and wait for the dispatcher to finish.
    pub fn shutdown(self) -> io::Result<()> {
        let Multiplexer { control, thread } = self;
        drop(control);
        match thread.join() {
            Ok(result) => result,
            Err(_) => Err(io::Error::other("dispatcher thread panicked")),
        }
    }
}
