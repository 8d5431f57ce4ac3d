//! One routine per remote-I/O operation, invoked by the dispatcher. Handlers
//! never block: they complete, fail, or return a pending disposition after
//! arming the readiness domain they are waiting on.

use std::io;
use std::os::unix::io::RawFd;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, trace};

use crate::buffer::RwBuf;
use crate::dispatcher::{Ctx, Disposition};
use crate::events::FdEvents;
use crate::iostate::{CookieKind, DataTransport, HandleType, IosId};
use crate::ipc::{Channel, ChannelMessage, Handle, Signals, StreamPipe};
use crate::net::lookup::{self, LookupError};
use crate::net::socket::{self, SockAddr};
use crate::proto::{
    self, GaiReply, GaiRequest, Message, OpenPath, OpenReply, SockOptReq, MAX_PATH, OPTVAL_MAX,
    PROTOCOL_SOCKET,
};
use crate::request::{OpCode, Request};
use crate::status::{errno_of, Status};

/// Interfaces reported per GET_IF_INFO reply.
const IF_INFO_MAX: usize = 16;

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

impl Ctx {
    fn ios_snapshot(&self, id: IosId) -> Option<(RawFd, HandleType, DataTransport)> {
        self.ios
            .get(id)
            .map(|i| (i.sockfd, i.handle_type, i.data.clone()))
    }

    fn stash_read(&mut self, id: IosId, buf: RwBuf, rlen: usize, roff: usize) {
        match self.ios.get_mut(id) {
            Some(ios) => {
                ios.rbuf = Some(buf);
                ios.rlen = rlen;
                ios.roff = roff;
            }
            None => self.pool.release(buf),
        }
    }

    fn stash_write(&mut self, id: IosId, buf: RwBuf, wlen: usize, woff: usize) {
        match self.ios.get_mut(id) {
            Some(ios) => {
                ios.wbuf = Some(buf);
                ios.wlen = wlen;
                ios.woff = woff;
            }
            None => self.pool.release(buf),
        }
    }

    fn half_close_transport(&self, pipe: &StreamPipe) {
        match pipe.half_close() {
            Ok(()) | Err(Status::PeerClosed) => {}
            Err(e) => error!("half-close on data transport failed ({e})"),
        }
    }

    // --- scheduling primitives ----------------------------------------------

    pub(crate) fn schedule_r(&mut self, id: IosId) {
        let Some(fd) = self.sockfd(id) else { return };
        trace!("schedule_r: ios={id:?}");
        self.fd_events.set(fd, FdEvents::READ);
        self.ios.acquire(id);
        self.wait_net.put(fd, Request::internal(OpCode::Read, id));
    }

    pub(crate) fn schedule_w(&mut self, id: IosId) {
        let Some(fd) = self.sockfd(id) else { return };
        trace!("schedule_w: ios={id:?}");
        self.signals_set(id, Signals::READABLE);
        self.ios.acquire(id);
        self.wait_socket.put(fd, Request::internal(OpCode::Write, id));
    }

    /// Connection established: tell the data peer, then start both transfer
    /// directions.
    pub(crate) fn schedule_rw(&mut self, id: IosId) {
        if let Some((_, HandleType::Stream, data)) = self.ios_snapshot(id) {
            if let Err(e) = data.signal_peer(Signals::empty(), Signals::CONNECTED) {
                debug!("schedule_rw: signal CONNECTED failed ({e})");
            }
        }
        self.schedule_r(id);
        self.schedule_w(id);
    }

    pub(crate) fn schedule_sigconn_r(&mut self, id: IosId) {
        let Some(fd) = self.sockfd(id) else { return };
        trace!("schedule_sigconn_r: ios={id:?}");
        self.fd_events.set(fd, FdEvents::READ);
        self.ios.acquire(id);
        self.wait_net.put(fd, Request::internal(OpCode::SigConnR, id));
    }

    pub(crate) fn schedule_sigconn_w(&mut self, id: IosId) {
        let Some(fd) = self.sockfd(id) else { return };
        trace!("schedule_sigconn_w: ios={id:?}");
        self.fd_events.set(fd, FdEvents::WRITE);
        self.ios.acquire(id);
        self.wait_net.put(fd, Request::internal(OpCode::SigConnW, id));
    }

    // --- open ---------------------------------------------------------------

    pub(crate) fn do_open(&mut self, rq: &mut Request) -> Disposition {
        let Some(mut msg) = rq.msg.take() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        debug!("do_open: datalen={}", msg.data.len());
        if msg.handles.is_empty() {
            debug!("do_open: missing reply handle");
            return Disposition::Done(Err(Status::InvalidArgs));
        }
        let Some(reply) = msg.handles.remove(0).into_channel() else {
            debug!("do_open: reply handle is not a channel");
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        let (status, handles) = match self.open_path(&msg, rq.ios) {
            Ok(handles) => (0, handles),
            Err(status) => (status.code(), Vec::new()),
        };
        debug!("do_open: status={status} hcount={}", handles.len());
        let wire = OpenReply {
            status,
            protocol: PROTOCOL_SOCKET,
            handles,
        }
        .encode();
        if let Err(e) = reply.write(wire) {
            debug!("do_open: reply write failed ({e})");
        }
        Disposition::Done(Ok(()))
    }

    fn open_path(&mut self, msg: &Message, opener: Option<IosId>) -> Result<Vec<Handle>, Status> {
        if msg.data.is_empty() || msg.data.len() > MAX_PATH {
            return Err(Status::InvalidArgs);
        }
        let path = std::str::from_utf8(&msg.data).map_err(|_| Status::InvalidArgs)?;
        debug!("do_open: path {path:?}");
        match proto::parse_open_path(path)? {
            OpenPath::None => self.open_none(),
            OpenPath::Socket {
                domain,
                ty,
                protocol,
            } => self.open_socket(domain, ty, protocol),
            OpenPath::Accept => self.open_accept(opener),
        }
    }

    /// Allocate the request channel and (for stream/dgram) the data
    /// transport, register the request channel in the wait-set, and hand the
    /// peer ends back for the OPEN reply.
    fn create_handles(&mut self, id: IosId) -> Result<Vec<Handle>, Status> {
        let handle_type = self
            .ios
            .get(id)
            .map(|i| i.handle_type)
            .ok_or(Status::BadHandle)?;
        let (rio_local, rio_peer) = Channel::pair();
        let mut handles = vec![Handle::Channel(rio_peer)];
        let data = match handle_type {
            HandleType::Stream => {
                let (local, peer) = StreamPipe::pair();
                handles.push(Handle::Stream(peer));
                DataTransport::Stream(local)
            }
            HandleType::Dgram => {
                let (local, peer) = Channel::pair();
                handles.push(Handle::Channel(peer));
                DataTransport::Dgram(local)
            }
            HandleType::None => DataTransport::None,
        };
        self.waitset.add(
            id.cookie(CookieKind::Request),
            rio_local.cell(),
            Signals::READABLE | Signals::PEER_CLOSED,
        );
        let has_data = !data.is_none();
        if let Some(ios) = self.ios.get_mut(id) {
            ios.rio = Some(rio_local);
            ios.data = data;
        }
        if has_data {
            // the data transport holds its own iostate reference
            self.ios.acquire(id);
        }
        Ok(handles)
    }

    fn open_none(&mut self) -> Result<Vec<Handle>, Status> {
        let id = self.ios.alloc();
        match self.create_handles(id) {
            Ok(handles) => Ok(handles),
            Err(e) => {
                error!("open_none: create_handles failed ({e})");
                self.release_ios(id);
                Err(e)
            }
        }
    }

    fn open_socket(&mut self, domain: i32, ty: i32, protocol: i32) -> Result<Vec<Handle>, Status> {
        let handle_type = match ty {
            t if t == libc::SOCK_STREAM => HandleType::Stream,
            t if t == libc::SOCK_DGRAM => HandleType::Dgram,
            _ => return Err(Status::NotSupported),
        };
        let id = self.ios.alloc();
        if let Some(ios) = self.ios.get_mut(id) {
            ios.handle_type = handle_type;
        }
        let sockfd = match socket::socket(domain, ty, protocol) {
            Ok(fd) => fd,
            Err(e) => {
                let errno = errno_of(&e);
                trace!("net_socket failed (errno={errno})");
                self.release_ios(id);
                return Err(Status::from_errno(errno));
            }
        };
        trace!("net_socket => {sockfd}");
        if let Some(ios) = self.ios.get_mut(id) {
            ios.sockfd = sockfd;
        }
        if let Err(e) = socket::set_nonblocking(sockfd) {
            let errno = errno_of(&e);
            trace!("net_ioctl(FIONBIO) failed (errno={errno})");
            self.release_ios(id);
            return Err(Status::from_errno(errno));
        }
        let handles = match self.create_handles(id) {
            Ok(handles) => handles,
            Err(e) => {
                error!("open_socket: create_handles failed ({e})");
                self.release_ios(id);
                return Err(e);
            }
        };
        // out-of-band conditions stay armed for the socket's whole lifetime
        self.fd_events.set(sockfd, FdEvents::EXCEPT);
        self.signals_set(id, Signals::PEER_CLOSED | Signals::HALF_CLOSED);
        if handle_type == HandleType::Dgram {
            self.schedule_w(id);
        }
        Ok(handles)
    }

    fn open_accept(&mut self, opener: Option<IosId>) -> Result<Vec<Handle>, Status> {
        let Some(id) = opener else {
            return Err(Status::InvalidArgs);
        };
        let Some((sockfd, handle_type, data)) = self.ios_snapshot(id) else {
            return Err(Status::BadHandle);
        };
        if sockfd < 0 {
            return Err(Status::BadState);
        }
        // the connected address is fetched later via getpeername
        let newfd = match socket::accept(sockfd) {
            Ok(fd) => fd,
            Err(e) => {
                let errno = errno_of(&e);
                self.set_last_errno(id, errno);
                trace!("net_accept failed (errno={errno})");
                return Err(Status::from_errno(errno));
            }
        };
        self.set_last_errno(id, 0);
        trace!("net_accept => {newfd}");
        if handle_type == HandleType::Stream {
            if let Err(e) = data.signal_peer(Signals::INCOMING, Signals::empty()) {
                debug!("open_accept: clearing INCOMING failed ({e})");
            }
        }
        self.schedule_sigconn_r(id);

        let new_id = self.ios.alloc();
        if let Some(ios) = self.ios.get_mut(new_id) {
            ios.handle_type = handle_type;
            ios.sockfd = newfd;
        }
        if let Err(e) = socket::set_nonblocking(newfd) {
            let errno = errno_of(&e);
            self.set_last_errno(id, errno);
            self.release_ios(new_id);
            return Err(Status::from_errno(errno));
        }
        let handles = match self.create_handles(new_id) {
            Ok(handles) => handles,
            Err(e) => {
                error!("open_accept: create_handles failed ({e})");
                self.release_ios(new_id);
                return Err(e);
            }
        };
        self.fd_events.set(newfd, FdEvents::EXCEPT);
        self.signals_set(new_id, Signals::PEER_CLOSED | Signals::HALF_CLOSED);
        self.schedule_rw(new_id);
        Ok(handles)
    }

    // --- connection management ----------------------------------------------

    pub(crate) fn do_connect(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        let Some((sockfd, handle_type, _)) = self.ios_snapshot(id) else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        if sockfd < 0 {
            return Disposition::Done(Err(Status::BadState));
        }
        let Some(msg) = rq.msg.as_mut() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        let Some(addr) = SockAddr::from_bytes(&msg.data) else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        match socket::connect(sockfd, &addr) {
            Ok(()) => {
                self.set_last_errno(id, 0);
                trace!("net_connect => 0");
                if handle_type == HandleType::Stream {
                    self.schedule_rw(id);
                }
                msg.arg2 = 0;
                msg.data.clear();
                Disposition::Done(Ok(()))
            }
            Err(e) => {
                let errno = errno_of(&e);
                self.set_last_errno(id, errno);
                trace!("net_connect failed (errno={errno})");
                if errno == libc::EINPROGRESS {
                    self.schedule_sigconn_w(id);
                }
                Disposition::Done(Err(Status::from_errno(errno)))
            }
        }
    }

    /// Outbound connect resolved: tell the data peer, record the outcome,
    /// and on success start the transfer loops.
    pub(crate) fn do_sigconn_w(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Ok(()));
        };
        let Some((sockfd, handle_type, data)) = self.ios_snapshot(id) else {
            return Disposition::Done(Ok(()));
        };
        if sockfd < 0 {
            return Disposition::Done(Ok(()));
        }
        if handle_type == HandleType::Stream {
            if let Err(e) = data.signal_peer(Signals::empty(), Signals::OUTGOING) {
                debug!("do_sigconn_w: signal OUTGOING failed ({e})");
            }
        }
        match socket::so_error(sockfd) {
            Ok(pending) => {
                trace!("do_sigconn_w: SO_ERROR={pending}");
                self.set_last_errno(id, pending);
                if pending == 0 {
                    self.schedule_rw(id);
                }
            }
            Err(e) => debug!("do_sigconn_w: getsockopt failed (errno={})", errno_of(&e)),
        }
        Disposition::Done(Ok(()))
    }

    pub(crate) fn do_bind(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        let Some((sockfd, handle_type, _)) = self.ios_snapshot(id) else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        if sockfd < 0 {
            return Disposition::Done(Err(Status::BadState));
        }
        let Some(msg) = rq.msg.as_mut() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        let Some(addr) = SockAddr::from_bytes(&msg.data) else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        match socket::bind(sockfd, &addr) {
            Ok(()) => {
                self.set_last_errno(id, 0);
                trace!("net_bind => 0");
                if handle_type == HandleType::Dgram {
                    self.schedule_r(id);
                }
                msg.arg2 = 0;
                msg.data.clear();
                Disposition::Done(Ok(()))
            }
            Err(e) => {
                let errno = errno_of(&e);
                self.set_last_errno(id, errno);
                trace!("net_bind failed (errno={errno})");
                Disposition::Done(Err(Status::from_errno(errno)))
            }
        }
    }

    pub(crate) fn do_listen(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        let Some(sockfd) = self.sockfd(id) else {
            return Disposition::Done(Err(Status::BadState));
        };
        let Some(msg) = rq.msg.as_mut() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        if msg.data.len() < 4 {
            return Disposition::Done(Err(Status::InvalidArgs));
        }
        let backlog = LittleEndian::read_i32(&msg.data[0..4]);
        debug!("do_listen: backlog={backlog}");
        match socket::listen(sockfd, backlog) {
            Ok(()) => {
                trace!("net_listen => 0");
                self.schedule_sigconn_r(id);
                msg.arg2 = 0;
                msg.data.clear();
                Disposition::Done(Ok(()))
            }
            Err(e) => {
                let errno = errno_of(&e);
                trace!("net_listen failed (errno={errno})");
                Disposition::Done(Err(Status::from_errno(errno)))
            }
        }
    }

    /// Inbound connection pending: raise INCOMING on the data peer.
    pub(crate) fn do_sigconn_r(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Ok(()));
        };
        if let Some((_, HandleType::Stream, data)) = self.ios_snapshot(id) {
            if let Err(e) = data.signal_peer(Signals::empty(), Signals::INCOMING) {
                debug!("do_sigconn_r: signal INCOMING failed ({e})");
            }
        }
        Disposition::Done(Ok(()))
    }

    // --- transfer loops -----------------------------------------------------

    pub(crate) fn do_read(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        let Some((sockfd, handle_type, data)) = self.ios_snapshot(id) else {
            return Disposition::Done(Ok(()));
        };
        if sockfd < 0 {
            return Disposition::Done(Ok(()));
        }
        match (handle_type, data) {
            (HandleType::Stream, DataTransport::Stream(pipe)) => self.read_stream(id, sockfd, pipe),
            (HandleType::Dgram, DataTransport::Dgram(channel)) => {
                self.read_dgram(id, sockfd, channel)
            }
            _ => {
                error!("do_read: no data transport for ios={id:?}");
                Disposition::Done(Err(Status::NotSupported))
            }
        }
    }

    /// Shuttle net → data pipe: fill the scratch buffer from the socket,
    /// then push it into the pipe, parking on whichever side stalls.
    fn read_stream(&mut self, id: IosId, sockfd: RawFd, pipe: StreamPipe) -> Disposition {
        let (mut rlen, mut roff) = match self.ios.get(id) {
            Some(ios) => (ios.rlen, ios.roff),
            None => return Disposition::Done(Ok(())),
        };
        let taken = self.ios.get_mut(id).and_then(|i| i.rbuf.take());
        let mut buf = match taken {
            Some(buf) => buf,
            None => self.pool.acquire(),
        };
        trace!("do_read_stream: rlen={rlen} roff={roff}");

        if rlen == 0 {
            match socket::read(sockfd, &mut buf) {
                Ok(0) => {
                    self.set_last_errno(id, 0);
                    trace!("net_read => 0 (connection closed)");
                    self.half_close_transport(&pipe);
                    self.stash_read(id, buf, 0, 0);
                    return Disposition::Done(Ok(()));
                }
                Ok(n) => {
                    self.set_last_errno(id, 0);
                    trace!("net_read => {n}");
                    rlen = n;
                    roff = 0;
                    if let Some(ios) = self.ios.get_mut(id) {
                        ios.read_net_read += n as u64;
                    }
                }
                Err(e) if would_block(&e) => {
                    self.set_last_errno(id, errno_of(&e));
                    self.fd_events.set(sockfd, FdEvents::READ);
                    self.stash_read(id, buf, 0, 0);
                    return Disposition::PendingNet;
                }
                Err(e) => {
                    let errno = errno_of(&e);
                    self.set_last_errno(id, errno);
                    debug!("do_read_stream: net_read failed (errno={errno})");
                    // surfaced to the peer as end of stream
                    self.half_close_transport(&pipe);
                    self.stash_read(id, buf, 0, 0);
                    return Disposition::Done(Ok(()));
                }
            }
        }

        while roff < rlen {
            match pipe.write(&buf[roff..rlen]) {
                Ok(n) => {
                    roff += n;
                    if let Some(ios) = self.ios.get_mut(id) {
                        ios.read_socket_write += n as u64;
                    }
                }
                Err(Status::ShouldWait) => {
                    self.signals_set(id, Signals::WRITABLE);
                    self.stash_read(id, buf, rlen, roff);
                    return Disposition::PendingSocket;
                }
                Err(e) => {
                    debug!("do_read_stream: data write failed ({e})");
                    self.stash_read(id, buf, 0, 0);
                    return Disposition::Done(Err(e));
                }
            }
        }
        // buffer drained; request the next chunk
        self.fd_events.set(sockfd, FdEvents::READ);
        self.stash_read(id, buf, 0, 0);
        Disposition::PendingNet
    }

    /// One framed channel message per received datagram.
    fn read_dgram(&mut self, id: IosId, sockfd: RawFd, channel: Channel) -> Disposition {
        let taken = self.ios.get_mut(id).and_then(|i| i.rbuf.take());
        let mut buf = match taken {
            Some(buf) => buf,
            None => self.pool.acquire(),
        };
        match socket::recvfrom(sockfd, &mut buf) {
            // n == 0 is an empty datagram, not a disconnect
            Ok((n, addr)) => {
                self.set_last_errno(id, 0);
                trace!("net_recvfrom => {n} (addrlen={})", addr.len());
                let frame = proto::encode_dgram(&addr, &buf[..n]);
                if let Err(e) = channel.write(ChannelMessage::from_bytes(frame)) {
                    debug!("do_read_dgram: data write failed ({e})");
                }
            }
            Err(e) if would_block(&e) => {
                self.set_last_errno(id, errno_of(&e));
                self.fd_events.set(sockfd, FdEvents::READ);
                self.stash_read(id, buf, 0, 0);
                return Disposition::PendingNet;
            }
            Err(e) => {
                let errno = errno_of(&e);
                self.set_last_errno(id, errno);
                debug!("do_read_dgram: net_recvfrom failed (errno={errno})");
            }
        }
        self.fd_events.set(sockfd, FdEvents::READ);
        self.stash_read(id, buf, 0, 0);
        Disposition::PendingNet
    }

    pub(crate) fn do_write(&mut self, rq: &mut Request, signals: Signals) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        let Some((sockfd, handle_type, data)) = self.ios_snapshot(id) else {
            return Disposition::Done(Ok(()));
        };
        if sockfd < 0 {
            return Disposition::Done(Ok(()));
        }
        match (handle_type, data) {
            (HandleType::Stream, DataTransport::Stream(pipe)) => {
                self.write_stream(id, sockfd, pipe, signals)
            }
            (HandleType::Dgram, DataTransport::Dgram(channel)) => {
                self.write_dgram(id, sockfd, channel, signals)
            }
            _ => {
                error!("do_write: no data transport for ios={id:?}");
                Disposition::Done(Err(Status::NotSupported))
            }
        }
    }

    /// Shuttle data pipe → net: drain the pipe into the scratch buffer, then
    /// flush it to the socket, parking on whichever side stalls.
    fn write_stream(
        &mut self,
        id: IosId,
        sockfd: RawFd,
        pipe: StreamPipe,
        signals: Signals,
    ) -> Disposition {
        let (mut wlen, mut woff) = match self.ios.get(id) {
            Some(ios) => (ios.wlen, ios.woff),
            None => return Disposition::Done(Ok(())),
        };
        let taken = self.ios.get_mut(id).and_then(|i| i.wbuf.take());
        let mut buf = match taken {
            Some(buf) => buf,
            None => self.pool.acquire(),
        };
        trace!("do_write_stream: wlen={wlen} woff={woff} signals={signals:?}");

        if wlen == 0 {
            match pipe.read(&mut buf) {
                Ok(n) => {
                    wlen = n;
                    woff = 0;
                    if let Some(ios) = self.ios.get_mut(id) {
                        ios.write_socket_read += n as u64;
                    }
                }
                Err(Status::ShouldWait) => {
                    self.stash_write(id, buf, 0, 0);
                    if signals.contains(Signals::PEER_CLOSED) {
                        self.synthesize(OpCode::Close, id, signals);
                        return Disposition::Done(Ok(()));
                    }
                    self.signals_set(
                        id,
                        Signals::READABLE | Signals::PEER_CLOSED | Signals::HALF_CLOSED,
                    );
                    return Disposition::PendingSocket;
                }
                Err(Status::PeerClosed) => {
                    self.stash_write(id, buf, 0, 0);
                    self.synthesize(OpCode::Close, id, signals);
                    return Disposition::Done(Ok(()));
                }
                Err(e) => {
                    debug!("do_write_stream: data read failed ({e})");
                    self.half_close_transport(&pipe);
                    self.stash_write(id, buf, 0, 0);
                    return Disposition::Done(Err(e));
                }
            }
        }

        while woff < wlen {
            match socket::write(sockfd, &buf[woff..wlen]) {
                Ok(n) => {
                    self.set_last_errno(id, 0);
                    trace!("net_write => {n}");
                    woff += n;
                    if let Some(ios) = self.ios.get_mut(id) {
                        ios.write_net_write += n as u64;
                    }
                }
                Err(e) if would_block(&e) => {
                    self.set_last_errno(id, errno_of(&e));
                    self.fd_events.set(sockfd, FdEvents::WRITE);
                    self.stash_write(id, buf, wlen, woff);
                    return Disposition::PendingNet;
                }
                Err(e) => {
                    let errno = errno_of(&e);
                    self.set_last_errno(id, errno);
                    debug!("do_write_stream: net_write failed (errno={errno})");
                    self.stash_write(id, buf, 0, 0);
                    return Disposition::Done(Ok(()));
                }
            }
        }
        self.signals_set(
            id,
            Signals::READABLE | Signals::PEER_CLOSED | Signals::HALF_CLOSED,
        );
        self.stash_write(id, buf, 0, 0);
        Disposition::PendingSocket
    }

    /// One `sendto` per framed channel message.
    fn write_dgram(
        &mut self,
        id: IosId,
        sockfd: RawFd,
        channel: Channel,
        signals: Signals,
    ) -> Disposition {
        match channel.read() {
            Ok(msg) => match proto::decode_dgram(&msg.data) {
                Ok((addr, payload)) => {
                    let dest = if addr.is_empty() { None } else { Some(&addr) };
                    match socket::sendto(sockfd, payload, dest) {
                        Ok(n) => {
                            self.set_last_errno(id, 0);
                            trace!("net_sendto => {n}");
                        }
                        Err(e) => {
                            let errno = errno_of(&e);
                            self.set_last_errno(id, errno);
                            debug!("do_write_dgram: net_sendto failed (errno={errno})");
                        }
                    }
                }
                // framing errors are dropped; the socket stays alive
                Err(_) => error!("do_write_dgram: bad socket message"),
            },
            Err(Status::ShouldWait) => {
                if signals.contains(Signals::PEER_CLOSED) {
                    self.synthesize(OpCode::Close, id, signals);
                    return Disposition::Done(Ok(()));
                }
                self.signals_set(id, Signals::READABLE | Signals::PEER_CLOSED);
                return Disposition::PendingSocket;
            }
            Err(Status::PeerClosed) => {
                self.synthesize(OpCode::Close, id, signals);
                return Disposition::Done(Ok(()));
            }
            Err(e) => {
                debug!("do_write_dgram: data read failed ({e})");
                return Disposition::Done(Err(e));
            }
        }
        self.signals_set(id, Signals::READABLE | Signals::PEER_CLOSED);
        Disposition::PendingSocket
    }

    // --- teardown -----------------------------------------------------------

    /// The universal cancel: close the host socket, purge both wait queues,
    /// drop both IPC handles, and release the iostate.
    pub(crate) fn do_close(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Ok(()));
        };
        let fd = match self.ios.get_mut(id) {
            Some(ios) => {
                let fd = ios.sockfd;
                ios.sockfd = -1;
                fd
            }
            None => return Disposition::Done(Ok(())),
        };
        if fd >= 0 {
            socket::close(fd);
            self.fd_events.clear(fd, FdEvents::all());
            for parked in self.wait_net.swap(fd) {
                self.free_request(parked);
            }
            for parked in self.wait_socket.swap(fd) {
                self.free_request(parked);
            }
            debug!("sockfd {fd} closed (ios={id:?})");
        }
        let watching = self
            .ios
            .get(id)
            .map(|i| i.watching_signals)
            .unwrap_or(Signals::empty());
        if !watching.is_empty() {
            self.signals_clear(id, watching);
        }
        let had_data = match self.ios.get_mut(id) {
            Some(ios) if !ios.data.is_none() => {
                ios.data = DataTransport::None;
                true
            }
            _ => false,
        };
        if had_data {
            self.release_ios(id);
        }
        let had_rio = match self.ios.get_mut(id) {
            Some(ios) => ios.rio.take().is_some(),
            None => false,
        };
        if had_rio {
            self.waitset.remove(id.cookie(CookieKind::Request));
            self.release_ios(id);
        }
        Disposition::Done(Ok(()))
    }

    pub(crate) fn do_halfclose(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Ok(()));
        };
        let Some(sockfd) = self.sockfd(id) else {
            return Disposition::Done(Ok(()));
        };
        debug!("do_halfclose: ios={id:?}");
        match socket::shutdown_write(sockfd) {
            Ok(()) => trace!("net_shutdown => 0"),
            Err(e) => debug!("net_shutdown failed (errno={})", errno_of(&e)),
        }
        self.signals_set(id, Signals::PEER_CLOSED);
        Disposition::Done(Ok(()))
    }

    // --- pass-through requests ----------------------------------------------

    pub(crate) fn do_ioctl(&mut self, rq: &mut Request) -> Disposition {
        let Some(msg) = rq.msg.as_mut() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        let op = msg.arg2 as u32;
        debug!("do_ioctl: op={op} datalen={}", msg.data.len());
        let host = |e: io::Error| Status::from(&e);
        let result: Result<Vec<u8>, Status> = match op {
            proto::IOCTL_GET_IF_INFO => self
                .netcfg
                .if_info()
                .map(|mut infos| {
                    infos.truncate(IF_INFO_MAX);
                    proto::encode_if_info(&infos)
                })
                .map_err(host),
            proto::IOCTL_SET_IF_ADDR => {
                proto::decode_ifname_addr2(&msg.data).and_then(|(name, addr, netmask)| {
                    self.netcfg
                        .set_if_addr(&name, addr, netmask)
                        .map(|_| Vec::new())
                        .map_err(host)
                })
            }
            proto::IOCTL_GET_IF_GATEWAY => proto::decode_ifname(&msg.data).and_then(|name| {
                self.netcfg
                    .if_gateway(&name)
                    .map(proto::encode_ip)
                    .map_err(host)
            }),
            proto::IOCTL_SET_IF_GATEWAY => {
                proto::decode_ifname_addr(&msg.data).and_then(|(name, gateway)| {
                    self.netcfg
                        .set_if_gateway(&name, gateway)
                        .map(|_| Vec::new())
                        .map_err(host)
                })
            }
            proto::IOCTL_GET_DHCP_STATUS => proto::decode_ifname(&msg.data).and_then(|name| {
                self.netcfg
                    .dhcp_status(&name)
                    .map(proto::encode_flag)
                    .map_err(host)
            }),
            proto::IOCTL_SET_DHCP_STATUS => {
                proto::decode_ifname_flag(&msg.data).and_then(|(name, enabled)| {
                    self.netcfg
                        .set_dhcp_status(&name, enabled)
                        .map(|_| Vec::new())
                        .map_err(host)
                })
            }
            proto::IOCTL_GET_DNS_SERVER => {
                self.netcfg.dns_server().map(proto::encode_ip).map_err(host)
            }
            proto::IOCTL_SET_DNS_SERVER => proto::decode_ip(&msg.data).and_then(|addr| {
                self.netcfg
                    .set_dns_server(addr)
                    .map(|_| Vec::new())
                    .map_err(host)
            }),
            _ => {
                error!("do_ioctl: unknown op {op}");
                Err(Status::InvalidArgs)
            }
        };
        msg.arg2 = 0;
        match result {
            Ok(data) => {
                msg.data = data;
                Disposition::Done(Ok(()))
            }
            Err(status) => {
                msg.data.clear();
                Disposition::Done(Err(status))
            }
        }
    }

    pub(crate) fn do_getaddrinfo(&mut self, rq: &mut Request) -> Disposition {
        let Some(msg) = rq.msg.as_mut() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        let req = match GaiRequest::decode(&msg.data) {
            Ok(req) => req,
            Err(status) => return Disposition::Done(Err(status)),
        };
        trace!(
            "do_getaddrinfo: node={:?} service={:?}",
            req.node,
            req.service
        );
        let reply = match lookup::getaddrinfo(
            req.node.as_deref(),
            req.service.as_deref(),
            req.hints.as_ref(),
        ) {
            Ok(results) => {
                if let Some(id) = rq.ios {
                    self.set_last_errno(id, 0);
                }
                GaiReply {
                    retval: 0,
                    // first result only; the reply format carries a count
                    results: results.into_iter().take(1).collect(),
                }
            }
            Err(LookupError::Resolver(code)) => GaiReply {
                retval: code,
                results: Vec::new(),
            },
            Err(LookupError::System(e)) => {
                let errno = errno_of(&e);
                if let Some(id) = rq.ios {
                    self.set_last_errno(id, errno);
                }
                debug!("do_getaddrinfo: failed (errno={errno})");
                return Disposition::Done(Err(Status::from_errno(errno)));
            }
        };
        msg.data = reply.encode();
        msg.arg2 = 0;
        Disposition::Done(Ok(()))
    }

    pub(crate) fn do_getsockname(&mut self, rq: &mut Request) -> Disposition {
        self.sockaddr_query(rq, socket::getsockname, "net_getsockname")
    }

    pub(crate) fn do_getpeername(&mut self, rq: &mut Request) -> Disposition {
        self.sockaddr_query(rq, socket::getpeername, "net_getpeername")
    }

    fn sockaddr_query(
        &mut self,
        rq: &mut Request,
        query: fn(RawFd) -> io::Result<SockAddr>,
        what: &str,
    ) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        let Some(sockfd) = self.sockfd(id) else {
            return Disposition::Done(Err(Status::BadState));
        };
        let Some(msg) = rq.msg.as_mut() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        match query(sockfd) {
            Ok(addr) => {
                self.set_last_errno(id, 0);
                msg.data = proto::encode_sockaddr(&addr);
                msg.arg2 = 0;
                Disposition::Done(Ok(()))
            }
            Err(e) => {
                let errno = errno_of(&e);
                self.set_last_errno(id, errno);
                trace!("{what} failed (errno={errno})");
                Disposition::Done(Err(Status::from_errno(errno)))
            }
        }
    }

    pub(crate) fn do_getsockopt(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        let Some(sockfd) = self.sockfd(id) else {
            return Disposition::Done(Err(Status::BadState));
        };
        let Some(msg) = rq.msg.as_mut() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        let req = match SockOptReq::decode(&msg.data) {
            Ok(req) => req,
            Err(status) => return Disposition::Done(Err(status)),
        };
        let optval = if req.level == libc::SOL_SOCKET && req.optname == libc::SO_ERROR {
            // the recorded host errno, not the live socket state
            let last_errno = self.ios.get(id).map(|i| i.last_errno).unwrap_or(0);
            let mut val = vec![0u8; 4];
            LittleEndian::write_i32(&mut val, last_errno);
            val
        } else {
            let mut val = vec![0u8; OPTVAL_MAX];
            match socket::getsockopt_raw(sockfd, req.level, req.optname, &mut val) {
                Ok(len) => {
                    self.set_last_errno(id, 0);
                    val.truncate(len);
                    val
                }
                Err(e) => {
                    let errno = errno_of(&e);
                    self.set_last_errno(id, errno);
                    trace!("net_getsockopt failed (errno={errno})");
                    return Disposition::Done(Err(Status::from_errno(errno)));
                }
            }
        };
        msg.data = SockOptReq {
            level: req.level,
            optname: req.optname,
            optval,
        }
        .encode();
        msg.arg2 = 0;
        Disposition::Done(Ok(()))
    }

    pub(crate) fn do_setsockopt(&mut self, rq: &mut Request) -> Disposition {
        let Some(id) = rq.ios else {
            return Disposition::Done(Err(Status::BadHandle));
        };
        let Some(sockfd) = self.sockfd(id) else {
            return Disposition::Done(Err(Status::BadState));
        };
        let Some(msg) = rq.msg.as_mut() else {
            return Disposition::Done(Err(Status::InvalidArgs));
        };
        let req = match SockOptReq::decode(&msg.data) {
            Ok(req) => req,
            Err(status) => return Disposition::Done(Err(status)),
        };
        match socket::setsockopt_raw(sockfd, req.level, req.optname, &req.optval) {
            Ok(()) => {
                self.set_last_errno(id, 0);
                msg.data.clear();
                msg.arg2 = 0;
                Disposition::Done(Ok(()))
            }
            Err(e) => {
                let errno = errno_of(&e);
                self.set_last_errno(id, errno);
                trace!("net_setsockopt failed (errno={errno})");
                Disposition::Done(Err(Status::from_errno(errno)))
            }
        }
    }
}
