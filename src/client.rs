//! In-process client bindings for the multiplexer's remote-I/O protocol.
//!
//! These wrap the raw request/reply envelopes into calls: open a logical
//! socket by path, issue control operations on its request channel, and move
//! bytes over its data transport. Waits are bounded so a wedged server
//! surfaces as `TimedOut` instead of a hang.

use std::net::SocketAddr;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::ipc::{Channel, ChannelMessage, Handle, Signals, StreamPipe};
use crate::net::lookup::Hints;
use crate::net::socket::SockAddr;
use crate::proto::{self, GaiReply, GaiRequest, Message, OpenReply, SockOptReq};
use crate::request::OpCode;
use crate::status::Status;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A logical socket held by a client: its request channel plus (for stream
/// and datagram sockets) the data transport.
pub struct RemoteSocket {
    rio: Channel,
    data: Option<Handle>,
}

impl std::fmt::Debug for RemoteSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSocket").finish_non_exhaustive()
    }
}

/// Open a logical socket by path (`none`, `socket/<d>/<t>/<p>`, `accept`)
/// on a request channel: the root control channel, or an existing socket's
/// channel for `accept`.
pub fn open(control: &Channel, path: &str) -> Result<RemoteSocket, Status> {
    let (reply_local, reply_remote) = Channel::pair();
    control.write(OpenReply::request(path, reply_remote).encode())?;
    let observed =
        reply_local.wait_signals(Signals::READABLE | Signals::PEER_CLOSED, Some(DEFAULT_TIMEOUT))?;
    if !observed.contains(Signals::READABLE) {
        return Err(Status::PeerClosed);
    }
    let reply = OpenReply::decode(reply_local.read()?)?;
    if reply.status < 0 {
        return Err(Status::from_code(reply.status).unwrap_or(Status::Io));
    }
    let mut handles = reply.handles.into_iter();
    let rio = handles
        .next()
        .and_then(Handle::into_channel)
        .ok_or(Status::Internal)?;
    Ok(RemoteSocket {
        rio,
        data: handles.next(),
    })
}

impl RemoteSocket {
    pub fn stream(&self) -> Option<&StreamPipe> {
        match &self.data {
            Some(Handle::Stream(pipe)) => Some(pipe),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<&Channel> {
        match &self.data {
            Some(Handle::Channel(channel)) => Some(channel),
            _ => None,
        }
    }

    /// Issue one request and wait for its STATUS reply.
    fn transact(&self, msg: Message) -> Result<Message, Status> {
        self.rio.write(msg.encode())?;
        let observed = self
            .rio
            .wait_signals(Signals::READABLE | Signals::PEER_CLOSED, Some(DEFAULT_TIMEOUT))?;
        if !observed.contains(Signals::READABLE) {
            return Err(Status::PeerClosed);
        }
        let reply = Message::decode(self.rio.read()?)?;
        if reply.op != OpCode::Status.raw() {
            return Err(Status::Internal);
        }
        if reply.arg < 0 {
            return Err(Status::from_code(reply.arg).unwrap_or(Status::Io));
        }
        Ok(reply)
    }

    pub fn connect(&self, addr: &SocketAddr) -> Result<(), Status> {
        let data = SockAddr::from_std(addr).as_bytes().to_vec();
        self.transact(Message::with_data(OpCode::Connect, data))
            .map(|_| ())
    }

    /// Connect and, when the host reports in-progress, wait for the connect
    /// attempt to resolve. Returns the resulting socket error (0 on success).
    pub fn connect_wait(&self, addr: &SocketAddr) -> Result<i32, Status> {
        match self.connect(addr) {
            Ok(()) => Ok(0),
            Err(Status::ShouldWait) => {
                let pipe = self.stream().ok_or(Status::BadHandle)?;
                pipe.wait_signals(
                    Signals::OUTGOING | Signals::CONNECTED,
                    Some(DEFAULT_TIMEOUT),
                )?;
                self.so_error()
            }
            Err(e) => Err(e),
        }
    }

    pub fn bind(&self, addr: &SocketAddr) -> Result<(), Status> {
        let data = SockAddr::from_std(addr).as_bytes().to_vec();
        self.transact(Message::with_data(OpCode::Bind, data))
            .map(|_| ())
    }

    pub fn listen(&self, backlog: i32) -> Result<(), Status> {
        let mut data = vec![0u8; 4];
        LittleEndian::write_i32(&mut data, backlog);
        self.transact(Message::with_data(OpCode::Listen, data))
            .map(|_| ())
    }

    /// Accept one pending connection from a listening socket.
    pub fn accept(&self) -> Result<RemoteSocket, Status> {
        open(&self.rio, "accept")
    }

    pub fn getsockname(&self) -> Result<SocketAddr, Status> {
        let reply = self.transact(Message::new(OpCode::GetSockName))?;
        let (addr, _) = proto::get_sockaddr(&reply.data)?;
        addr.to_std().ok_or(Status::Internal)
    }

    pub fn getpeername(&self) -> Result<SocketAddr, Status> {
        let reply = self.transact(Message::new(OpCode::GetPeerName))?;
        let (addr, _) = proto::get_sockaddr(&reply.data)?;
        addr.to_std().ok_or(Status::Internal)
    }

    pub fn getsockopt(&self, level: i32, optname: i32) -> Result<Vec<u8>, Status> {
        let req = SockOptReq {
            level,
            optname,
            optval: Vec::new(),
        };
        let reply = self.transact(Message::with_data(OpCode::GetSockOpt, req.encode()))?;
        Ok(SockOptReq::decode(&reply.data)?.optval)
    }

    pub fn setsockopt(&self, level: i32, optname: i32, optval: &[u8]) -> Result<(), Status> {
        let req = SockOptReq {
            level,
            optname,
            optval: optval.to_vec(),
        };
        self.transact(Message::with_data(OpCode::SetSockOpt, req.encode()))
            .map(|_| ())
    }

    /// The host error recorded for this socket (`SO_ERROR`).
    pub fn so_error(&self) -> Result<i32, Status> {
        let optval = self.getsockopt(libc::SOL_SOCKET, libc::SO_ERROR)?;
        if optval.len() < 4 {
            return Err(Status::Internal);
        }
        Ok(LittleEndian::read_i32(&optval[0..4]))
    }

    pub fn getaddrinfo(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: Option<Hints>,
    ) -> Result<GaiReply, Status> {
        let req = GaiRequest {
            node: node.map(str::to_string),
            service: service.map(str::to_string),
            hints,
        };
        let reply = self.transact(Message::with_data(OpCode::GetAddrInfo, req.encode()))?;
        GaiReply::decode(&reply.data)
    }

    pub fn ioctl(&self, op: u32, data: Vec<u8>) -> Result<Vec<u8>, Status> {
        let mut msg = Message::with_data(OpCode::Ioctl, data);
        msg.arg2 = op as i64;
        self.transact(msg).map(|reply| reply.data)
    }

    /// Ask the multiplexer to close the host socket, then drop our handles.
    pub fn close(self) -> Result<(), Status> {
        self.rio.write(Message::new(OpCode::Close).encode())
    }

    // --- stream data path ---------------------------------------------------

    /// Write the whole buffer to the data transport, waiting out backpressure.
    pub fn send(&self, buf: &[u8]) -> Result<(), Status> {
        let pipe = self.stream().ok_or(Status::BadHandle)?;
        let mut off = 0;
        while off < buf.len() {
            match pipe.write(&buf[off..]) {
                Ok(n) => off += n,
                Err(Status::ShouldWait) => {
                    let observed = pipe.wait_signals(
                        Signals::WRITABLE | Signals::PEER_CLOSED,
                        Some(DEFAULT_TIMEOUT),
                    )?;
                    if !observed.contains(Signals::WRITABLE) {
                        return Err(Status::PeerClosed);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read from the data transport, blocking until bytes arrive. Returns 0
    /// at end of stream (peer closed or half-closed with nothing buffered).
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Status> {
        let pipe = self.stream().ok_or(Status::BadHandle)?;
        loop {
            match pipe.read(buf) {
                Ok(n) => return Ok(n),
                Err(Status::ShouldWait) => {
                    let observed = pipe.wait_signals(
                        Signals::READABLE | Signals::PEER_CLOSED | Signals::HALF_CLOSED,
                        Some(DEFAULT_TIMEOUT),
                    )?;
                    if observed.contains(Signals::READABLE) {
                        continue;
                    }
                    return Ok(0);
                }
                Err(Status::PeerClosed) => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    /// Close our write side; the multiplexer shuts down the host socket's
    /// write half. Reads keep draining in-flight bytes.
    pub fn half_close(&self) -> Result<(), Status> {
        self.stream().ok_or(Status::BadHandle)?.half_close()
    }

    // --- datagram data path -------------------------------------------------

    /// Send one datagram; `None` sends to the connected destination.
    pub fn send_to(&self, payload: &[u8], addr: Option<&SocketAddr>) -> Result<(), Status> {
        let channel = self.channel().ok_or(Status::BadHandle)?;
        let wire_addr = match addr {
            Some(a) => SockAddr::from_std(a),
            None => SockAddr::empty(),
        };
        channel.write(ChannelMessage::from_bytes(proto::encode_dgram(
            &wire_addr, payload,
        )))
    }

    /// Receive one datagram with its source address.
    pub fn recv_from(&self) -> Result<(Vec<u8>, Option<SocketAddr>), Status> {
        let channel = self.channel().ok_or(Status::BadHandle)?;
        loop {
            match channel.read() {
                Ok(msg) => {
                    let (addr, payload) = proto::decode_dgram(&msg.data)?;
                    return Ok((payload.to_vec(), addr.to_std()));
                }
                Err(Status::ShouldWait) => {
                    let observed = channel.wait_signals(
                        Signals::READABLE | Signals::PEER_CLOSED,
                        Some(DEFAULT_TIMEOUT),
                    )?;
                    if !observed.contains(Signals::READABLE) {
                        return Err(Status::PeerClosed);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
