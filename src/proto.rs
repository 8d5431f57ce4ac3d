//! Remote-I/O envelope codec and payload grammars.
//!
//! A request is `(op, arg, arg2, data[], handles[])`; replies reuse the
//! envelope with op [`OpCode::Status`]. Payload layouts are little-endian and
//! fixed-width where the C ABI they mirror is (socket addresses travel as a
//! `u32` length plus a full `sockaddr_storage`).

use bytes::Bytes;
use byteorder::{ByteOrder, LittleEndian};

use crate::ipc::{Channel, ChannelMessage, Handle};
use crate::net::config::{IfInfo, IFNAME_SIZE};
use crate::net::lookup::{AddrInfo, Hints};
use crate::net::socket::{SockAddr, SOCKADDR_STORAGE_SIZE};
use crate::request::OpCode;
use crate::status::Status;

/// Upper bound on envelope payloads.
pub const CHUNK_SIZE: usize = 8192;
/// An envelope transfers at most a request channel and a data transport.
pub const MAX_HANDLES: usize = 2;
/// Open paths are bounded.
pub const MAX_PATH: usize = 1024;
/// Protocol tag carried in OPEN replies.
pub const PROTOCOL_SOCKET: u32 = 2;

const HDR_SIZE: usize = 20;

/// Network-configuration sub-operations, carried in `arg2` of IOCTL.
pub const IOCTL_GET_IF_INFO: u32 = 1;
pub const IOCTL_SET_IF_ADDR: u32 = 2;
pub const IOCTL_GET_IF_GATEWAY: u32 = 3;
pub const IOCTL_SET_IF_GATEWAY: u32 = 4;
pub const IOCTL_GET_DHCP_STATUS: u32 = 5;
pub const IOCTL_SET_DHCP_STATUS: u32 = 6;
pub const IOCTL_GET_DNS_SERVER: u32 = 7;
pub const IOCTL_SET_DNS_SERVER: u32 = 8;

/// A decoded request or reply envelope.
pub struct Message {
    pub op: u32,
    pub arg: i32,
    pub arg2: i64,
    pub data: Vec<u8>,
    pub handles: Vec<Handle>,
}

impl Message {
    pub fn new(op: OpCode) -> Message {
        Message {
            op: op.raw(),
            arg: 0,
            arg2: 0,
            data: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn with_data(op: OpCode, data: Vec<u8>) -> Message {
        Message {
            data,
            ..Message::new(op)
        }
    }

    pub fn encode(self) -> ChannelMessage {
        let mut buf = vec![0u8; HDR_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.op);
        LittleEndian::write_i32(&mut buf[4..8], self.arg);
        LittleEndian::write_i64(&mut buf[8..16], self.arg2);
        LittleEndian::write_u32(&mut buf[16..20], self.data.len() as u32);
        buf.extend_from_slice(&self.data);
        ChannelMessage {
            data: Bytes::from(buf),
            handles: self.handles,
        }
    }

    pub fn decode(msg: ChannelMessage) -> Result<Message, Status> {
        if msg.data.len() < HDR_SIZE || msg.handles.len() > MAX_HANDLES {
            return Err(Status::InvalidArgs);
        }
        let op = LittleEndian::read_u32(&msg.data[0..4]);
        let arg = LittleEndian::read_i32(&msg.data[4..8]);
        let arg2 = LittleEndian::read_i64(&msg.data[8..16]);
        let datalen = LittleEndian::read_u32(&msg.data[16..20]) as usize;
        if datalen > CHUNK_SIZE || msg.data.len() - HDR_SIZE != datalen {
            return Err(Status::InvalidArgs);
        }
        Ok(Message {
            op,
            arg,
            arg2,
            data: msg.data[HDR_SIZE..].to_vec(),
            handles: msg.handles,
        })
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("op", &self.op)
            .field("arg", &self.arg)
            .field("arg2", &self.arg2)
            .field("datalen", &self.data.len())
            .field("hcount", &self.handles.len())
            .finish()
    }
}

/// OPEN replies travel on the handle carried by the OPEN request itself:
/// `(status, protocol-tag)` plus the new endpoint handles.
pub struct OpenReply {
    pub status: i32,
    pub protocol: u32,
    pub handles: Vec<Handle>,
}

impl OpenReply {
    pub fn encode(self) -> ChannelMessage {
        let mut buf = vec![0u8; 8];
        LittleEndian::write_i32(&mut buf[0..4], self.status);
        LittleEndian::write_u32(&mut buf[4..8], self.protocol);
        ChannelMessage {
            data: Bytes::from(buf),
            handles: self.handles,
        }
    }

    pub fn decode(msg: ChannelMessage) -> Result<OpenReply, Status> {
        if msg.data.len() < 8 {
            return Err(Status::InvalidArgs);
        }
        Ok(OpenReply {
            status: LittleEndian::read_i32(&msg.data[0..4]),
            protocol: LittleEndian::read_u32(&msg.data[4..8]),
            handles: msg.handles,
        })
    }

    /// Build an OPEN message carrying `reply` as its reply handle.
    pub fn request(path: &str, reply: Channel) -> Message {
        let mut msg = Message::with_data(OpCode::Open, path.as_bytes().to_vec());
        msg.handles.push(Handle::Channel(reply));
        msg
    }
}

/// What an open path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenPath {
    None,
    Socket { domain: i32, ty: i32, protocol: i32 },
    Accept,
}

fn match_subdir<'a>(path: &'a str, name: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(name)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Strict base-10 triple: all three fields present, slash-separated, fully
/// consumed. Anything else is an argument error.
fn parse_socket_args(args: &str) -> Result<(i32, i32, i32), Status> {
    let mut fields = args.split('/');
    let mut next = || -> Result<i32, Status> {
        fields
            .next()
            .ok_or(Status::InvalidArgs)?
            .parse::<i32>()
            .map_err(|_| Status::InvalidArgs)
    };
    let domain = next()?;
    let ty = next()?;
    let protocol = next()?;
    if fields.next().is_some() {
        return Err(Status::InvalidArgs);
    }
    Ok((domain, ty, protocol))
}

pub(crate) fn parse_open_path(path: &str) -> Result<OpenPath, Status> {
    if path.is_empty() || path.len() > MAX_PATH {
        return Err(Status::InvalidArgs);
    }
    if let Some(rest) = match_subdir(path, "socket") {
        let (domain, ty, protocol) = parse_socket_args(rest)?;
        Ok(OpenPath::Socket {
            domain,
            ty,
            protocol,
        })
    } else if match_subdir(path, "none").is_some() {
        Ok(OpenPath::None)
    } else if match_subdir(path, "accept").is_some() {
        Ok(OpenPath::Accept)
    } else {
        Err(Status::InvalidArgs)
    }
}

// --- socket addresses -------------------------------------------------------

/// Fixed-width address: `u32` length followed by a full `sockaddr_storage`.
pub const SOCKADDR_WIRE_SIZE: usize = 4 + SOCKADDR_STORAGE_SIZE;

pub fn put_sockaddr(buf: &mut Vec<u8>, addr: &SockAddr) {
    let mut hdr = [0u8; 4];
    LittleEndian::write_u32(&mut hdr, addr.len() as u32);
    buf.extend_from_slice(&hdr);
    buf.extend_from_slice(addr.as_bytes());
    buf.extend(std::iter::repeat(0u8).take(SOCKADDR_STORAGE_SIZE - addr.len()));
}

pub fn get_sockaddr(data: &[u8]) -> Result<(SockAddr, &[u8]), Status> {
    if data.len() < SOCKADDR_WIRE_SIZE {
        return Err(Status::InvalidArgs);
    }
    let len = LittleEndian::read_u32(&data[0..4]) as usize;
    if len > SOCKADDR_STORAGE_SIZE {
        return Err(Status::InvalidArgs);
    }
    let addr = SockAddr::from_bytes(&data[4..4 + len]).ok_or(Status::InvalidArgs)?;
    Ok((addr, &data[SOCKADDR_WIRE_SIZE..]))
}

pub fn encode_sockaddr(addr: &SockAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SOCKADDR_WIRE_SIZE);
    put_sockaddr(&mut buf, addr);
    buf
}

// --- datagram framing -------------------------------------------------------

/// Framed datagram header: address length plus the address storage.
pub const DGRAM_HEADER_SIZE: usize = SOCKADDR_WIRE_SIZE;

pub fn encode_dgram(addr: &SockAddr, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(DGRAM_HEADER_SIZE + payload.len());
    put_sockaddr(&mut buf, addr);
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

pub fn decode_dgram(data: &[u8]) -> Result<(SockAddr, &[u8]), Status> {
    get_sockaddr(data)
}

// --- socket options ---------------------------------------------------------

pub const OPTVAL_MAX: usize = 128;

pub struct SockOptReq {
    pub level: i32,
    pub optname: i32,
    pub optval: Vec<u8>,
}

impl SockOptReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        LittleEndian::write_i32(&mut buf[0..4], self.level);
        LittleEndian::write_i32(&mut buf[4..8], self.optname);
        LittleEndian::write_u32(&mut buf[8..12], self.optval.len() as u32);
        buf.extend_from_slice(&self.optval);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<SockOptReq, Status> {
        if data.len() < 12 {
            return Err(Status::InvalidArgs);
        }
        let optlen = LittleEndian::read_u32(&data[8..12]) as usize;
        if optlen > OPTVAL_MAX || data.len() - 12 != optlen {
            return Err(Status::InvalidArgs);
        }
        Ok(SockOptReq {
            level: LittleEndian::read_i32(&data[0..4]),
            optname: LittleEndian::read_i32(&data[4..8]),
            optval: data[12..].to_vec(),
        })
    }
}

// --- name resolution --------------------------------------------------------

pub struct GaiRequest {
    pub node: Option<String>,
    pub service: Option<String>,
    pub hints: Option<Hints>,
}

fn put_opt_str(buf: &mut Vec<u8>, s: &Option<String>) {
    match s {
        Some(s) => {
            buf.push(1);
            let mut len = [0u8; 4];
            LittleEndian::write_u32(&mut len, s.len() as u32);
            buf.extend_from_slice(&len);
            buf.extend_from_slice(s.as_bytes());
        }
        None => buf.push(0),
    }
}

fn get_opt_str(data: &[u8]) -> Result<(Option<String>, &[u8]), Status> {
    let (&present, rest) = data.split_first().ok_or(Status::InvalidArgs)?;
    if present == 0 {
        return Ok((None, rest));
    }
    if rest.len() < 4 {
        return Err(Status::InvalidArgs);
    }
    let len = LittleEndian::read_u32(&rest[0..4]) as usize;
    let rest = &rest[4..];
    if rest.len() < len {
        return Err(Status::InvalidArgs);
    }
    let s = std::str::from_utf8(&rest[..len]).map_err(|_| Status::InvalidArgs)?;
    Ok((Some(s.to_string()), &rest[len..]))
}

impl GaiRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_opt_str(&mut buf, &self.node);
        put_opt_str(&mut buf, &self.service);
        match &self.hints {
            Some(h) => {
                buf.push(1);
                let mut fields = [0u8; 16];
                LittleEndian::write_i32(&mut fields[0..4], h.flags);
                LittleEndian::write_i32(&mut fields[4..8], h.family);
                LittleEndian::write_i32(&mut fields[8..12], h.socktype);
                LittleEndian::write_i32(&mut fields[12..16], h.protocol);
                buf.extend_from_slice(&fields);
            }
            None => buf.push(0),
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<GaiRequest, Status> {
        let (node, rest) = get_opt_str(data)?;
        let (service, rest) = get_opt_str(rest)?;
        let (&present, rest) = rest.split_first().ok_or(Status::InvalidArgs)?;
        let hints = if present != 0 {
            if rest.len() < 16 {
                return Err(Status::InvalidArgs);
            }
            Some(Hints {
                flags: LittleEndian::read_i32(&rest[0..4]),
                family: LittleEndian::read_i32(&rest[4..8]),
                socktype: LittleEndian::read_i32(&rest[8..12]),
                protocol: LittleEndian::read_i32(&rest[12..16]),
            })
        } else {
            None
        };
        Ok(GaiRequest {
            node,
            service,
            hints,
        })
    }
}

pub struct GaiReply {
    pub retval: i32,
    pub results: Vec<AddrInfo>,
}

impl GaiReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        LittleEndian::write_i32(&mut buf[0..4], self.retval);
        LittleEndian::write_u32(&mut buf[4..8], self.results.len() as u32);
        for res in &self.results {
            let mut fields = [0u8; 12];
            LittleEndian::write_i32(&mut fields[0..4], res.family);
            LittleEndian::write_i32(&mut fields[4..8], res.socktype);
            LittleEndian::write_i32(&mut fields[8..12], res.protocol);
            buf.extend_from_slice(&fields);
            put_sockaddr(&mut buf, &res.addr);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<GaiReply, Status> {
        if data.len() < 8 {
            return Err(Status::InvalidArgs);
        }
        let retval = LittleEndian::read_i32(&data[0..4]);
        let nres = LittleEndian::read_u32(&data[4..8]) as usize;
        let mut rest = &data[8..];
        let mut results = Vec::with_capacity(nres);
        for _ in 0..nres {
            if rest.len() < 12 {
                return Err(Status::InvalidArgs);
            }
            let family = LittleEndian::read_i32(&rest[0..4]);
            let socktype = LittleEndian::read_i32(&rest[4..8]);
            let protocol = LittleEndian::read_i32(&rest[8..12]);
            let (addr, tail) = get_sockaddr(&rest[12..])?;
            results.push(AddrInfo {
                family,
                socktype,
                protocol,
                addr,
            });
            rest = tail;
        }
        Ok(GaiReply { retval, results })
    }
}

// --- network configuration --------------------------------------------------

fn put_ifname(buf: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(IFNAME_SIZE - 1);
    buf.extend_from_slice(&bytes[..n]);
    buf.extend(std::iter::repeat(0u8).take(IFNAME_SIZE - n));
}

fn get_ifname(data: &[u8]) -> Result<(String, &[u8]), Status> {
    if data.len() < IFNAME_SIZE {
        return Err(Status::InvalidArgs);
    }
    let raw = &data[..IFNAME_SIZE];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(IFNAME_SIZE);
    let name = std::str::from_utf8(&raw[..end]).map_err(|_| Status::InvalidArgs)?;
    Ok((name.to_string(), &data[IFNAME_SIZE..]))
}

fn put_opt_ip(buf: &mut Vec<u8>, ip: Option<std::net::IpAddr>) {
    match ip {
        Some(ip) => put_sockaddr(buf, &SockAddr::from_ip(ip)),
        None => put_sockaddr(buf, &SockAddr::empty()),
    }
}

fn get_opt_ip(data: &[u8]) -> Result<(Option<std::net::IpAddr>, &[u8]), Status> {
    let (addr, rest) = get_sockaddr(data)?;
    Ok((addr.ip(), rest))
}

pub fn encode_if_info(infos: &[IfInfo]) -> Vec<u8> {
    let mut buf = vec![0u8; 4];
    LittleEndian::write_u32(&mut buf[0..4], infos.len() as u32);
    for info in infos {
        put_ifname(&mut buf, &info.name);
        let mut idx = [0u8; 4];
        LittleEndian::write_u32(&mut idx, info.index);
        buf.extend_from_slice(&idx);
        put_opt_ip(&mut buf, info.addr);
        put_opt_ip(&mut buf, info.netmask);
        put_opt_ip(&mut buf, info.broadcast);
    }
    buf
}

pub fn decode_if_info(data: &[u8]) -> Result<Vec<IfInfo>, Status> {
    if data.len() < 4 {
        return Err(Status::InvalidArgs);
    }
    let count = LittleEndian::read_u32(&data[0..4]) as usize;
    let mut rest = &data[4..];
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let (name, tail) = get_ifname(rest)?;
        if tail.len() < 4 {
            return Err(Status::InvalidArgs);
        }
        let index = LittleEndian::read_u32(&tail[0..4]);
        let (addr, tail) = get_opt_ip(&tail[4..])?;
        let (netmask, tail) = get_opt_ip(tail)?;
        let (broadcast, tail) = get_opt_ip(tail)?;
        out.push(IfInfo {
            name,
            index,
            addr,
            netmask,
            broadcast,
        });
        rest = tail;
    }
    Ok(out)
}

pub fn encode_ifname(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(IFNAME_SIZE);
    put_ifname(&mut buf, name);
    buf
}

pub fn decode_ifname(data: &[u8]) -> Result<String, Status> {
    get_ifname(data).map(|(name, _)| name)
}

pub fn encode_ifname_addr(name: &str, addr: std::net::IpAddr) -> Vec<u8> {
    let mut buf = Vec::new();
    put_ifname(&mut buf, name);
    put_opt_ip(&mut buf, Some(addr));
    buf
}

pub fn decode_ifname_addr(data: &[u8]) -> Result<(String, std::net::IpAddr), Status> {
    let (name, rest) = get_ifname(data)?;
    let (ip, _) = get_opt_ip(rest)?;
    Ok((name, ip.ok_or(Status::InvalidArgs)?))
}

pub fn encode_ifname_addr2(
    name: &str,
    addr: std::net::IpAddr,
    netmask: std::net::IpAddr,
) -> Vec<u8> {
    let mut buf = Vec::new();
    put_ifname(&mut buf, name);
    put_opt_ip(&mut buf, Some(addr));
    put_opt_ip(&mut buf, Some(netmask));
    buf
}

pub fn decode_ifname_addr2(
    data: &[u8],
) -> Result<(String, std::net::IpAddr, std::net::IpAddr), Status> {
    let (name, rest) = get_ifname(data)?;
    let (addr, rest) = get_opt_ip(rest)?;
    let (netmask, _) = get_opt_ip(rest)?;
    Ok((
        name,
        addr.ok_or(Status::InvalidArgs)?,
        netmask.ok_or(Status::InvalidArgs)?,
    ))
}

pub fn encode_ifname_flag(name: &str, flag: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    put_ifname(&mut buf, name);
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, flag as u32);
    buf.extend_from_slice(&word);
    buf
}

pub fn decode_ifname_flag(data: &[u8]) -> Result<(String, bool), Status> {
    let (name, rest) = get_ifname(data)?;
    if rest.len() < 4 {
        return Err(Status::InvalidArgs);
    }
    Ok((name, LittleEndian::read_u32(&rest[0..4]) != 0))
}

pub fn encode_flag(flag: bool) -> Vec<u8> {
    let mut word = vec![0u8; 4];
    LittleEndian::write_u32(&mut word, flag as u32);
    word
}

pub fn decode_flag(data: &[u8]) -> Result<bool, Status> {
    if data.len() < 4 {
        return Err(Status::InvalidArgs);
    }
    Ok(LittleEndian::read_u32(&data[0..4]) != 0)
}

pub fn encode_ip(addr: std::net::IpAddr) -> Vec<u8> {
    let mut buf = Vec::new();
    put_opt_ip(&mut buf, Some(addr));
    buf
}

pub fn decode_ip(data: &[u8]) -> Result<std::net::IpAddr, Status> {
    let (ip, _) = get_opt_ip(data)?;
    ip.ok_or(Status::InvalidArgs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let mut msg = Message::with_data(OpCode::Connect, vec![1, 2, 3]);
        msg.arg = -7;
        msg.arg2 = 1 << 40;
        let back = Message::decode(msg.encode()).unwrap();
        assert_eq!(back.op, OpCode::Connect.raw());
        assert_eq!(back.arg, -7);
        assert_eq!(back.arg2, 1 << 40);
        assert_eq!(back.data, vec![1, 2, 3]);
    }

    #[test]
    fn message_rejects_bad_length() {
        let msg = Message::with_data(OpCode::Write, vec![0; 4]);
        let mut wire = msg.encode();
        wire.data = wire.data.slice(0..wire.data.len() - 1);
        assert_eq!(Message::decode(wire).unwrap_err(), Status::InvalidArgs);
    }

    #[test]
    fn open_paths() {
        assert_eq!(parse_open_path("none").unwrap(), OpenPath::None);
        assert_eq!(parse_open_path("accept").unwrap(), OpenPath::Accept);
        assert_eq!(
            parse_open_path("socket/2/1/0").unwrap(),
            OpenPath::Socket {
                domain: 2,
                ty: 1,
                protocol: 0
            }
        );
    }

    #[test]
    fn open_path_strictness() {
        // missing fields, trailing garbage, and partial parses all fail
        for bad in [
            "",
            "sock",
            "socket",
            "socket/2",
            "socket/2/1",
            "socket/2/1/",
            "socket/2/1/0/9",
            "socket/2/1/0x",
            "socket/2x/1/0",
            "socket//1/0",
            "socket/2/1/0 ",
            "bogus/2/1/0",
        ] {
            assert_eq!(
                parse_open_path(bad).unwrap_err(),
                Status::InvalidArgs,
                "path {bad:?}"
            );
        }
        let long = format!("socket/{}/1/0", "9".repeat(MAX_PATH));
        assert_eq!(parse_open_path(&long).unwrap_err(), Status::InvalidArgs);
    }

    #[test]
    fn dgram_frame_round_trip() {
        let addr = SockAddr::from_std(&"127.0.0.1:5353".parse().unwrap());
        let frame = encode_dgram(&addr, b"payload");
        assert_eq!(frame.len(), DGRAM_HEADER_SIZE + 7);
        let (back, payload) = decode_dgram(&frame).unwrap();
        assert_eq!(back.to_std(), addr.to_std());
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn dgram_frame_no_address() {
        let frame = encode_dgram(&SockAddr::empty(), b"x");
        let (addr, payload) = decode_dgram(&frame).unwrap();
        assert!(addr.is_empty());
        assert_eq!(payload, b"x");
        assert_eq!(
            decode_dgram(&frame[..DGRAM_HEADER_SIZE - 1]).unwrap_err(),
            Status::InvalidArgs
        );
    }

    #[test]
    fn sockopt_round_trip() {
        let req = SockOptReq {
            level: libc::SOL_SOCKET,
            optname: libc::SO_REUSEADDR,
            optval: vec![1, 0, 0, 0],
        };
        let back = SockOptReq::decode(&req.encode()).unwrap();
        assert_eq!(back.level, libc::SOL_SOCKET);
        assert_eq!(back.optname, libc::SO_REUSEADDR);
        assert_eq!(back.optval, vec![1, 0, 0, 0]);
    }

    #[test]
    fn gai_round_trip() {
        let req = GaiRequest {
            node: Some("localhost".into()),
            service: None,
            hints: Some(Hints {
                flags: 0,
                family: libc::AF_INET,
                socktype: libc::SOCK_STREAM,
                protocol: 0,
            }),
        };
        let back = GaiRequest::decode(&req.encode()).unwrap();
        assert_eq!(back.node.as_deref(), Some("localhost"));
        assert_eq!(back.service, None);
        assert_eq!(back.hints.unwrap().family, libc::AF_INET);

        let reply = GaiReply {
            retval: 0,
            results: vec![AddrInfo {
                family: libc::AF_INET,
                socktype: libc::SOCK_STREAM,
                protocol: 0,
                addr: SockAddr::from_std(&"10.1.2.3:80".parse().unwrap()),
            }],
        };
        let back = GaiReply::decode(&reply.encode()).unwrap();
        assert_eq!(back.retval, 0);
        assert_eq!(back.results.len(), 1);
        assert_eq!(
            back.results[0].addr.to_std(),
            Some("10.1.2.3:80".parse().unwrap())
        );
    }

    #[test]
    fn if_info_round_trip() {
        let infos = vec![IfInfo {
            name: "lo".into(),
            index: 1,
            addr: Some("127.0.0.1".parse().unwrap()),
            netmask: Some("255.0.0.0".parse().unwrap()),
            broadcast: None,
        }];
        let back = decode_if_info(&encode_if_info(&infos)).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].name, "lo");
        assert_eq!(back[0].index, 1);
        assert_eq!(back[0].addr, infos[0].addr);
        assert_eq!(back[0].broadcast, None);
    }

    #[test]
    fn ifname_truncates() {
        let name = decode_ifname(&encode_ifname("a-very-long-interface-name")).unwrap();
        assert_eq!(name.len(), IFNAME_SIZE - 1);
    }
}
