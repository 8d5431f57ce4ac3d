use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

/// A `sockaddr_storage` carrier for addresses crossing the wire.
///
/// `len == 0` means "no address" (used by unconnected datagram sends).
#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

pub const SOCKADDR_STORAGE_SIZE: usize = mem::size_of::<libc::sockaddr_storage>();

impl SockAddr {
    pub fn empty() -> SockAddr {
        SockAddr {
            storage: unsafe { mem::zeroed() },
            len: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<SockAddr> {
        if bytes.len() > SOCKADDR_STORAGE_SIZE {
            return None;
        }
        let mut addr = SockAddr::empty();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut addr.storage as *mut _ as *mut u8,
                bytes.len(),
            );
        }
        addr.len = bytes.len() as libc::socklen_t;
        Some(addr)
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(&self.storage as *const _ as *const u8, self.len as usize)
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn family(&self) -> libc::sa_family_t {
        self.storage.ss_family
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    pub(crate) fn capacity() -> libc::socklen_t {
        SOCKADDR_STORAGE_SIZE as libc::socklen_t
    }

    pub(crate) fn set_len(&mut self, len: libc::socklen_t) {
        self.len = len;
    }

    pub fn from_std(addr: &SocketAddr) -> SockAddr {
        let mut out = SockAddr::empty();
        match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        &sin as *const _ as *const u8,
                        &mut out.storage as *mut _ as *mut u8,
                        mem::size_of::<libc::sockaddr_in>(),
                    );
                }
                out.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        &sin6 as *const _ as *const u8,
                        &mut out.storage as *mut _ as *mut u8,
                        mem::size_of::<libc::sockaddr_in6>(),
                    );
                }
                out.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }
        out
    }

    pub fn to_std(&self) -> Option<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET if self.len as usize >= mem::size_of::<libc::sockaddr_in>() => {
                let sin: &libc::sockaddr_in =
                    unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddr::V4(SocketAddrV4::new(
                    ip,
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 if self.len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
                let sin6: &libc::sockaddr_in6 =
                    unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    pub fn from_ip(ip: IpAddr) -> SockAddr {
        SockAddr::from_std(&SocketAddr::new(ip, 0))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.to_std().map(|a| a.ip())
    }
}

impl std::fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_std() {
            Some(addr) => write!(f, "SockAddr({addr})"),
            None => write!(f, "SockAddr(family={}, len={})", self.family(), self.len),
        }
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_len(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    cvt(unsafe { libc::socket(domain, ty, protocol) })
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let mut nonblocking: libc::c_int = 1;
    cvt(unsafe { libc::ioctl(fd, libc::FIONBIO, &mut nonblocking) }).map(|_| ())
}

pub fn connect(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    cvt(unsafe { libc::connect(fd, addr.as_ptr(), addr.len() as libc::socklen_t) }).map(|_| ())
}

pub fn bind(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    cvt(unsafe { libc::bind(fd, addr.as_ptr(), addr.len() as libc::socklen_t) }).map(|_| ())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) }).map(|_| ())
}

pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    // the peer address is fetched later via getpeername
    cvt(unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) })
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_len(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_len(unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) })
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    let mut addr = SockAddr::empty();
    let mut addrlen = SockAddr::capacity();
    let n = cvt_len(unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            0,
            addr.as_mut_ptr(),
            &mut addrlen,
        )
    })?;
    addr.set_len(addrlen.min(SockAddr::capacity()));
    Ok((n, addr))
}

pub fn sendto(fd: RawFd, buf: &[u8], addr: Option<&SockAddr>) -> io::Result<usize> {
    let (ptr, len) = match addr {
        Some(a) => (a.as_ptr(), a.len() as libc::socklen_t),
        None => (std::ptr::null(), 0),
    };
    cvt_len(unsafe { libc::sendto(fd, buf.as_ptr() as *const _, buf.len(), 0, ptr, len) })
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::shutdown(fd, libc::SHUT_WR) }).map(|_| ())
}

pub fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

pub fn getsockname(fd: RawFd) -> io::Result<SockAddr> {
    let mut addr = SockAddr::empty();
    let mut addrlen = SockAddr::capacity();
    cvt(unsafe { libc::getsockname(fd, addr.as_mut_ptr(), &mut addrlen) })?;
    addr.set_len(addrlen.min(SockAddr::capacity()));
    Ok(addr)
}

pub fn getpeername(fd: RawFd) -> io::Result<SockAddr> {
    let mut addr = SockAddr::empty();
    let mut addrlen = SockAddr::capacity();
    cvt(unsafe { libc::getpeername(fd, addr.as_mut_ptr(), &mut addrlen) })?;
    addr.set_len(addrlen.min(SockAddr::capacity()));
    Ok(addr)
}

pub fn getsockopt_raw(fd: RawFd, level: i32, optname: i32, optval: &mut [u8]) -> io::Result<usize> {
    let mut optlen = optval.len() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            level,
            optname,
            optval.as_mut_ptr() as *mut _,
            &mut optlen,
        )
    })?;
    Ok(optlen as usize)
}

pub fn setsockopt_raw(fd: RawFd, level: i32, optname: i32, optval: &[u8]) -> io::Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            optval.as_ptr() as *const _,
            optval.len() as libc::socklen_t,
        )
    })
    .map(|_| ())
}

/// `getsockopt(SOL_SOCKET, SO_ERROR)`: the pending socket error, consumed.
pub fn so_error(fd: RawFd) -> io::Result<i32> {
    let mut val: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut val as *mut _ as *mut _,
            &mut len,
        )
    })?;
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_std_round_trip_v4() {
        let std_addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let addr = SockAddr::from_std(&std_addr);
        assert_eq!(addr.family(), libc::AF_INET as libc::sa_family_t);
        assert_eq!(addr.to_std(), Some(std_addr));
        let copied = SockAddr::from_bytes(addr.as_bytes()).unwrap();
        assert_eq!(copied.to_std(), Some(std_addr));
    }

    #[test]
    fn sockaddr_std_round_trip_v6() {
        let std_addr: SocketAddr = "[::1]:443".parse().unwrap();
        let addr = SockAddr::from_std(&std_addr);
        assert_eq!(addr.family(), libc::AF_INET6 as libc::sa_family_t);
        assert_eq!(addr.to_std(), Some(std_addr));
    }

    #[test]
    fn empty_sockaddr() {
        let addr = SockAddr::empty();
        assert!(addr.is_empty());
        assert_eq!(addr.to_std(), None);
        assert!(SockAddr::from_bytes(&[0u8; SOCKADDR_STORAGE_SIZE + 1]).is_none());
    }
}
