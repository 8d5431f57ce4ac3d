use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;

use super::socket::SockAddr;

/// Hints for [`getaddrinfo`], mirroring `struct addrinfo`'s filter fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hints {
    pub flags: i32,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
}

/// One resolved address.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: SockAddr,
}

/// Why a lookup failed: a host error (errno applies) or a resolver code that
/// travels back to the client in-band.
#[derive(Debug)]
pub enum LookupError {
    System(io::Error),
    Resolver(i32),
}

/// Host name resolution. Blocking; callers accept that for lookup requests.
pub fn getaddrinfo(
    node: Option<&str>,
    service: Option<&str>,
    hints: Option<&Hints>,
) -> Result<Vec<AddrInfo>, LookupError> {
    let to_sys = |e: io::Error| LookupError::System(e);
    let node_c = match node {
        Some(n) => Some(CString::new(n).map_err(|e| to_sys(e.into()))?),
        None => None,
    };
    let service_c = match service {
        Some(s) => Some(CString::new(s).map_err(|e| to_sys(e.into()))?),
        None => None,
    };
    let mut hints_c: libc::addrinfo = unsafe { mem::zeroed() };
    if let Some(h) = hints {
        hints_c.ai_flags = h.flags;
        hints_c.ai_family = h.family;
        hints_c.ai_socktype = h.socktype;
        hints_c.ai_protocol = h.protocol;
    }

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let ret = unsafe {
        libc::getaddrinfo(
            node_c.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
            service_c.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
            if hints.is_some() { &hints_c } else { ptr::null() },
            &mut res,
        )
    };
    if ret != 0 {
        if ret == libc::EAI_SYSTEM {
            return Err(LookupError::System(io::Error::last_os_error()));
        }
        let msg = unsafe { std::ffi::CStr::from_ptr(libc::gai_strerror(ret)) };
        log::debug!("getaddrinfo => {ret} ({})", msg.to_string_lossy());
        return Err(LookupError::Resolver(ret));
    }

    let mut out = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        if !ai.ai_addr.is_null() && ai.ai_addrlen as usize <= super::socket::SOCKADDR_STORAGE_SIZE {
            let bytes = unsafe {
                std::slice::from_raw_parts(ai.ai_addr as *const u8, ai.ai_addrlen as usize)
            };
            if let Some(addr) = SockAddr::from_bytes(bytes) {
                out.push(AddrInfo {
                    family: ai.ai_family,
                    socktype: ai.ai_socktype,
                    protocol: ai.ai_protocol,
                    addr,
                });
            }
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(out)
}
