use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Mutex;

/// Interface names on the wire are fixed-width, NUL-padded.
pub const IFNAME_SIZE: usize = 16;

/// A snapshot of one configured interface address.
#[derive(Debug, Clone, Default)]
pub struct IfInfo {
    pub name: String,
    pub index: u32,
    pub addr: Option<IpAddr>,
    pub netmask: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
}

/// Backend for the network-configuration requests the multiplexer marshals
/// straight through (interface info, addresses, gateway, DHCP, DNS).
pub trait NetConfig: Send {
    fn if_info(&self) -> io::Result<Vec<IfInfo>>;
    fn set_if_addr(&self, name: &str, addr: IpAddr, netmask: IpAddr) -> io::Result<()>;
    fn if_gateway(&self, name: &str) -> io::Result<IpAddr>;
    fn set_if_gateway(&self, name: &str, gateway: IpAddr) -> io::Result<()>;
    fn dhcp_status(&self, name: &str) -> io::Result<bool>;
    fn set_dhcp_status(&self, name: &str, enabled: bool) -> io::Result<()>;
    fn dns_server(&self) -> io::Result<IpAddr>;
    fn set_dns_server(&self, addr: IpAddr) -> io::Result<()>;
}

/// Host-backed implementation: interface enumeration reads the real interface
/// table; gateway, DHCP, and DNS assignments are server state owned here.
pub struct HostNetConfig {
    gateways: Mutex<HashMap<String, IpAddr>>,
    dhcp: Mutex<HashMap<String, bool>>,
    dns: Mutex<Option<IpAddr>>,
}

impl HostNetConfig {
    pub fn new() -> HostNetConfig {
        HostNetConfig {
            gateways: Mutex::new(HashMap::new()),
            dhcp: Mutex::new(HashMap::new()),
            dns: Mutex::new(None),
        }
    }
}

impl Default for HostNetConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn if_index(name: &str) -> u32 {
    match std::ffi::CString::new(name) {
        Ok(c) => unsafe { libc::if_nametoindex(c.as_ptr()) },
        Err(_) => 0,
    }
}

fn broadcast_of(addr: IpAddr, netmask: IpAddr) -> Option<IpAddr> {
    let prefix = ipnet::ip_mask_to_prefix(netmask).ok()?;
    match addr {
        IpAddr::V4(v4) => Some(IpAddr::V4(ipnet::Ipv4Net::new(v4, prefix).ok()?.broadcast())),
        IpAddr::V6(_) => None,
    }
}

impl NetConfig for HostNetConfig {
    fn if_info(&self) -> io::Result<Vec<IfInfo>> {
        let mut out: Vec<IfInfo> = Vec::new();
        for ifa in getifaddrs::getifaddrs()? {
            // one entry per interface; first reported address wins
            if out.iter().any(|i| i.name == ifa.name) {
                continue;
            }
            let broadcast = ifa
                .netmask
                .and_then(|mask| broadcast_of(ifa.address, mask));
            out.push(IfInfo {
                index: if_index(&ifa.name),
                addr: Some(ifa.address),
                netmask: ifa.netmask,
                broadcast,
                name: ifa.name,
            });
        }
        Ok(out)
    }

    #[cfg(target_os = "linux")]
    fn set_if_addr(&self, name: &str, addr: IpAddr, netmask: IpAddr) -> io::Result<()> {
        sys::set_if_addr_v4(name, addr, netmask)
    }

    #[cfg(not(target_os = "linux"))]
    fn set_if_addr(&self, _name: &str, _addr: IpAddr, _netmask: IpAddr) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn if_gateway(&self, name: &str) -> io::Result<IpAddr> {
        self.gateways
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn set_if_gateway(&self, name: &str, gateway: IpAddr) -> io::Result<()> {
        self.gateways
            .lock()
            .unwrap()
            .insert(name.to_string(), gateway);
        Ok(())
    }

    fn dhcp_status(&self, name: &str) -> io::Result<bool> {
        Ok(self.dhcp.lock().unwrap().get(name).copied().unwrap_or(false))
    }

    fn set_dhcp_status(&self, name: &str, enabled: bool) -> io::Result<()> {
        self.dhcp.lock().unwrap().insert(name.to_string(), enabled);
        Ok(())
    }

    fn dns_server(&self) -> io::Result<IpAddr> {
        self.dns
            .lock()
            .unwrap()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn set_dns_server(&self, addr: IpAddr) -> io::Result<()> {
        *self.dns.lock().unwrap() = Some(addr);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::net::IpAddr;

    use nix::{ioctl_write_ptr_bad, libc};

    ioctl_write_ptr_bad!(siocsifaddr, libc::SIOCSIFADDR, libc::ifreq);
    ioctl_write_ptr_bad!(siocsifnetmask, libc::SIOCSIFNETMASK, libc::ifreq);

    fn ifreq_v4(name: &str, addr: IpAddr) -> io::Result<libc::ifreq> {
        let IpAddr::V4(v4) = addr else {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        };
        let name_c = std::ffi::CString::new(name)?;
        if name_c.as_bytes_with_nul().len() > libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        unsafe {
            let mut req: libc::ifreq = mem::zeroed();
            std::ptr::copy_nonoverlapping(
                name_c.as_ptr(),
                req.ifr_name.as_mut_ptr(),
                name_c.as_bytes_with_nul().len(),
            );
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 0,
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.octets()),
                },
                sin_zero: [0; 8],
            };
            std::ptr::copy_nonoverlapping(
                &sin as *const _ as *const u8,
                &mut req.ifr_ifru as *mut _ as *mut u8,
                mem::size_of::<libc::sockaddr_in>(),
            );
            Ok(req)
        }
    }

    pub(super) fn set_if_addr_v4(name: &str, addr: IpAddr, netmask: IpAddr) -> io::Result<()> {
        let ctl = crate::net::fd::Fd::new(unsafe {
            libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0)
        })?;
        let addr_req = ifreq_v4(name, addr)?;
        unsafe { siocsifaddr(ctl.inner, &addr_req) }.map_err(io::Error::from)?;
        let mask_req = ifreq_v4(name, netmask)?;
        unsafe { siocsifnetmask(ctl.inner, &mask_req) }.map_err(io::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn stored_assignments_round_trip() {
        let cfg = HostNetConfig::new();
        assert!(cfg.if_gateway("eth0").is_err());
        cfg.set_if_gateway("eth0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();
        assert_eq!(
            cfg.if_gateway("eth0").unwrap(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
        );

        assert!(!cfg.dhcp_status("eth0").unwrap());
        cfg.set_dhcp_status("eth0", true).unwrap();
        assert!(cfg.dhcp_status("eth0").unwrap());

        assert!(cfg.dns_server().is_err());
        cfg.set_dns_server(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
            .unwrap();
        assert_eq!(
            cfg.dns_server().unwrap(),
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))
        );
    }

    #[test]
    fn broadcast_math() {
        let b = broadcast_of(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)),
            IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)),
        );
        assert_eq!(b, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 255))));
    }

    #[test]
    fn loopback_is_enumerated() {
        let cfg = HostNetConfig::new();
        let infos = cfg.if_info().unwrap();
        assert!(infos.iter().any(|i| i.addr
            .map(|a| a.is_loopback())
            .unwrap_or(false)));
    }
}
