use std::net::{IpAddr, TcpListener};

use sockmux::client;
use sockmux::net::lookup::Hints;
use sockmux::proto;
use sockmux::{Config, Multiplexer, Status};

fn mux() -> Multiplexer {
    let _ = env_logger::builder().is_test(true).try_init();
    Multiplexer::spawn(Config::new()).unwrap()
}

fn stream_path() -> String {
    format!("socket/{}/{}/0", libc::AF_INET, libc::SOCK_STREAM)
}

#[test]
fn open_rejects_malformed_paths() {
    let mux = mux();
    for bad in [
        "bogus",
        "socket",
        "socket/2",
        "socket/2/1",
        "socket/2/1/0/9",
        "socket/2/1/0x",
        "socket/x/1/0",
    ] {
        assert_eq!(
            client::open(mux.control(), bad).unwrap_err(),
            Status::InvalidArgs,
            "path {bad:?}"
        );
    }
    // recognized but unsupported socket type
    let raw = format!("socket/{}/{}/0", libc::AF_INET, libc::SOCK_RAW);
    assert_eq!(
        client::open(mux.control(), &raw).unwrap_err(),
        Status::NotSupported
    );
    mux.shutdown().unwrap();
}

#[test]
fn bare_socket_resolves_names() {
    let mux = mux();
    let sock = client::open(mux.control(), "none").unwrap();
    assert!(sock.stream().is_none());
    assert!(sock.channel().is_none());

    let hints = Hints {
        flags: libc::AI_NUMERICHOST,
        family: libc::AF_INET,
        socktype: libc::SOCK_STREAM,
        protocol: 0,
    };
    let reply = sock
        .getaddrinfo(Some("127.0.0.1"), None, Some(hints))
        .unwrap();
    assert_eq!(reply.retval, 0);
    // one result only
    assert_eq!(reply.results.len(), 1);
    assert_eq!(
        reply.results[0].addr.ip(),
        Some(IpAddr::V4("127.0.0.1".parse().unwrap()))
    );

    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn sockopt_pass_through() {
    let mux = mux();
    let sock = client::open(mux.control(), &stream_path()).unwrap();
    // option values cross into the kernel, so they travel in native order
    let on = 1i32.to_ne_bytes();
    sock.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, &on)
        .unwrap();
    let val = sock.getsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR).unwrap();
    assert!(val.len() >= 4);
    assert_ne!(i32::from_ne_bytes(val[0..4].try_into().unwrap()), 0);
    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn names_after_connect() {
    let mux = mux();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let _conn = listener.accept().unwrap();
    });

    let sock = client::open(mux.control(), &stream_path()).unwrap();
    assert_eq!(sock.connect_wait(&addr).unwrap(), 0);
    assert_eq!(sock.getpeername().unwrap(), addr);
    let local = sock.getsockname().unwrap();
    assert_eq!(local.ip(), addr.ip());
    assert_ne!(local.port(), 0);

    server.join().unwrap();
    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn netconfig_round_trips() {
    let mux = mux();
    let sock = client::open(mux.control(), "none").unwrap();

    // DNS server assignment
    let dns: IpAddr = "9.9.9.9".parse().unwrap();
    sock.ioctl(proto::IOCTL_SET_DNS_SERVER, proto::encode_ip(dns))
        .unwrap();
    let reply = sock.ioctl(proto::IOCTL_GET_DNS_SERVER, Vec::new()).unwrap();
    assert_eq!(proto::decode_ip(&reply).unwrap(), dns);

    // DHCP status per interface
    sock.ioctl(
        proto::IOCTL_SET_DHCP_STATUS,
        proto::encode_ifname_flag("eth0", true),
    )
    .unwrap();
    let reply = sock
        .ioctl(proto::IOCTL_GET_DHCP_STATUS, proto::encode_ifname("eth0"))
        .unwrap();
    assert!(proto::decode_flag(&reply).unwrap());

    // gateway assignment
    let gw: IpAddr = "192.168.7.1".parse().unwrap();
    sock.ioctl(
        proto::IOCTL_SET_IF_GATEWAY,
        proto::encode_ifname_addr("eth0", gw),
    )
    .unwrap();
    let reply = sock
        .ioctl(proto::IOCTL_GET_IF_GATEWAY, proto::encode_ifname("eth0"))
        .unwrap();
    assert_eq!(proto::decode_ip(&reply).unwrap(), gw);

    // interface enumeration
    let reply = sock.ioctl(proto::IOCTL_GET_IF_INFO, Vec::new()).unwrap();
    let infos = proto::decode_if_info(&reply).unwrap();
    assert!(!infos.is_empty());

    // unknown sub-operation
    assert_eq!(
        sock.ioctl(0xdead, Vec::new()).unwrap_err(),
        Status::InvalidArgs
    );

    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn last_errno_starts_clean() {
    let mux = mux();
    let sock = client::open(mux.control(), &stream_path()).unwrap();
    assert_eq!(sock.so_error().unwrap(), 0);
    sock.close().unwrap();
    mux.shutdown().unwrap();
}
