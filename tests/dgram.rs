use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use sockmux::client;
use sockmux::{Config, Multiplexer};

fn mux() -> Multiplexer {
    let _ = env_logger::builder().is_test(true).try_init();
    Multiplexer::spawn(Config::new()).unwrap()
}

fn dgram_path() -> String {
    format!("socket/{}/{}/0", libc::AF_INET, libc::SOCK_DGRAM)
}

#[test]
fn datagram_fanout_preserves_order_and_sources() {
    let mux = mux();
    let sock = client::open(mux.control(), &dgram_path()).unwrap();
    sock.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = sock.getsockname().unwrap();

    let peers: Vec<UdpSocket> = (0..3)
        .map(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
        .collect();
    let payloads: [&[u8]; 3] = [b"one", b"two", b"three"];
    for (peer, payload) in peers.iter().zip(payloads) {
        peer.send_to(payload, addr).unwrap();
        // keep arrival order deterministic on loopback
        thread::sleep(Duration::from_millis(30));
    }

    for (peer, payload) in peers.iter().zip(payloads) {
        let (got, from) = sock.recv_from().unwrap();
        assert_eq!(got, payload);
        assert_eq!(from, Some(peer.local_addr().unwrap()));
    }

    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn datagram_send_carries_framed_address() {
    let mux = mux();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let sock = client::open(mux.control(), &dgram_path()).unwrap();
    sock.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = sock.getsockname().unwrap();

    sock.send_to(b"hello", Some(&peer_addr)).unwrap();
    let mut buf = [0u8; 32];
    let (n, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(from, addr);

    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn empty_datagram_is_not_a_disconnect() {
    let mux = mux();
    let sock = client::open(mux.control(), &dgram_path()).unwrap();
    sock.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = sock.getsockname().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"", addr).unwrap();
    peer.send_to(b"after", addr).unwrap();

    let (first, from) = sock.recv_from().unwrap();
    assert!(first.is_empty());
    assert_eq!(from, Some(peer.local_addr().unwrap()));
    let (second, _) = sock.recv_from().unwrap();
    assert_eq!(second, b"after");

    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn connected_datagram_send_without_address() {
    let mux = mux();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let sock = client::open(mux.control(), &dgram_path()).unwrap();
    sock.connect(&peer_addr).unwrap();
    sock.send_to(b"direct", None).unwrap();

    let mut buf = [0u8; 32];
    let (n, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"direct");

    sock.close().unwrap();
    mux.shutdown().unwrap();
}
