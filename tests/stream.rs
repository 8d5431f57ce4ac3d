use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use sockmux::client::{self, RemoteSocket};
use sockmux::ipc::Signals;
use sockmux::{Config, Multiplexer, Status};

fn mux() -> Multiplexer {
    let _ = env_logger::builder().is_test(true).try_init();
    Multiplexer::spawn(Config::new()).unwrap()
}

fn stream_path() -> String {
    format!("socket/{}/{}/0", libc::AF_INET, libc::SOCK_STREAM)
}

fn recv_exact(sock: &RemoteSocket, want: &mut [u8]) {
    let mut got = 0;
    while got < want.len() {
        let n = sock.recv(&mut want[got..]).unwrap();
        assert!(n > 0, "unexpected end of stream after {got} bytes");
        got += n;
    }
}

#[test]
fn stream_echo() {
    let mux = mux();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).unwrap();
        conn.write_all(&buf[..n]).unwrap();
    });

    let sock = client::open(mux.control(), &stream_path()).unwrap();
    assert_eq!(sock.connect_wait(&addr).unwrap(), 0);
    sock.send(b"abc").unwrap();
    let mut buf = [0u8; 3];
    recv_exact(&sock, &mut buf);
    assert_eq!(&buf, b"abc");
    assert_eq!(sock.so_error().unwrap(), 0);

    server.join().unwrap();
    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn connect_to_closed_port() {
    let mux = mux();
    // grab a port that nothing listens on
    let addr = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let sock = client::open(mux.control(), &stream_path()).unwrap();
    match sock.connect_wait(&addr) {
        // connect reported in-progress, then the attempt resolved
        Ok(code) => assert_eq!(code, libc::ECONNREFUSED),
        // or the host refused synchronously
        Err(Status::Io) => {}
        Err(e) => panic!("unexpected connect error: {e}"),
    }
    assert_eq!(sock.so_error().unwrap(), libc::ECONNREFUSED);
    // the connection never came up
    let signals = sock.stream().unwrap().signals();
    assert!(!signals.contains(Signals::CONNECTED));

    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn half_close_drains_in_flight_bytes() {
    let mux = mux();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        // read to EOF proves the multiplexer shut down its write side
        let mut all = Vec::new();
        conn.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"abc");
        conn.write_all(b"tail").unwrap();
    });

    let sock = client::open(mux.control(), &stream_path()).unwrap();
    assert_eq!(sock.connect_wait(&addr).unwrap(), 0);
    sock.send(b"abc").unwrap();
    sock.half_close().unwrap();

    // reads keep working after our half-close
    let mut buf = [0u8; 4];
    recv_exact(&sock, &mut buf);
    assert_eq!(&buf, b"tail");
    // server closed after "tail": end of stream
    let mut rest = [0u8; 4];
    assert_eq!(sock.recv(&mut rest).unwrap(), 0);

    server.join().unwrap();
    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn backpressure_is_bounded_and_lossless() {
    const TOTAL: usize = 1024 * 1024;
    let mux = mux();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let chunk: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        let mut sent = 0;
        while sent < TOTAL {
            conn.write_all(&chunk).unwrap();
            sent += chunk.len();
        }
    });

    let sock = client::open(mux.control(), &stream_path()).unwrap();
    assert_eq!(sock.connect_wait(&addr).unwrap(), 0);
    // stop reading for a while; the data transport and one scratch buffer
    // fill up and the multiplexer parks instead of buffering more
    thread::sleep(Duration::from_millis(300));

    let mut received = 0usize;
    let mut buf = vec![0u8; 16 * 1024];
    while received < TOTAL {
        let n = sock.recv(&mut buf).unwrap();
        assert!(n > 0, "short stream: {received} of {TOTAL}");
        for (i, &b) in buf[..n].iter().enumerate() {
            assert_eq!(b, ((received + i) % 4096) as u8);
        }
        received += n;
    }
    assert_eq!(received, TOTAL);

    server.join().unwrap();
    sock.close().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn close_with_queued_work() {
    let mux = mux();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        // the multiplexer closed the host socket: EOF, no bytes
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
    });

    let sock = client::open(mux.control(), &stream_path()).unwrap();
    assert_eq!(sock.connect_wait(&addr).unwrap(), 0);
    // a read continuation is parked on network readiness now; close anyway
    let pipe = sock.stream().unwrap().clone();
    sock.close().unwrap();

    // the dispatcher dropped its data transport end
    let observed = pipe
        .wait_signals(Signals::PEER_CLOSED, Some(Duration::from_secs(10)))
        .unwrap();
    assert!(observed.contains(Signals::PEER_CLOSED));

    server.join().unwrap();
    mux.shutdown().unwrap();
}

#[test]
fn listen_accept_and_exchange() {
    let mux = mux();
    let sock = client::open(mux.control(), &stream_path()).unwrap();
    sock.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    sock.listen(8).unwrap();
    let addr = sock.getsockname().unwrap();

    let peer = thread::spawn(move || {
        let mut conn = TcpStream::connect(addr).unwrap();
        conn.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    });

    // an inbound connection raises INCOMING on the listener's data transport
    let observed = sock
        .stream()
        .unwrap()
        .wait_signals(Signals::INCOMING, Some(Duration::from_secs(10)))
        .unwrap();
    assert!(observed.contains(Signals::INCOMING));

    let conn = sock.accept().unwrap();
    let mut buf = [0u8; 4];
    recv_exact(&conn, &mut buf);
    assert_eq!(&buf, b"ping");
    conn.send(b"pong").unwrap();
    assert_eq!(conn.getpeername().unwrap().ip(), addr.ip());

    peer.join().unwrap();
    conn.close().unwrap();
    sock.close().unwrap();
    mux.shutdown().unwrap();
}
