//! End-to-end tests for the text protocol over TCP and UDP.
//!
//! Each test boots a real server on an ephemeral port, talks to it with
//! plain sockets, and shuts it down through the shutdown flag.

use scattercache::config::Settings;
use scattercache::runtime;
use scattercache::storage::Store;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct TestServer {
    tcp: SocketAddr,
    udp: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start() -> TestServer {
        let tcp_port = get_available_port();
        let udp_port = get_available_port();

        let settings = Settings {
            port: tcp_port,
            udpport: udp_port,
            interface: "127.0.0.1".parse().unwrap(),
            num_workers: 2,
            maxconns: 64,
            ..Settings::default()
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let store = Store::new(settings.maxbytes, settings.evict_to_free);
            let _ = runtime::run(Arc::new(settings), store, shutdown_flag);
        });

        let server = TestServer {
            tcp: SocketAddr::new("127.0.0.1".parse().unwrap(), tcp_port),
            udp: SocketAddr::new("127.0.0.1".parse().unwrap(), udp_port),
            shutdown,
            handle: Some(handle),
        };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if TcpStream::connect_timeout(&self.tcp, Duration::from_millis(50)).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("server did not come up on {}", self.tcp);
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.tcp).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // the dispatcher notices on its next 1s tick; don't block the test
        // suite waiting for it
        thread::sleep(Duration::from_millis(50));
        drop(self.handle.take());
    }
}

/// Send bytes, then read until the reply ends with `terminator`.
fn roundtrip(stream: &mut TcpStream, request: &[u8], terminator: &[u8]) -> Vec<u8> {
    stream.write_all(request).unwrap();
    read_until(stream, terminator)
}

fn read_until(stream: &mut TcpStream, terminator: &[u8]) -> Vec<u8> {
    let mut reply = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed while waiting for {terminator:?}");
        reply.extend_from_slice(&chunk[..n]);
        if reply.ends_with(terminator) {
            return reply;
        }
    }
}

#[test]
fn multi_key_get_streams_hits_in_order() {
    let server = TestServer::start();
    let mut c = server.connect();

    assert_eq!(
        roundtrip(&mut c, b"set a 0 0 1\r\n1\r\n", b"\r\n"),
        b"STORED\r\n"
    );
    assert_eq!(
        roundtrip(&mut c, b"set b 0 0 1\r\n2\r\n", b"\r\n"),
        b"STORED\r\n"
    );

    let reply = roundtrip(&mut c, b"get a b c\r\n", b"END\r\n");
    assert_eq!(
        reply,
        b"VALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\n"
    );
}

#[test]
fn set_overwrites_and_roundtrips_binary_values() {
    let server = TestServer::start();
    let mut c = server.connect();

    let value: Vec<u8> = (0..=255u8).filter(|&b| b != b'\r' && b != b'\n').collect();
    let mut request = format!("set blob 7 0 {}\r\n", value.len()).into_bytes();
    request.extend_from_slice(&value);
    request.extend_from_slice(b"\r\n");
    assert_eq!(roundtrip(&mut c, &request, b"\r\n"), b"STORED\r\n");

    let reply = roundtrip(&mut c, b"get blob\r\n", b"END\r\n");
    let mut expected = format!("VALUE blob 7 {}\r\n", value.len()).into_bytes();
    expected.extend_from_slice(&value);
    expected.extend_from_slice(b"\r\nEND\r\n");
    assert_eq!(reply, expected);

    assert_eq!(
        roundtrip(&mut c, b"set blob 0 0 1\r\nz\r\n", b"\r\n"),
        b"STORED\r\n"
    );
    assert_eq!(
        roundtrip(&mut c, b"get blob\r\n", b"END\r\n"),
        b"VALUE blob 0 1\r\nz\r\nEND\r\n"
    );
}

#[test]
fn replace_needs_an_existing_item_and_add_a_missing_one() {
    let server = TestServer::start();
    let mut c = server.connect();

    assert_eq!(
        roundtrip(&mut c, b"replace x 0 0 3\r\nfoo\r\n", b"\r\n"),
        b"NOT_STORED\r\n"
    );
    assert_eq!(
        roundtrip(&mut c, b"add x 0 0 3\r\nfoo\r\n", b"\r\n"),
        b"STORED\r\n"
    );
    assert_eq!(
        roundtrip(&mut c, b"add x 0 0 3\r\nbar\r\n", b"\r\n"),
        b"NOT_STORED\r\n"
    );
    assert_eq!(
        roundtrip(&mut c, b"replace x 0 0 3\r\nbar\r\n", b"\r\n"),
        b"STORED\r\n"
    );
}

#[test]
fn arithmetic_wraps_up_and_saturates_down() {
    let server = TestServer::start();
    let mut c = server.connect();

    assert_eq!(
        roundtrip(&mut c, b"set k 0 0 1\r\n9\r\n", b"\r\n"),
        b"STORED\r\n"
    );
    assert_eq!(roundtrip(&mut c, b"incr k 2\r\n", b"\r\n"), b"11\r\n");
    assert_eq!(roundtrip(&mut c, b"decr k 100\r\n", b"\r\n"), b"0\r\n");
    assert_eq!(
        roundtrip(&mut c, b"incr missing 1\r\n", b"\r\n"),
        b"NOT_FOUND\r\n"
    );
}

#[test]
fn deferred_delete_hides_the_key_and_blocks_add() {
    let server = TestServer::start();
    let mut c = server.connect();

    assert_eq!(
        roundtrip(&mut c, b"set d 0 0 1\r\nX\r\n", b"\r\n"),
        b"STORED\r\n"
    );
    assert_eq!(roundtrip(&mut c, b"delete d 5\r\n", b"\r\n"), b"DELETED\r\n");

    // immediately invisible, and add can't take the key
    assert_eq!(roundtrip(&mut c, b"get d\r\n", b"END\r\n"), b"END\r\n");
    assert_eq!(
        roundtrip(&mut c, b"add d 0 0 1\r\nY\r\n", b"\r\n"),
        b"NOT_STORED\r\n"
    );

    // but set overrides the delete lock
    assert_eq!(
        roundtrip(&mut c, b"set d 0 0 1\r\nZ\r\n", b"\r\n"),
        b"STORED\r\n"
    );
    assert_eq!(
        roundtrip(&mut c, b"get d\r\n", b"END\r\n"),
        b"VALUE d 0 1\r\nZ\r\nEND\r\n"
    );
}

#[test]
fn immediate_delete_frees_the_key() {
    let server = TestServer::start();
    let mut c = server.connect();

    assert_eq!(
        roundtrip(&mut c, b"set gone 0 0 1\r\nv\r\n", b"\r\n"),
        b"STORED\r\n"
    );
    assert_eq!(roundtrip(&mut c, b"delete gone\r\n", b"\r\n"), b"DELETED\r\n");
    assert_eq!(
        roundtrip(&mut c, b"delete gone\r\n", b"\r\n"),
        b"NOT_FOUND\r\n"
    );
    assert_eq!(
        roundtrip(&mut c, b"add gone 0 0 1\r\nw\r\n", b"\r\n"),
        b"STORED\r\n"
    );
}

#[test]
fn oversize_keys_are_rejected() {
    let server = TestServer::start();
    let mut c = server.connect();

    let mut request = b"get ".to_vec();
    request.extend_from_slice(&[b'k'; 251]);
    request.extend_from_slice(b"\r\n");
    assert_eq!(
        roundtrip(&mut c, &request, b"\r\n"),
        b"CLIENT_ERROR bad command line format\r\n"
    );

    // the connection stays usable
    assert_eq!(roundtrip(&mut c, b"get a\r\n", b"END\r\n"), b"END\r\n");
}

#[test]
fn unknown_commands_and_bad_arguments_answer_errors() {
    let server = TestServer::start();
    let mut c = server.connect();

    assert_eq!(roundtrip(&mut c, b"frobnicate\r\n", b"\r\n"), b"ERROR\r\n");
    // out-of-range numbers are malformed; the 99... overflows a long
    assert_eq!(
        roundtrip(
            &mut c,
            b"set k 0 0 99999999999999999999\r\n",
            b"\r\n"
        ),
        b"CLIENT_ERROR bad command line format\r\n"
    );
    assert_eq!(roundtrip(&mut c, b"version\r\n", b"\r\n"), {
        let mut v = b"VERSION ".to_vec();
        v.extend_from_slice(env!("CARGO_PKG_VERSION").as_bytes());
        v.extend_from_slice(b"\r\n");
        v
    });
}

#[test]
fn bad_data_chunk_keeps_the_connection_open() {
    let server = TestServer::start();
    let mut c = server.connect();

    // declared 3 bytes but the terminator lands early
    assert_eq!(
        roundtrip(&mut c, b"set k 0 0 3\r\nab\r\nx", b"\r\n"),
        b"CLIENT_ERROR bad data chunk\r\n"
    );
    assert_eq!(
        roundtrip(&mut c, b"\r\nset k 0 0 1\r\ny\r\n", b"STORED\r\n"),
        b"ERROR\r\nSTORED\r\n"
    );
}

#[test]
fn pipelined_commands_are_answered_in_order() {
    let server = TestServer::start();
    let mut c = server.connect();

    let reply = roundtrip(
        &mut c,
        b"set p 0 0 1\r\n1\r\nincr p 1\r\nget p\r\n",
        b"END\r\n",
    );
    assert_eq!(reply, b"STORED\r\n2\r\nVALUE p 0 1\r\n2\r\nEND\r\n");
}

#[test]
fn quit_closes_the_connection() {
    let server = TestServer::start();
    let mut c = server.connect();

    c.write_all(b"quit\r\n").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(c.read(&mut buf).unwrap(), 0);
}

#[test]
fn flush_all_expires_everything() {
    let server = TestServer::start();
    let mut c = server.connect();

    assert_eq!(
        roundtrip(&mut c, b"set f 0 0 1\r\n1\r\n", b"\r\n"),
        b"STORED\r\n"
    );
    // the flush horizon has one-second granularity; items stored in the
    // same second as the flush survive it
    thread::sleep(Duration::from_millis(1200));
    assert_eq!(roundtrip(&mut c, b"flush_all\r\n", b"\r\n"), b"OK\r\n");
    assert_eq!(roundtrip(&mut c, b"get f\r\n", b"END\r\n"), b"END\r\n");
    // keys are reusable after the flush
    assert_eq!(
        roundtrip(&mut c, b"add f 0 0 1\r\n2\r\n", b"\r\n"),
        b"STORED\r\n"
    );
}

#[test]
fn stats_emits_stat_lines_and_end() {
    let server = TestServer::start();
    let mut c = server.connect();

    let reply = roundtrip(&mut c, b"stats\r\n", b"END\r\n");
    let text = String::from_utf8(reply).unwrap();
    assert!(text.starts_with("STAT pid "));
    assert!(text.contains("STAT curr_items 0\r\n"));
    assert!(text.contains("STAT threads 3\r\n"));
}

fn udp_request(sock: &UdpSocket, server: &TestServer, id: u16, count: u8, body: &[u8]) -> Vec<u8> {
    let mut datagram = vec![
        (id >> 8) as u8,
        (id & 0xff) as u8,
        0,
        0,
        0,
        count,
        0,
        0,
    ];
    datagram.extend_from_slice(body);
    sock.send_to(&datagram, server.udp).unwrap();

    let mut reply = [0u8; 2048];
    let (n, _) = sock.recv_from(&mut reply).unwrap();
    reply[..n].to_vec()
}

#[test]
fn udp_replies_echo_the_request_id() {
    let server = TestServer::start();
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // store over TCP, fetch over UDP
    let mut c = server.connect();
    assert_eq!(
        roundtrip(&mut c, b"set u 0 0 5\r\nhello\r\n", b"\r\n"),
        b"STORED\r\n"
    );

    let reply = udp_request(&sock, &server, 0x0707, 1, b"get u\r\n");
    assert_eq!(&reply[..2], &[0x07, 0x07], "request id echoed");
    assert_eq!(&reply[2..4], &[0, 0], "first fragment");
    assert_eq!(&reply[4..6], &[0, 1], "single-datagram reply");
    assert_eq!(&reply[6..8], &[0, 8], "response line offset");
    assert_eq!(&reply[8..], b"VALUE u 0 5\r\nhello\r\nEND\r\n");
}

#[test]
fn udp_multi_packet_requests_are_rejected() {
    let server = TestServer::start();
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let reply = udp_request(&sock, &server, 7, 2, b"get a\r\n");
    assert_eq!(
        &reply[8..],
        b"SERVER_ERROR multi-packet request not supported\r\n"
    );
}
