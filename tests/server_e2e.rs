//! End-to-end protocol scenarios against a live server.
//!
//! Each test binds a server on an ephemeral port inside the test runtime
//! and talks to it over a plain blocking TCP socket, byte-for-byte.

use kvi::{Config, HashSeed, LogLevel, Server, VERSION};
use std::collections::BTreeSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

async fn start_server(shards: usize) -> SocketAddr {
    let config = Config {
        ips: vec![Ipv4Addr::LOCALHOST.into()],
        port: 0,
        shards,
        accepters: 1,
        loglevel: LogLevel::None,
    };
    let server = Arc::new(
        Server::bind_seeded(config, HashSeed::new(0xfeed, 0xbeef))
            .await
            .expect("bind"),
    );
    let addr = server.local_addrs()[0];
    tokio::spawn(server.run());
    addr
}

/// A blocking RESP client speaking raw bytes.
struct TestClient {
    stream: BufReader<TcpStream>,
}

impl TestClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        Self {
            stream: BufReader::new(stream),
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).expect("send");
    }

    fn recv(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).expect("recv");
        buf
    }

    fn expect(&mut self, want: &[u8]) {
        let got = self.recv(want.len());
        assert_eq!(
            got,
            want,
            "got {:?}, want {:?}",
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(want)
        );
    }

    /// Read one CRLF-terminated line, without the terminator.
    fn recv_line(&mut self) -> String {
        let mut line = Vec::new();
        self.stream.read_until(b'\n', &mut line).expect("recv line");
        assert!(line.ends_with(b"\r\n"), "unterminated line {line:?}");
        line.truncate(line.len() - 2);
        String::from_utf8(line).expect("utf8 line")
    }

    /// True once the peer has closed the connection.
    fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0))
    }

    fn expect_hello_reply(&mut self) {
        let want = format!(
            "%3\r\n$6\r\nserver\r\n$3\r\nkvi\r\n$7\r\nversion\r\n${}\r\n{}\r\n$5\r\nproto\r\n:3\r\n",
            VERSION.len(),
            VERSION
        );
        self.expect(want.as_bytes());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_succeeds_and_connection_stays_open() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*1\r\n$5\r\nHELLO\r\n$1\r\n3\r\n");
    client.expect_hello_reply();

    // Still serving afterwards.
    client.send(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    client.expect(b"$-1\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_with_wrong_version_disconnects() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*1\r\n$5\r\nHELLO\r\n$1\r\n2\r\n");
    client.expect(b"-ERR unsupported protocol version '2'\r\n");
    assert!(client.at_eof(), "connection should be closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_then_get_round_trips() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    client.send(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    client.expect(b"+OK\r\n$3\r\nbar\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_of_absent_key_is_nil() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    client.expect(b"$-1\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn del_reports_presence_and_removes() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n");
    client.send(b"*2\r\n$3\r\nDEL\r\n$1\r\na\r\n");
    client.send(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
    client.expect(b"+OK\r\n:1\r\n$-1\r\n");

    client.send(b"*2\r\n$3\r\nDEL\r\n$1\r\na\r\n");
    client.expect(b":0\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keys_collects_across_all_shards() {
    let addr = start_server(4).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$1\r\n1\r\n");
    client.send(b"*3\r\n$3\r\nSET\r\n$3\r\nbar\r\n$1\r\n2\r\n");
    client.send(b"*3\r\n$3\r\nSET\r\n$3\r\nbaz\r\n$1\r\n3\r\n");
    client.send(b"*3\r\n$3\r\nSET\r\n$4\r\nquix\r\n$1\r\n4\r\n");
    client.expect(b"+OK\r\n+OK\r\n+OK\r\n+OK\r\n");

    client.send(b"*1\r\n$4\r\nKEYS\r\n");
    assert_eq!(client.recv_line(), "*4");
    let mut names = BTreeSet::new();
    for _ in 0..4 {
        let header = client.recv_line();
        let len: usize = header.strip_prefix('$').expect("bulk header").parse().unwrap();
        let mut payload = client.recv(len + 2);
        payload.truncate(len);
        names.insert(String::from_utf8(payload).unwrap());
    }
    let want: BTreeSet<String> = ["foo", "bar", "baz", "quix"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, want);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_command_is_soft() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*1\r\n$3\r\nFOO\r\n");
    client.expect(b"-ERR the command FOO is invalid\r\n");

    // Same connection keeps working.
    client.send(b"*1\r\n$5\r\nHELLO\r\n$1\r\n3\r\n");
    client.expect_hello_reply();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_command_arguments_are_drained() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*3\r\n$3\r\nFOO\r\n$3\r\nabc\r\n$3\r\ndef\r\n");
    client.expect(b"-ERR the command FOO is invalid\r\n");

    client.send(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    client.send(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    client.expect(b"+OK\r\n$1\r\nv\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn several_commands_share_one_pipeline_frame() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    client.expect(b"+OK\r\n$1\r\nv\r\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn megabyte_values_survive_the_trip() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    let payload = vec![b'v'; 1024 * 1024];
    let mut frame = format!("*3\r\n$3\r\nSET\r\n$3\r\nbig\r\n${}\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(b"\r\n");
    client.send(&frame);
    client.expect(b"+OK\r\n");

    client.send(b"*2\r\n$3\r\nGET\r\n$3\r\nbig\r\n");
    let mut want = format!("${}\r\n", payload.len()).into_bytes();
    want.extend_from_slice(&payload);
    want.extend_from_slice(b"\r\n");
    client.expect(&want);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn syntax_violations_disconnect_after_reporting() {
    let addr = start_server(2).await;
    let mut client = TestClient::connect(addr);

    client.send(b"*2\r\n$3\r\nGET\r\n:5\r\n");
    client.expect(b"-ERR the syntax is invalid\r\n");
    assert!(client.at_eof(), "connection should be closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keys_routed_to_every_shard_come_back() {
    // Enough keys that all shards almost surely own at least one.
    let addr = start_server(4).await;
    let mut client = TestClient::connect(addr);

    for i in 0..64 {
        let key = format!("key:{i}");
        let frame = format!("*3\r\n$3\r\nSET\r\n${}\r\n{key}\r\n$1\r\nx\r\n", key.len());
        client.send(frame.as_bytes());
        client.expect(b"+OK\r\n");
    }

    client.send(b"*1\r\n$4\r\nKEYS\r\n");
    assert_eq!(client.recv_line(), "*64");
    let mut names = BTreeSet::new();
    for _ in 0..64 {
        let header = client.recv_line();
        let len: usize = header.strip_prefix('$').expect("bulk header").parse().unwrap();
        let mut payload = client.recv(len + 2);
        payload.truncate(len);
        names.insert(String::from_utf8(payload).unwrap());
    }
    assert_eq!(names.len(), 64);
    for i in 0..64 {
        assert!(names.contains(&format!("key:{i}")), "key:{i} missing");
    }
}
