//! Stratum server scenarios over real TCP sockets.

use std::io::Write as _;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mw_stratum::protocol::{self, Message, LOGIN_FAILED, SOLUTION_ACCEPTED};
use mw_stratum::server::{FoundBlock, Options, StratumServer};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Time we allow the single-task server to drain already-sent frames.
const SETTLE: Duration = Duration::from_millis(500);

struct Miner {
    lines: Lines<BufReader<ReadHalf<TcpStream>>>,
    writer: WriteHalf<TcpStream>,
}

impl Miner {
    async fn connect(addr: SocketAddr) -> Miner {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = tokio::io::split(stream);
        Miner {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, msg: &Message) {
        self.writer
            .write_all(protocol::encode(msg).as_bytes())
            .await
            .unwrap();
    }

    async fn login(&mut self, key: &str) {
        self.send(&Message::Login {
            id: "login".into(),
            api_key: key.into(),
        })
        .await;
    }

    async fn read_message(&mut self) -> Message {
        let line = timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed");
        protocol::parse(&line).unwrap().expect("known method")
    }

    async fn expect_silence(&mut self) {
        let result = timeout(Duration::from_millis(300), self.lines.next_line()).await;
        assert!(result.is_err(), "expected no frame, got {result:?}");
    }
}

fn pick_addr() -> SocketAddr {
    // Bind to an ephemeral port, remember it, release it for the server.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn write_keys(path: &std::path::Path, keys: &[&str]) {
    let mut file = std::fs::File::create(path).unwrap();
    for key in keys {
        writeln!(file, "{key}").unwrap();
    }
    file.sync_all().unwrap();
}

fn found_channel() -> (
    Box<dyn FnOnce(FoundBlock) + Send>,
    mpsc::UnboundedReceiver<FoundBlock>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Box::new(move |found| {
            let _ = tx.send(found);
        }),
        rx,
    )
}

#[tokio::test]
async fn broadcast_and_first_solution_wins() {
    let dir = tempfile::tempdir().unwrap();
    let keys_path = dir.path().join("api.keys");
    write_keys(&keys_path, &["miner-key-1", "miner-key-2", "miner-key-3"]);

    let addr = pick_addr();
    let mut options = Options::new(addr);
    options.api_keys_path = Some(keys_path);
    let (handle, _task) = StratumServer::spawn(options);
    tokio::time::sleep(SETTLE).await;

    let mut miners = Vec::new();
    for key in ["miner-key-1", "miner-key-2", "miner-key-3"] {
        let mut miner = Miner::connect(addr).await;
        miner.login(key).await;
        miners.push(miner);
    }
    tokio::time::sleep(SETTLE).await;

    // One Job frame per logged-in peer.
    let (on_found, mut found_rx) = found_channel();
    handle
        .new_job("J1", "ab".repeat(32), 0x1234, 77, on_found)
        .unwrap();
    for miner in &mut miners {
        match miner.read_message().await {
            Message::Job { id, height, .. } => {
                assert_eq!(id, "J1");
                assert_eq!(height, 77);
            }
            other => panic!("expected job, got {other:?}"),
        }
    }

    // Peer 2 solves first; peer 3's solution is ignored.
    miners[1]
        .send(&Message::Solution {
            id: "J1".into(),
            nonce: "0011223344556677".into(),
            output: "cd".repeat(32),
        })
        .await;
    let found = timeout(READ_TIMEOUT, found_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.job_id, "J1");
    assert_eq!(found.nonce, "0011223344556677");

    miners[2]
        .send(&Message::Solution {
            id: "J1".into(),
            nonce: "ffffffffffffffff".into(),
            output: "ee".repeat(32),
        })
        .await;
    tokio::time::sleep(SETTLE).await;
    assert!(found_rx.try_recv().is_err(), "on_found must fire once");

    // The verdict goes only to the peer that delivered the solution.
    handle
        .solution_result("J1", true, "aa".repeat(32), 77)
        .unwrap();
    match miners[1].read_message().await {
        Message::Result { id, code, blockhash, .. } => {
            assert_eq!(id, "J1");
            assert_eq!(code, SOLUTION_ACCEPTED);
            assert!(blockhash.is_some());
        }
        other => panic!("expected result, got {other:?}"),
    }
    miners[0].expect_silence().await;
    miners[2].expect_silence().await;

    handle.stop();
}

#[tokio::test]
async fn login_failure_gets_result_and_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let keys_path = dir.path().join("api.keys");
    write_keys(&keys_path, &["only-valid-key"]);

    let addr = pick_addr();
    let mut options = Options::new(addr);
    options.api_keys_path = Some(keys_path);
    let (handle, _task) = StratumServer::spawn(options);
    tokio::time::sleep(SETTLE).await;

    let mut miner = Miner::connect(addr).await;
    miner.login("wrong-key-123").await;

    match miner.read_message().await {
        Message::Result { code, .. } => assert_eq!(code, LOGIN_FAILED),
        other => panic!("expected result, got {other:?}"),
    }
    // The server shuts the stream down after the reply.
    let eof = timeout(READ_TIMEOUT, miner.lines.next_line()).await.unwrap();
    assert!(matches!(eof, Ok(None) | Err(_)));

    handle.stop();
}

#[tokio::test]
async fn late_login_receives_cached_job() {
    let addr = pick_addr();
    // No ACL configured: every key is accepted.
    let (handle, _task) = StratumServer::spawn(Options::new(addr));
    tokio::time::sleep(SETTLE).await;

    let (on_found, _found_rx) = found_channel();
    handle
        .new_job("J7", "12".repeat(32), 7, 123, on_found)
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    let mut miner = Miner::connect(addr).await;
    miner.login("whatever-key").await;
    match miner.read_message().await {
        Message::Job { id, .. } => assert_eq!(id, "J7"),
        other => panic!("expected cached job, got {other:?}"),
    }

    handle.stop();
}

#[tokio::test]
async fn rebroadcast_is_not_coalesced() {
    let addr = pick_addr();
    let (handle, _task) = StratumServer::spawn(Options::new(addr));
    tokio::time::sleep(SETTLE).await;

    let mut miner = Miner::connect(addr).await;
    miner.login("any-key-works").await;
    tokio::time::sleep(SETTLE).await;

    let (cb1, _rx1) = found_channel();
    handle.new_job("J9", "00".repeat(32), 1, 5, cb1).unwrap();
    let (cb2, _rx2) = found_channel();
    handle.new_job("J9", "00".repeat(32), 1, 5, cb2).unwrap();

    // One frame per broadcast, no coalescing.
    for _ in 0..2 {
        match miner.read_message().await {
            Message::Job { id, .. } => assert_eq!(id, "J9"),
            other => panic!("expected job, got {other:?}"),
        }
    }
    miner.expect_silence().await;

    handle.stop();
}

#[tokio::test]
async fn unknown_methods_are_ignored() {
    let addr = pick_addr();
    let (handle, _task) = StratumServer::spawn(Options::new(addr));
    tokio::time::sleep(SETTLE).await;

    let mut miner = Miner::connect(addr).await;
    miner
        .writer
        .write_all(b"{\"method\":\"mining.subscribe\",\"id\":\"x\"}\n")
        .await
        .unwrap();
    miner.login("some-valid-key").await;
    tokio::time::sleep(SETTLE).await;

    // The peer survived the unknown frame and is logged in: it receives
    // the next job.
    let (cb, _rx) = found_channel();
    handle.new_job("J2", "11".repeat(32), 2, 9, cb).unwrap();
    match miner.read_message().await {
        Message::Job { id, .. } => assert_eq!(id, "J2"),
        other => panic!("expected job, got {other:?}"),
    }

    handle.stop();
}
