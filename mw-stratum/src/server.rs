//! The stratum server proper.
//!
//! One task owns all server state: the connection map, the ACL, the single
//! authoritative in-flight job and the most recent solution. Listener and
//! per-connection reader/writer tasks feed it through channels, so no
//! state is ever touched from two tasks at once. The node drives the
//! server through [`StratumHandle`], a typed command channel.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{rustls, TlsAcceptor};

use crate::acl::AccessControl;
use crate::error::{Result, StratumError};
use crate::protocol::{self, Message};

const SERVER_RESTART_INTERVAL: Duration = Duration::from_millis(1000);
const ACL_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_TIME: Duration = Duration::from_secs(2);

/// Server configuration.
///
/// TLS is enabled iff both `cert_path` and `key_path` are set. An absent
/// `api_keys_path` disables the ACL (all keys accepted).
#[derive(Debug, Clone)]
pub struct Options {
    pub listen_addr: SocketAddr,
    pub api_keys_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl Options {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Options {
            listen_addr,
            api_keys_path: None,
            cert_path: None,
            key_path: None,
        }
    }

    fn use_tls(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// The first valid solution delivered for a job.
#[derive(Debug, Clone)]
pub struct FoundBlock {
    pub job_id: String,
    pub nonce: String,
    pub output: String,
}

/// Invoked exactly once per job, with the winning solution.
pub type BlockFoundCallback = Box<dyn FnOnce(FoundBlock) + Send>;

enum Command {
    NewJob {
        id: String,
        input: String,
        difficulty: u32,
        height: u64,
        on_found: BlockFoundCallback,
    },
    SolutionResult {
        job_id: String,
        accepted: bool,
        blockhash: String,
        height: u64,
    },
    Stop,
}

/// Node-facing handle; every method enqueues onto the server task.
#[derive(Clone)]
pub struct StratumHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl StratumHandle {
    /// Replace the in-flight job and broadcast it to logged-in miners.
    pub fn new_job(
        &self,
        id: impl Into<String>,
        input: impl Into<String>,
        difficulty: u32,
        height: u64,
        on_found: BlockFoundCallback,
    ) -> Result<()> {
        self.commands
            .send(Command::NewJob {
                id: id.into(),
                input: input.into(),
                difficulty,
                height,
                on_found,
            })
            .map_err(|_| StratumError::Stopped)
    }

    /// Deliver the node's verdict on the recorded solution to the miner
    /// that produced it.
    pub fn solution_result(
        &self,
        job_id: impl Into<String>,
        accepted: bool,
        blockhash: impl Into<String>,
        height: u64,
    ) -> Result<()> {
        self.commands
            .send(Command::SolutionResult {
                job_id: job_id.into(),
                accepted,
                blockhash: blockhash.into(),
                height,
            })
            .map_err(|_| StratumError::Stopped)
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

enum PeerEvent {
    Connected {
        peer: u64,
        addr: SocketAddr,
        writer: mpsc::UnboundedSender<String>,
    },
    Message {
        peer: u64,
        msg: Message,
    },
    Disconnected {
        peer: u64,
    },
}

struct PeerConnection {
    addr: SocketAddr,
    writer: mpsc::UnboundedSender<String>,
    logged_in: bool,
}

struct RecentJob {
    id: String,
    frame: String,
    on_found: Option<BlockFoundCallback>,
}

struct RecentResult {
    job_id: String,
    peer: u64,
}

pub struct StratumServer;

impl StratumServer {
    /// Spawn the server onto the current runtime.
    pub fn spawn(options: Options) -> (StratumHandle, tokio::task::JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(options, command_rx));
        (StratumHandle { commands }, task)
    }
}

async fn run(options: Options, mut commands: mpsc::UnboundedReceiver<Command>) {
    let (events, mut event_rx) = mpsc::unbounded_channel();
    let listener = tokio::spawn(listen_loop(options.clone(), events));

    let mut state = ServerState {
        connections: HashMap::new(),
        acl: AccessControl::new(options.api_keys_path.clone()),
        recent_job: None,
        recent_result: None,
    };

    let mut acl_timer = tokio::time::interval(ACL_REFRESH_INTERVAL);
    acl_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = acl_timer.tick() => state.acl.refresh(),
            Some(event) = event_rx.recv() => state.on_event(event),
            cmd = commands.recv() => match cmd {
                Some(Command::Stop) | None => break,
                Some(cmd) => state.on_command(cmd),
            },
        }
    }

    tracing::info!("stratum server: stopping");
    listener.abort();
}

struct ServerState {
    connections: HashMap<u64, PeerConnection>,
    acl: AccessControl,
    recent_job: Option<RecentJob>,
    recent_result: Option<RecentResult>,
}

impl ServerState {
    fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer, addr, writer } => {
                tracing::debug!("stratum server: +peer {}", addr);
                self.connections.insert(
                    peer,
                    PeerConnection {
                        addr,
                        writer,
                        logged_in: false,
                    },
                );
            }
            PeerEvent::Disconnected { peer } => {
                if let Some(conn) = self.connections.remove(&peer) {
                    tracing::debug!("stratum server: -peer {}", conn.addr);
                }
            }
            PeerEvent::Message { peer, msg } => self.on_message(peer, msg),
        }
    }

    fn on_message(&mut self, peer: u64, msg: Message) {
        let (logged_in, addr) = match self.connections.get(&peer) {
            Some(conn) => (conn.logged_in, conn.addr),
            None => return,
        };
        match msg {
            Message::Login { id, api_key } => self.on_login(peer, id, api_key),
            Message::Solution { id, nonce, output } if logged_in => {
                self.on_solution(peer, id, nonce, output)
            }
            other => {
                // Includes any message from a peer that never logged in.
                tracing::info!(
                    "stratum server: ignoring {} from {}",
                    frame_name(&other),
                    addr
                );
            }
        }
    }

    fn on_login(&mut self, peer: u64, id: String, api_key: String) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        if self.acl.check(&api_key) {
            conn.logged_in = true;
            tracing::info!("stratum server: peer {} logged in", conn.addr);
            if let Some(job) = &self.recent_job {
                let _ = conn.writer.send(job.frame.clone());
            }
        } else {
            tracing::info!("stratum server: peer {} login failed", conn.addr);
            let _ = conn
                .writer
                .send(protocol::encode(&Message::login_failed(id)));
            // Dropping the writer flushes the reply and shuts the stream.
            self.connections.remove(&peer);
        }
    }

    fn on_solution(&mut self, peer: u64, id: String, nonce: String, output: String) {
        let Some(job) = self.recent_job.as_mut() else {
            tracing::debug!("stratum server: solution {} with no job in flight", id);
            return;
        };
        if job.id != id {
            tracing::debug!("stratum server: solution for stale job {}", id);
            return;
        }
        match job.on_found.take() {
            Some(on_found) => {
                tracing::info!("stratum server: solution to {} from peer {}", id, peer);
                self.recent_result = Some(RecentResult {
                    job_id: id.clone(),
                    peer,
                });
                on_found(FoundBlock {
                    job_id: id,
                    nonce,
                    output,
                });
            }
            None => {
                tracing::debug!("stratum server: additional solution to {} ignored", id);
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::NewJob {
                id,
                input,
                difficulty,
                height,
                on_found,
            } => {
                let frame = protocol::encode(&Message::Job {
                    id: id.clone(),
                    input,
                    difficulty,
                    height,
                });
                tracing::info!(
                    "stratum server: new job {} for {} connected peers",
                    id,
                    self.connections.len()
                );
                self.recent_job = Some(RecentJob {
                    id,
                    frame: frame.clone(),
                    on_found: Some(on_found),
                });
                self.recent_result = None;

                let dead: Vec<u64> = self
                    .connections
                    .iter()
                    .filter(|(_, conn)| conn.logged_in && conn.writer.send(frame.clone()).is_err())
                    .map(|(peer, _)| *peer)
                    .collect();
                for peer in dead {
                    if let Some(conn) = self.connections.remove(&peer) {
                        tracing::debug!("stratum server: -peer {} (broken stream)", conn.addr);
                    }
                }
            }
            Command::SolutionResult {
                job_id,
                accepted,
                blockhash,
                height,
            } => {
                let Some(result) = &self.recent_result else {
                    tracing::debug!("stratum server: result for {} with no solution", job_id);
                    return;
                };
                if result.job_id != job_id {
                    tracing::debug!("stratum server: result for stale job {}", job_id);
                    return;
                }
                let msg = if accepted {
                    Message::solution_accepted(job_id, blockhash, height)
                } else {
                    Message::solution_rejected(job_id)
                };
                if let Some(conn) = self.connections.get(&result.peer) {
                    let _ = conn.writer.send(protocol::encode(&msg));
                }
            }
            Command::Stop => {}
        }
    }
}

fn frame_name(msg: &Message) -> &'static str {
    match msg {
        Message::Login { .. } => "login",
        Message::Job { .. } => "job",
        Message::Solution { .. } => "solution",
        Message::Result { .. } => "result",
        Message::Cancel { .. } => "cancel",
    }
}

/// Bind, accept, retry forever.
///
/// Listen-socket creation failures and accept errors both restart the
/// listener after a fixed interval; no state survives the restart, peers
/// reconnect and log in again.
async fn listen_loop(options: Options, events: mpsc::UnboundedSender<PeerEvent>) {
    let mut next_peer: u64 = 1;
    loop {
        let acceptor = match tls_acceptor(&options) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                tracing::error!(
                    "stratum server: cannot load TLS material: {}, restarting in {:?}",
                    e,
                    SERVER_RESTART_INTERVAL
                );
                tokio::time::sleep(SERVER_RESTART_INTERVAL).await;
                continue;
            }
        };
        if acceptor.is_none() {
            tracing::warn!("stratum server: TLS disabled");
        }

        let listener = match TcpListener::bind(options.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(
                    "stratum server: cannot start server: {}, restarting in {:?}",
                    e,
                    SERVER_RESTART_INTERVAL
                );
                tokio::time::sleep(SERVER_RESTART_INTERVAL).await;
                continue;
            }
        };
        tracing::info!("stratum server: listening on {}", options.listen_addr);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    enable_keepalive(&stream);
                    let peer = next_peer;
                    next_peer += 1;
                    tokio::spawn(handle_connection(
                        stream,
                        acceptor.clone(),
                        peer,
                        addr,
                        events.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!(
                        "stratum server: accept failed: {}, restarting in {:?}",
                        e,
                        SERVER_RESTART_INTERVAL
                    );
                    tokio::time::sleep(SERVER_RESTART_INTERVAL).await;
                    break;
                }
            }
        }
    }
}

fn enable_keepalive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("stratum server: cannot enable keepalive: {}", e);
    }
}

fn tls_acceptor(options: &Options) -> Result<Option<TlsAcceptor>> {
    if !options.use_tls() {
        return Ok(None);
    }
    let cert_path = options.cert_path.as_ref().expect("checked by use_tls");
    let key_path = options.key_path.as_ref().expect("checked by use_tls");

    let certs = rustls_pemfile::certs(&mut StdBufReader::new(File::open(cert_path)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut StdBufReader::new(File::open(key_path)?))?
        .ok_or_else(|| StratumError::Tls("no private key in key file".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| StratumError::Tls(e.to_string()))?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    peer: u64,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => serve_stream(stream, peer, addr, events).await,
            Err(e) => {
                tracing::info!("stratum server: TLS handshake with {} failed: {}", addr, e);
            }
        },
        None => serve_stream(stream, peer, addr, events).await,
    }
}

/// Per-connection reader and writer.
///
/// The writer drains a line channel; dropping the server-side sender ends
/// the loop and shuts the stream down, which is how login failures close
/// the connection after the reply flushed.
async fn serve_stream<S>(stream: S, peer: u64, addr: SocketAddr, events: mpsc::UnboundedSender<PeerEvent>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (writer, mut outgoing) = mpsc::unbounded_channel::<String>();

    if events
        .send(PeerEvent::Connected { peer, addr, writer })
        .is_err()
    {
        return;
    }

    let writer_task = tokio::spawn(async move {
        while let Some(line) = outgoing.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match protocol::parse(&line) {
                Ok(Some(msg)) => {
                    if events.send(PeerEvent::Message { peer, msg }).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!(
                        "stratum server: ignoring unsupported method from {}",
                        addr
                    );
                }
                Err(e) => {
                    tracing::info!("stratum server: dropping peer {}: {}", addr, e);
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::info!("stratum server: peer {} disconnected: {}", addr, e);
                break;
            }
        }
    }

    let _ = events.send(PeerEvent::Disconnected { peer });
    let _ = writer_task.await;
}
