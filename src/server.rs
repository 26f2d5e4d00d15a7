//! Listening socket, accept loop and orderly shutdown.
//!
//! Lifecycle:
//!
//! ```text
//! Starting -> Listening -> Accepting -> ShuttingDown -> Stopped
//! ```
//!
//! `Server::bind` covers `Starting` and `Listening`; any failure there is fatal. `Server::run`
//! accepts until the [`ShutdownToken`] fires or `accept` fails with something outside the
//! transient set, then half-closes every registered connection and joins every worker it spawned.
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::peer::{ConnectionWorker, Peer, PeerId, PeerRegistry, WorkerExit};
use crate::shutdown::ShutdownToken;

/// Where a server is in its lifecycle.
///
/// `Starting` only ever appears in the log: `Server::bind` either returns a server that is already
/// `Listening` or fails, so `Server::state` never reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Listening,
    Accepting,
    ShuttingDown,
    Stopped,
}

/// What `Server::run` did before returning.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Connections handed to a worker thread.
    pub accepted: usize,
    /// Workers joined cleanly.
    pub joined: usize,
    /// Workers that panicked.
    pub join_failures: usize,
}

/// Bookkeeping for one spawned worker. Owned by the accept loop alone.
struct WorkerRecord {
    peer: PeerId,
    thread: JoinHandle<WorkerExit>,
}

pub struct Server {
    config: RelayConfig,
    listener: TcpListener,
    // Duplicate of `listener`, handed to the shutdown token when accepting starts.
    unblocker: Option<Socket>,
    local_addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    shutdown: ShutdownToken,
    state: ServerState,
    next_id: u64,
}

impl Server {
    /// Open the listening socket described by `config`.
    pub fn bind(config: RelayConfig, shutdown: ShutdownToken) -> Result<Server, RelayError> {
        debug!("relay state: {:?}", ServerState::Starting);
        let socket = open_listener(&config)?;
        let unblocker = socket.try_clone().map_err(|source| RelayError::Socket {
            addr: config.listen_addr(),
            source,
        })?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr().map_err(|source| RelayError::Listen {
            addr: config.listen_addr(),
            source,
        })?;
        info!("relay listening on {}", local_addr);

        Ok(Server {
            config,
            listener,
            unblocker: Some(unblocker),
            local_addr,
            registry: Arc::new(PeerRegistry::new()),
            shutdown,
            state: ServerState::Listening,
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn transition(&mut self, state: ServerState) {
        debug!("relay state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Serve until shutdown, then drain every connection and join every worker.
    ///
    /// Shutdown only completes once every peer keeps draining its socket: the half-close pass
    /// takes the registry lock, so a broadcast stuck writing to a peer that stopped reading holds
    /// it off indefinitely.
    pub fn run(mut self) -> ShutdownSummary {
        if let Some(socket) = self.unblocker.take() {
            self.shutdown.arm(socket, self.local_addr);
        }
        self.transition(ServerState::Accepting);

        let mut workers = Vec::new();
        self.accept_loop(&mut workers);
        self.shutdown.disarm();
        let accepted = workers.len();

        self.transition(ServerState::ShuttingDown);
        self.half_close_peers();
        let (joined, join_failures) = join_workers(workers);

        let leftover = self.registry.drain();
        if !leftover.is_empty() {
            warn!("{} peers were still registered after every worker joined", leftover.len());
        }
        self.transition(ServerState::Stopped);

        let summary = ShutdownSummary {
            accepted,
            joined,
            join_failures,
        };
        info!(
            "relay stopped: {} connections served, {} workers joined, {} panicked",
            summary.accepted, summary.joined, summary.join_failures
        );
        summary
    }

    fn accept_loop(&mut self, workers: &mut Vec<WorkerRecord>) {
        while !self.shutdown.is_triggered() {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.shutdown.is_triggered() {
                        debug!("dropping connection from {} accepted during shutdown", addr);
                        break;
                    }
                    self.spawn_worker(stream, addr, workers);
                }
                Err(err) => {
                    if self.shutdown.is_triggered() {
                        info!("accept interrupted, shutting down");
                        break;
                    }
                    if is_transient(&err) {
                        warn!("transient error accepting a connection: {}", err);
                        continue;
                    }
                    error!("error accepting a connection, shutting down: {}", err);
                    self.shutdown.trigger();
                    break;
                }
            }
        }
    }

    /// Hand `stream` to a new worker thread. Failure only costs this one connection.
    fn spawn_worker(&mut self, stream: TcpStream, addr: SocketAddr, workers: &mut Vec<WorkerRecord>) {
        self.next_id += 1;
        let id = PeerId::new(self.next_id);
        let peer = match Peer::new(id, stream) {
            Ok(peer) => Arc::new(peer),
            Err(err) => {
                warn!("dropping connection from {}: {}", addr, err);
                return;
            }
        };
        if workers.try_reserve(1).is_err() {
            warn!("out of memory tracking a worker, dropping connection from {}", addr);
            return;
        }

        let worker = ConnectionWorker::new(
            peer,
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            self.config.chunk_size,
        );
        let spawned = thread::Builder::new()
            .name(format!("peer-{}", self.next_id))
            .spawn(move || worker.run());
        match spawned {
            Ok(thread) => {
                info!("accepted peer {} from {}", id, addr);
                workers.push(WorkerRecord { peer: id, thread });
            }
            Err(err) => warn!("could not spawn a worker for {}, dropping it: {}", addr, err),
        }
    }

    /// Stop reading on every registered connection so blocked workers see end-of-stream.
    fn half_close_peers(&self) {
        let mut closed = 0;
        self.registry.for_each(|peer| {
            if let Err(err) = peer.shutdown_read() {
                debug!("half-closing peer {}: {}", peer.id(), err);
            }
            closed += 1;
        });
        info!("half-closed {} connections", closed);
    }
}

/// Join workers in the order they were spawned. A panicked worker is logged and counted.
fn join_workers(workers: Vec<WorkerRecord>) -> (usize, usize) {
    let mut joined = 0;
    let mut failed = 0;
    for record in workers {
        match record.thread.join() {
            Ok(exit) => {
                debug!("joined worker for peer {}: {:?}", record.peer, exit);
                joined += 1;
            }
            Err(_) => {
                error!("worker for peer {} panicked", record.peer);
                failed += 1;
            }
        }
    }
    (joined, failed)
}

fn open_listener(config: &RelayConfig) -> Result<Socket, RelayError> {
    let addr = config.listen_addr();
    match listen_on(addr, config.backlog) {
        Err(ref err) if addr.is_ipv6() && ipv6_unavailable(err) => {
            warn!("IPv6 unavailable ({}), listening on IPv4 only", err);
            listen_on(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), addr.port()), config.backlog)
        }
        result => result,
    }
}

fn listen_on(addr: SocketAddr, backlog: i32) -> Result<Socket, RelayError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| RelayError::Socket { addr, source })?;

    if addr.is_ipv6() {
        if let Err(err) = socket.set_only_v6(false) {
            warn!("could not accept IPv4-mapped clients, listening on IPv6 only: {}", err);
        }
    }
    if let Err(err) = socket.set_reuse_address(true) {
        warn!("could not set SO_REUSEADDR, binding may fail if {} was used recently: {}", addr, err);
    }

    socket
        .bind(&addr.into())
        .map_err(|source| RelayError::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| RelayError::Listen { addr, source })?;
    Ok(socket)
}

fn ipv6_unavailable(err: &RelayError) -> bool {
    match *err {
        RelayError::Socket { .. } => true,
        RelayError::Bind { ref source, .. } => {
            source.kind() == io::ErrorKind::AddrNotAvailable
                || source.raw_os_error() == Some(libc::EAFNOSUPPORT)
        }
        _ => false,
    }
}

/// Accept failures worth retrying. Everything else ends the accept loop.
fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted => {
            return true
        }
        _ => {}
    }
    match err.raw_os_error() {
        Some(libc::EAGAIN)
        | Some(libc::ENETDOWN)
        | Some(libc::EPROTO)
        | Some(libc::ENOPROTOOPT)
        | Some(libc::EHOSTDOWN)
        | Some(libc::EHOSTUNREACH)
        | Some(libc::EOPNOTSUPP)
        | Some(libc::ENETUNREACH) => true,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Some(libc::ENONET) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::BindMode;

    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn loopback() -> RelayConfig {
        RelayConfig::new(0).bind_mode(BindMode::Loopback)
    }

    fn wait_for_len(registry: &PeerRegistry, len: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.len() != len {
            assert!(Instant::now() < deadline, "registry never reached {} peers", len);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn transient_accept_errors() {
        for code in &[libc::EAGAIN, libc::ENETDOWN, libc::EPROTO, libc::EHOSTUNREACH, libc::ENETUNREACH] {
            assert!(is_transient(&io::Error::from_raw_os_error(*code)), "errno {}", code);
        }
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EINVAL)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
    }

    #[test]
    fn bind_reports_listening_state() {
        let server = Server::bind(loopback(), ShutdownToken::new()).unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert!(server.local_addr().ip().is_loopback());
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn dual_stack_accepts_ipv4_clients() {
        // Hosts without IPv6 fall back to plain IPv4; either way an IPv4 client gets through.
        let server = Server::bind(RelayConfig::new(0), ShutdownToken::new()).unwrap();
        let port = server.local_addr().port();
        let token = server.shutdown_token();
        let registry = server.registry();
        let handle = thread::spawn(move || server.run());

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        wait_for_len(&registry, 1);
        client.write_all(b"v4").unwrap();
        let mut buf = [0; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"v4");

        token.trigger();
        let summary = handle.join().unwrap();
        assert_eq!(summary.accepted, 1);
    }

    #[test]
    fn bind_conflict_is_fatal() {
        let first = Server::bind(loopback(), ShutdownToken::new()).unwrap();
        let taken = RelayConfig {
            port: first.local_addr().port(),
            ..loopback()
        };
        match Server::bind(taken, ShutdownToken::new()) {
            Err(RelayError::Bind { addr, .. }) => assert_eq!(addr.port(), first.local_addr().port()),
            other => panic!("expected a bind error, got {:?}", other.map(|s| s.local_addr())),
        }
    }

    #[test]
    fn shutdown_joins_every_worker() {
        let server = Server::bind(loopback(), ShutdownToken::new()).unwrap();
        let addr = server.local_addr();
        let token = server.shutdown_token();
        let registry = server.registry();
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || done_tx.send(server.run()).unwrap());

        let mut clients: Vec<TcpStream> = (0..4).map(|_| TcpStream::connect(addr).unwrap()).collect();
        wait_for_len(&registry, 4);

        assert!(token.trigger());
        let summary = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("server did not stop");
        assert_eq!(
            summary,
            ShutdownSummary {
                accepted: 4,
                joined: 4,
                join_failures: 0
            }
        );
        assert!(registry.is_empty());

        for client in clients.iter_mut() {
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0; 8];
            assert_eq!(client.read(&mut buf).unwrap(), 0);
            let _ = client.shutdown(Shutdown::Both);
        }
    }

    #[test]
    fn shutdown_with_no_clients() {
        let server = Server::bind(loopback(), ShutdownToken::new()).unwrap();
        let token = server.shutdown_token();
        let handle = thread::spawn(move || server.run());
        thread::sleep(Duration::from_millis(20));
        token.trigger();
        assert_eq!(handle.join().unwrap(), ShutdownSummary::default());
    }

    #[test]
    fn fatal_accept_error_triggers_shutdown() {
        let server = Server::bind(loopback(), ShutdownToken::new()).unwrap();
        let token = server.shutdown_token();
        // Accept now fails with EINVAL, which is outside the transient set.
        socket2::SockRef::from(&server.listener)
            .shutdown(Shutdown::Read)
            .unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || done_tx.send(server.run()).unwrap());
        let summary = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("server did not stop");

        assert_eq!(summary.accepted, 0);
        assert!(token.is_triggered());
    }

    #[test]
    fn token_triggered_before_run_stops_immediately() {
        let token = ShutdownToken::new();
        let server = Server::bind(loopback(), token.clone()).unwrap();
        token.trigger();
        assert_eq!(server.run(), ShutdownSummary::default());
    }
}
