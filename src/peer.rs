//! Defines IO with a chat peer.
//!
//! Each accepted socket becomes a [`Peer`], shared through an `Arc` between its
//! [`ConnectionWorker`] and the registry. The worker is the only one that ever deregisters or
//! closes it.
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownToken;

/// Identity of a connection, unique for the life of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(id: u64) -> PeerId {
        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type PeerRegistry = ConnectionRegistry<Arc<Peer>>;

/// One accepted client socket.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
}

impl Peer {
    pub fn new(id: PeerId, stream: TcpStream) -> io::Result<Peer> {
        let addr = stream.peer_addr()?;
        Ok(Peer { id, addr, stream })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Write all of `chunk`, retrying short and interrupted writes.
    pub fn send(&self, chunk: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(chunk)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Stop reading, which wakes a worker blocked in `recv` with end-of-stream.
    pub fn shutdown_read(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Read)
    }

    fn close(&self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            // Already torn down by the other side.
            trace!("closing peer {}: {}", self.id, err);
        }
    }
}

/// Outcome of writing one chunk to every registered peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Write `chunk` to every peer in `registry`, the sender included.
///
/// The writes happen with the registry lock held, so broadcasts never interleave. A peer whose
/// write fails is logged and skipped, and stays registered until its own worker notices the
/// connection is gone.
pub fn broadcast(registry: &PeerRegistry, chunk: &[u8]) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    registry.for_each(|peer| match peer.send(chunk) {
        Ok(()) => report.delivered += 1,
        Err(err) => {
            warn!("error writing to peer {} ({}): {}", peer.id, peer.addr, err);
            report.failed += 1;
        }
    });
    report
}

/// Why a worker stopped relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The client closed its side.
    PeerClosed,
    /// Reading from the client failed.
    ReadFailed,
    /// The server is shutting down.
    Shutdown,
    /// The peer could not be added to the registry.
    NotRegistered,
}

/// Relays one client's traffic to the registry for as long as the connection lives.
pub struct ConnectionWorker {
    peer: Arc<Peer>,
    registry: Arc<PeerRegistry>,
    shutdown: ShutdownToken,
    chunk_size: usize,
    buf: BytesMut,
}

impl ConnectionWorker {
    pub fn new(
        peer: Arc<Peer>,
        registry: Arc<PeerRegistry>,
        shutdown: ShutdownToken,
        chunk_size: usize,
    ) -> ConnectionWorker {
        let chunk_size = chunk_size.max(1);
        ConnectionWorker {
            peer,
            registry,
            shutdown,
            chunk_size,
            buf: BytesMut::with_capacity(chunk_size),
        }
    }

    /// Register, relay until the connection ends, then deregister and close.
    pub fn run(mut self) -> WorkerExit {
        let id = self.peer.id;
        if let Err(err) = self.registry.insert_front(Arc::clone(&self.peer)) {
            error!("could not register peer {} ({}): {}", id, self.peer.addr, err);
            self.peer.close();
            return WorkerExit::NotRegistered;
        }
        debug!("peer {} ({}) registered", id, self.peer.addr);

        let exit = self.relay();

        let removed = self.registry.remove_matching(|peer| peer.id == id);
        if removed != 1 {
            warn!(
                "peer {} removed {} entries from the registry, expected 1",
                id, removed
            );
        }
        self.peer.close();
        debug!("peer {} ({}) done: {:?}", id, self.peer.addr, exit);
        exit
    }

    fn relay(&mut self) -> WorkerExit {
        loop {
            if self.shutdown.is_triggered() {
                return WorkerExit::Shutdown;
            }
            match self.read_chunk() {
                Ok(Some(chunk)) => {
                    let report = broadcast(&self.registry, &chunk);
                    trace!(
                        "peer {} relayed {} bytes to {} peers ({} failed)",
                        self.peer.id,
                        chunk.len(),
                        report.delivered,
                        report.failed
                    );
                }
                Ok(None) if self.shutdown.is_triggered() => return WorkerExit::Shutdown,
                Ok(None) => return WorkerExit::PeerClosed,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if self.shutdown.is_triggered() {
                        return WorkerExit::Shutdown;
                    }
                    warn!(
                        "error reading from peer {} ({}), closing it: {}",
                        self.peer.id, self.peer.addr, err
                    );
                    return WorkerExit::ReadFailed;
                }
            }
        }
    }

    /// Read the next chunk, or `None` once the client has closed its side.
    fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.buf.clear();
        self.buf.resize(self.chunk_size, 0);
        let read = self.peer.recv(&mut self.buf[..])?;
        if read == 0 {
            return Ok(None);
        }
        self.buf.truncate(read);
        Ok(Some(self.buf.split().freeze()))
    }
}
