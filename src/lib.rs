//! # A multi-client TCP text relay.
//!
//! Every byte a connected client sends is written, unchanged and in the same chunk boundaries it
//! was read in, to every currently connected client, the sender included. There is no framing:
//! any notion of lines or messages belongs to the clients.
//!
//! Each accepted connection gets its own thread. All of them share one
//! [`ConnectionRegistry`](registry::ConnectionRegistry), and a broadcast writes to every peer while
//! holding the registry lock. Broadcasts are therefore strictly serialised, and every client sees
//! the chunks from all senders in the same relative order. The cost is head-of-line blocking: a
//! peer that stops draining its socket stalls every broadcast until its write completes or fails.
//!
//! Architecture:
//!
//! ```text
//!  TcpListener --accept--> Server --spawn--> ConnectionWorker (one thread per client)
//!                             |                    |  insert_front / remove_matching
//!                             |                    v
//!                             |          +--------------------+
//!                             +--------->| ConnectionRegistry |<-- broadcast (for_each, lock held)
//!                   half-close on        +--------------------+
//!                   shutdown
//! ```
//!
//! Shutdown is cooperative. A [`ShutdownToken`](shutdown::ShutdownToken) is shared by the accept
//! loop and every worker; triggering it (SIGINT/SIGTERM in the binary) half-closes the listener so
//! `accept` returns, after which the server half-closes every registered connection and joins
//! every worker thread.

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod peer;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use config::{parse_port, BindMode, RelayConfig};
pub use error::{RegistryError, RelayError};
pub use peer::{broadcast, BroadcastReport, ConnectionWorker, Peer, PeerId, PeerRegistry, WorkerExit};
pub use registry::ConnectionRegistry;
pub use server::{Server, ServerState, ShutdownSummary};
pub use shutdown::{watch_signals, ShutdownToken, SignalWatcher};
