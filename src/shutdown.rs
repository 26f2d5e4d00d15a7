//! Cooperative cancellation for the accept loop and every worker.
//!
//! A [`ShutdownToken`] is created once and cloned into each component. Triggering it flips a
//! write-once flag that every loop polls, then half-closes the listening socket so a blocked
//! `accept` returns. Workers blocked in `read` are released separately, by the server
//! half-closing each registered connection.
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use socket2::Socket;

use crate::error::RelayError;

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    listener: Mutex<Option<Unblocker>>,
}

/// A duplicate of the listening socket plus an address that reaches it.
struct Unblocker {
    socket: Socket,
    wake_addr: SocketAddr,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        ShutdownToken::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Request shutdown. Returns `true` only for the call that actually flipped the flag.
    pub fn trigger(&self) -> bool {
        if self.inner.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ref unblocker) = *listener {
            unblocker.wake();
        }
        true
    }

    /// Hand the token a duplicate of the listening socket so `trigger` can interrupt `accept`.
    pub(crate) fn arm(&self, socket: Socket, local_addr: SocketAddr) {
        let mut listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let unblocker = Unblocker {
            socket,
            wake_addr: reachable(local_addr),
        };
        // A trigger that raced ahead of arming found nothing to wake.
        if self.is_triggered() {
            unblocker.wake();
        }
        *listener = Some(unblocker);
    }

    /// Release the listener duplicate once nothing is accepting any more.
    pub(crate) fn disarm(&self) {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Unblocker {
    fn wake(&self) {
        // Half-closing a listening socket makes a pending accept fail straight away on Linux.
        // Elsewhere fall back to poking it with a throwaway connection.
        if let Err(err) = self.socket.shutdown(Shutdown::Read) {
            debug!("listener half-close failed ({}), waking accept by connecting", err);
            if let Err(err) = TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
                warn!("could not wake the accept loop at {}: {}", self.wake_addr, err);
            }
        }
    }
}

fn reachable(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

/// Background thread turning SIGINT and SIGTERM into a [`ShutdownToken::trigger`].
pub struct SignalWatcher {
    handle: Handle,
    thread: JoinHandle<()>,
}

pub fn watch_signals(token: ShutdownToken) -> Result<SignalWatcher, RelayError> {
    let mut signals = Signals::new(&[SIGINT, SIGTERM]).map_err(RelayError::Signal)?;
    let handle = signals.handle();
    let thread = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if token.trigger() {
                    info!("received signal {}, shutting down", signal);
                } else {
                    debug!("received signal {} while already shutting down", signal);
                }
            }
        })
        .map_err(RelayError::Spawn)?;
    Ok(SignalWatcher { handle, thread })
}

impl SignalWatcher {
    /// Stop listening for signals and join the watcher thread.
    pub fn stop(self) -> io::Result<()> {
        self.handle.close();
        self.thread
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "signal watcher panicked"))
    }
}
