//! Error types for the relay.
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Fatal errors raised while starting the relay or its helper threads.
///
/// Per-connection I/O failures never surface here; a worker logs them and tears down its own
/// connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid port {0:?}: expected a number from 0 to 65535 (service names are not resolved)")]
    InvalidPort(String),

    #[error("could not create a socket for {addr}: {source}")]
    Socket { addr: SocketAddr, source: io::Error },

    #[error("could not bind to {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("could not listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },

    #[error("could not install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error("could not spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

impl RelayError {
    /// Process exit status for this failure. Each startup stage gets its own code so scripts can
    /// tell a bad port from a port that is already taken.
    pub fn exit_code(&self) -> i32 {
        match *self {
            RelayError::InvalidPort(_) => 4,
            RelayError::Socket { .. } => 8,
            RelayError::Bind { .. } => 16,
            RelayError::Listen { .. } => 32,
            RelayError::Signal(_) | RelayError::Spawn(_) => 1,
        }
    }
}

/// Failure to add a handle to a [`ConnectionRegistry`](crate::registry::ConnectionRegistry).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("out of memory growing the connection registry")]
    OutOfMemory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_stages_have_distinct_exit_codes() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let io_err = || io::Error::new(io::ErrorKind::Other, "boom");
        let codes = [
            RelayError::InvalidPort("http".to_string()).exit_code(),
            RelayError::Socket { addr, source: io_err() }.exit_code(),
            RelayError::Bind { addr, source: io_err() }.exit_code(),
            RelayError::Listen { addr, source: io_err() }.exit_code(),
        ];
        assert_eq!(codes, [4, 8, 16, 32]);
        assert_eq!(RelayError::Signal(io_err()).exit_code(), 1);
        assert_eq!(RelayError::Spawn(io_err()).exit_code(), 1);
    }

    #[test]
    fn invalid_port_message_names_the_input() {
        let message = RelayError::InvalidPort("http".to_string()).to_string();
        assert!(message.contains("\"http\""), "{}", message);
        assert!(message.contains("service names"), "{}", message);
    }
}
