//! Relay settings.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::RelayError;

/// Bytes read from a client per broadcast.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Pending-connection queue length handed to `listen`.
pub const DEFAULT_BACKLOG: i32 = 10;

/// Which local addresses the listening socket covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// `[::]` with `IPV6_V6ONLY` cleared, so IPv4 clients arrive as mapped addresses.
    DualStack,
    /// `0.0.0.0` only.
    Ipv4,
    /// `127.0.0.1` only.
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub port: u16,
    pub bind_mode: BindMode,
    pub backlog: i32,
    pub chunk_size: usize,
}

impl RelayConfig {
    pub fn new(port: u16) -> RelayConfig {
        RelayConfig {
            port,
            bind_mode: BindMode::DualStack,
            backlog: DEFAULT_BACKLOG,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn bind_mode(mut self, bind_mode: BindMode) -> RelayConfig {
        self.bind_mode = bind_mode;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> RelayConfig {
        self.backlog = backlog;
        self
    }

    /// A zero-sized chunk would read as end-of-stream, so the size is clamped to at least one.
    pub fn chunk_size(mut self, chunk_size: usize) -> RelayConfig {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        let ip = match self.bind_mode {
            BindMode::DualStack => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            BindMode::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            BindMode::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> RelayConfig {
        RelayConfig::new(0)
    }
}

/// Parse a listening port. Only decimal numbers are accepted; service names such as `http` are
/// not looked up.
pub fn parse_port(value: &str) -> Result<u16, RelayError> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::InvalidPort(value.to_string()))
}
