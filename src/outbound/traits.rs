//! Outbound dialer trait
//!
//! A [`Dialer`] opens outbound sockets pinned to a named interface, or left
//! on the system route when no interface is given. Flow handlers only talk
//! to this trait, which keeps them testable without privileges.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};

use crate::error::OutboundError;

/// An established outbound TCP connection
#[derive(Debug)]
pub struct OutboundConnection {
    stream: TcpStream,
    local_addr: Option<SocketAddr>,
    remote_addr: SocketAddr,
    interface: Option<String>,
}

impl OutboundConnection {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, interface: Option<String>) -> Self {
        let local_addr = stream.local_addr().ok();
        Self {
            stream,
            local_addr,
            remote_addr,
            interface,
        }
    }

    #[must_use]
    pub const fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Consume and return the underlying stream
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Interface the socket is bound to; `None` means system route
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }
}

/// Opens interface-bound outbound sockets
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` through `interface` (or the system route).
    ///
    /// # Errors
    ///
    /// - `OutboundError::BindDevice` if the socket cannot be pinned to
    ///   `interface`
    /// - `OutboundError::Timeout` if the connect does not finish in time
    /// - `OutboundError::ConnectionFailed` for any other connect failure
    async fn connect_tcp(
        &self,
        addr: SocketAddr,
        interface: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<OutboundConnection, OutboundError>;

    /// Bind an unconnected UDP socket through `interface` for the address
    /// family of `peer`.
    ///
    /// # Errors
    ///
    /// `OutboundError::BindDevice` or `OutboundError::SocketOption`.
    async fn bind_udp(
        &self,
        peer: SocketAddr,
        interface: Option<&str>,
    ) -> Result<UdpSocket, OutboundError>;
}
