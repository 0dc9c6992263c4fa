//! Intercepted TCP
//!
//! The listening socket carries `IP_TRANSPARENT`, so connections to any
//! address that the firewall diverts here are accepted as if they were
//! local. `SO_ORIGINAL_DST` on the accepted socket gives back the address
//! the client dialled.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::socket::{create_tproxy_tcp_socket, get_original_dst};
use crate::config::ListenConfig;
use crate::error::TproxyError;
use crate::flow::{FlowMeta, InboundFlow};

/// Accepted stream plus both ends of the client's intended connection
#[derive(Debug)]
pub struct InterceptedConnection {
    stream: TcpStream,
    client_addr: SocketAddr,
    original_dst: SocketAddr,
}

impl InterceptedConnection {
    /// # Errors
    ///
    /// `OriginalDstError` when the stream did not arrive through a redirect.
    pub fn new(stream: TcpStream, client_addr: SocketAddr) -> Result<Self, TproxyError> {
        let original_dst = get_original_dst(stream.as_raw_fd())?;
        Ok(Self::with_destination(stream, client_addr, original_dst))
    }

    #[must_use]
    pub const fn with_destination(
        stream: TcpStream,
        client_addr: SocketAddr,
        original_dst: SocketAddr,
    ) -> Self {
        Self {
            stream,
            client_addr,
            original_dst,
        }
    }

    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    #[must_use]
    pub const fn original_dst(&self) -> SocketAddr {
        self.original_dst
    }

    /// Splits into what [`FlowManager::admit`](crate::flow::FlowManager::admit) takes.
    #[must_use]
    pub fn into_flow(self) -> (FlowMeta, InboundFlow) {
        (
            FlowMeta::tcp(Some(self.client_addr), self.original_dst),
            InboundFlow::tcp(self.stream),
        )
    }
}

#[derive(Debug)]
pub struct TproxyListener {
    listener: TcpListener,
    listen_addr: SocketAddr,
}

impl TproxyListener {
    /// Binds and listens on `config.address`. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` without `CAP_NET_ADMIN`, `BindError` when the
    /// address is taken, or other socket setup failures.
    pub fn bind(config: &ListenConfig) -> Result<Self, TproxyError> {
        let socket = create_tproxy_tcp_socket(config.reuse_port)?;
        socket
            .bind(&config.address.into())
            .map_err(|e| TproxyError::bind(config.address, e.to_string()))?;
        socket
            .listen(i32::try_from(config.tcp_backlog).unwrap_or(i32::MAX))
            .map_err(|e| TproxyError::socket_option("listen", e.to_string()))?;

        let listener = TcpListener::from_std(socket.into())
            .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;
        let listen_addr = listener.local_addr().unwrap_or(config.address);
        info!(%listen_addr, backlog = config.tcp_backlog, "intercepting TCP");
        Ok(Self {
            listener,
            listen_addr,
        })
    }

    /// # Errors
    ///
    /// `AcceptError` from the kernel, or `OriginalDstError` for a connection
    /// that was not redirected. Both leave the listener usable.
    pub async fn accept(&self) -> Result<InterceptedConnection, TproxyError> {
        let (stream, client) = self
            .listener
            .accept()
            .await
            .map_err(|e| TproxyError::AcceptError(e.to_string()))?;
        let conn = InterceptedConnection::new(stream, client)?;
        debug!(%client, dst = %conn.original_dst, "connection intercepted");
        Ok(conn)
    }

    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}
