//! Flow descriptions and results

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::io::CopyResult;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// What is known about a flow when it is handed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMeta {
    /// Assigned by the manager; unique per process
    pub id: u64,
    pub protocol: Protocol,
    pub source: Option<SocketAddr>,
    /// Original destination. Required for TCP; for UDP the first
    /// datagram's destination is used when absent.
    pub destination: Option<SocketAddr>,
    /// Hostname supplied by the hosting environment, if any
    pub hostname: Option<String>,
}

impl FlowMeta {
    /// TCP flow towards `destination`
    #[must_use]
    pub const fn tcp(source: Option<SocketAddr>, destination: SocketAddr) -> Self {
        Self {
            id: 0,
            protocol: Protocol::Tcp,
            source,
            destination: Some(destination),
            hostname: None,
        }
    }

    /// UDP association from `source`
    #[must_use]
    pub const fn udp(source: Option<SocketAddr>, destination: Option<SocketAddr>) -> Self {
        Self {
            id: 0,
            protocol: Protocol::Udp,
            source,
            destination,
            hostname: None,
        }
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

/// Byte stream accepted from the hosting environment
pub trait FlowStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> FlowStream for T {}

/// Boxed inbound TCP stream
pub type BoxedStream = Box<dyn FlowStream>;

/// A datagram travelling from the client towards `destination`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Bytes,
    pub destination: SocketAddr,
}

/// Client side of a UDP association
#[async_trait]
pub trait DatagramFlow: Send + Sync {
    /// Next datagram from the client; `Ok(None)` once the association is
    /// closed by the hosting environment.
    async fn recv(&self) -> io::Result<Option<Datagram>>;

    /// Deliver a reply to the client as if it came from `from`.
    async fn send(&self, payload: &[u8], from: SocketAddr) -> io::Result<()>;
}

/// Inbound side of a flow
pub enum InboundFlow {
    Tcp(BoxedStream),
    Udp(Arc<dyn DatagramFlow>),
}

impl InboundFlow {
    /// Box any stream as a TCP inbound
    pub fn tcp<S: FlowStream + 'static>(stream: S) -> Self {
        Self::Tcp(Box::new(stream))
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::Tcp(_) => Protocol::Tcp,
            Self::Udp(_) => Protocol::Udp,
        }
    }
}

impl fmt::Debug for InboundFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(_) => f.write_str("InboundFlow::Tcp"),
            Self::Udp(_) => f.write_str("InboundFlow::Udp"),
        }
    }
}

/// How a flow ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum FlowStatus {
    Completed,
    Cancelled,
    Failed(String),
}

impl FlowStatus {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Delivered once per flow through the completion callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowOutcome {
    pub flow_id: u64,
    pub protocol: Protocol,
    pub status: FlowStatus,
    /// Bytes client -> upstream and upstream -> client
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Interface actually bound; `None` means system route
    pub interface: Option<String>,
    /// Id of the rule that matched, if any
    pub rule_id: Option<String>,
    /// Set when the matched interface could not be used
    pub fallback: bool,
    #[serde(skip)]
    pub duration: Duration,
}

impl FlowOutcome {
    pub(crate) fn new(meta: &FlowMeta) -> Self {
        Self {
            flow_id: meta.id,
            protocol: meta.protocol,
            status: FlowStatus::Cancelled,
            bytes_up: 0,
            bytes_down: 0,
            interface: None,
            rule_id: None,
            fallback: false,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn set_bytes(&mut self, bytes: CopyResult) {
        self.bytes_up = bytes.client_to_upstream;
        self.bytes_down = bytes.upstream_to_client;
    }

    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }
}
