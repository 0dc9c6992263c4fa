//! Error types
//!
//! One enum per subsystem, all convertible into [`RouterError`]. Each enum
//! answers `is_recoverable()`: whether repeating the same operation later
//! could succeed without anyone changing configuration or rules.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Any error the router can produce
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("address: {0}")]
    Address(#[from] AddressError),

    #[error("rules: {0}")]
    Rule(#[from] RuleError),

    #[error("interfaces: {0}")]
    Interface(#[from] InterfaceError),

    #[error("outbound: {0}")]
    Outbound(#[from] OutboundError),

    #[error("flow: {0}")]
    Flow(#[from] FlowError),

    #[error("tproxy: {0}")]
    Tproxy(#[from] TproxyError),

    #[error("ipc: {0}")]
    Ipc(#[from] IpcError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Transient socket conditions shared by several enums below
fn transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
    )
}

impl RouterError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Address(_) => false,
            Self::Rule(e) => e.is_recoverable(),
            Self::Interface(e) => e.is_recoverable(),
            Self::Outbound(e) => e.is_recoverable(),
            Self::Flow(e) => e.is_recoverable(),
            Self::Tproxy(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Io(e) => transient_io(e),
        }
    }
}

/// Loading, parsing or validating the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file at {path}")]
    FileNotFound { path: String },

    #[error("configuration is not valid JSON: {0}")]
    ParseError(String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),

    /// An `IFACE_ROUTER_*` override could not be applied
    #[error("bad value in {name}: {reason}")]
    EnvError { name: String, reason: String },

    #[error("reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Always false; the operator has to fix the file or environment.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Malformed address, prefix or CIDR strings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Not a canonical dotted-quad IPv4 address
    #[error("not an IPv4 address: {0:?}")]
    InvalidAddress(String),

    /// Prefix length missing, non-numeric or above 32
    #[error("bad prefix length: {0:?}")]
    InvalidPrefix(String),

    /// Not shaped like `address/prefix`
    #[error("not in address/prefix form: {0:?}")]
    InvalidFormat(String),
}

#[derive(Debug, Error)]
pub enum RuleError {
    /// Pattern does not parse under the rule's kind
    #[error("pattern {pattern:?} rejected: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("rule id is empty")]
    EmptyId,

    #[error("rule id {0:?} is already taken")]
    DuplicateId(String),

    #[error("no rule with id {0:?}")]
    NotFound(String),

    #[error("position {index} is past the end of {len} rules")]
    IndexOutOfRange { index: usize, len: usize },

    /// File contents or a record could not be decoded
    #[error("undecodable rules: {0}")]
    Parse(String),

    /// File could not be read, written or renamed
    #[error("rule file {path}: {reason}")]
    Storage { path: String, reason: String },
}

impl RuleError {
    /// Only storage failures are worth retrying.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("listing interfaces failed: {0}")]
    Enumeration(String),

    #[error("reading interface state: {0}")]
    IoError(#[from] io::Error),
}

impl InterfaceError {
    /// The next refresh tick tries again.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Opening the upstream side of a flow
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("connect {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connect {addr}: no answer within {timeout_ms}ms")]
    Timeout { addr: SocketAddr, timeout_ms: u64 },

    /// Pinning the socket to `interface` failed
    #[error("cannot bind to device {interface}: {reason}")]
    BindDevice { interface: String, reason: String },

    #[error("setsockopt {option}: {reason}")]
    SocketOption { option: String, reason: String },

    #[error("outbound io: {0}")]
    IoError(#[from] io::Error),
}

impl OutboundError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,
            Self::BindDevice { .. } | Self::SocketOption { .. } => false,
            Self::IoError(e) => {
                e.kind() == io::ErrorKind::ConnectionRefused || transient_io(e)
            }
        }
    }

    /// Whether this came from [`BindDevice`](Self::BindDevice), which the
    /// flow handler may answer with an unbound retry.
    #[must_use]
    pub const fn is_bind_failure(&self) -> bool {
        matches!(self, Self::BindDevice { .. })
    }

    pub fn connection_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr,
            reason: reason.into(),
        }
    }

    pub fn bind_device(interface: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BindDevice {
            interface: interface.into(),
            reason: reason.into(),
        }
    }

    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    /// Admission refused because every slot is taken
    #[error("{current} of {max} flow slots in use")]
    LimitReached { current: usize, max: usize },

    #[error("not admitting flows during shutdown")]
    ShuttingDown,

    /// TCP flow admitted without an original destination
    #[error("flow has no destination")]
    NoDestination,

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    /// Copying between the two sides failed
    #[error("relay: {0}")]
    Transfer(String),

    #[error("inbound io: {0}")]
    IoError(#[from] io::Error),
}

impl FlowError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LimitReached { .. } => true,
            Self::ShuttingDown | Self::NoDestination | Self::Transfer(_) => false,
            Self::Outbound(e) => e.is_recoverable(),
            Self::IoError(e) => transient_io(e) && e.kind() != io::ErrorKind::WouldBlock,
        }
    }

    pub const fn limit_reached(current: usize, max: usize) -> Self {
        Self::LimitReached { current, max }
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }
}

/// Transparent listener and reply-socket failures
#[derive(Debug, Error)]
pub enum TproxyError {
    #[error("socket(): {0}")]
    SocketCreation(String),

    #[error("setsockopt {option}: {reason}")]
    SocketOption { option: String, reason: String },

    #[error("bind {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    #[error("accept: {0}")]
    AcceptError(String),

    /// `SO_ORIGINAL_DST` lookup failed
    #[error("original destination unavailable: {0}")]
    OriginalDstError(String),

    #[error("recvmsg: {0}")]
    RecvError(String),

    /// Could not open a socket bound to a reply's source address
    #[error("reply socket for {addr}: {reason}")]
    ReplySocket { addr: SocketAddr, reason: String },

    #[error("IP_TRANSPARENT refused; run as root or grant CAP_NET_ADMIN")]
    PermissionDenied,

    #[error("tproxy io: {0}")]
    IoError(#[from] io::Error),
}

impl TproxyError {
    /// Per-connection and per-datagram failures are recoverable; setup
    /// failures are not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation(_)
            | Self::SocketOption { .. }
            | Self::BindError { .. }
            | Self::PermissionDenied => false,
            Self::AcceptError(_)
            | Self::OriginalDstError(_)
            | Self::RecvError(_)
            | Self::ReplySocket { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }

    pub fn reply_socket(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ReplySocket {
            addr,
            reason: reason.into(),
        }
    }
}

/// Control socket failures
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("cannot listen on {path}: {reason}")]
    BindError { path: String, reason: String },

    #[error("cannot reach control socket {0}")]
    ConnectionError(String),

    /// Bad framing or an undecodable body
    #[error("control protocol: {0}")]
    ProtocolError(String),

    #[error("control socket io: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::ConnectionError(_) | Self::ProtocolError(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:80".parse().unwrap()
    }

    #[test]
    fn test_setup_failures_are_final() {
        assert!(!ConfigError::ValidationError("x".into()).is_recoverable());
        assert!(!TproxyError::PermissionDenied.is_recoverable());
        assert!(!IpcError::BindError {
            path: "/run/x.sock".into(),
            reason: "EACCES".into()
        }
        .is_recoverable());

        let pinned = OutboundError::bind_device("eth9", "No such device");
        assert!(!pinned.is_recoverable());
        assert!(pinned.is_bind_failure());
        assert!(!RuleError::DuplicateId("r1".into()).is_recoverable());
    }

    #[test]
    fn test_runtime_failures_are_retryable() {
        assert!(TproxyError::AcceptError("EMFILE".into()).is_recoverable());
        assert!(OutboundError::Timeout {
            addr: addr(),
            timeout_ms: 10_000
        }
        .is_recoverable());
        assert!(RuleError::storage("/tmp/rules.json", "disk full").is_recoverable());
        assert!(FlowError::limit_reached(8, 8).is_recoverable());
        assert!(!FlowError::ShuttingDown.is_recoverable());
    }

    #[test]
    fn test_messages_name_the_subject() {
        assert!(TproxyError::PermissionDenied
            .to_string()
            .contains("CAP_NET_ADMIN"));

        let msg = OutboundError::connection_failed(addr(), "connection refused").to_string();
        assert!(msg.contains("127.0.0.1:80") && msg.contains("connection refused"));

        let msg = RuleError::invalid_pattern("10.0.0.0/33", "prefix out of range").to_string();
        assert!(msg.contains("10.0.0.0/33"));
    }

    #[test]
    fn test_conversions_keep_classification() {
        let router: RouterError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(router.is_recoverable());

        let router: RouterError = ConfigError::ValidationError("invalid".into()).into();
        assert!(!router.is_recoverable());

        let flow: FlowError = OutboundError::bind_device("wlan0", "EPERM").into();
        assert!(matches!(flow, FlowError::Outbound(ref e) if e.is_bind_failure()));
        assert!(!flow.is_recoverable());
    }
}
