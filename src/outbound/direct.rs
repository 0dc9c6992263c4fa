//! Direct dialer
//!
//! Connects straight to the destination, pinning the socket to an
//! interface before connect. On Linux the pin is `SO_BINDTODEVICE`; on
//! macOS it is `IP_BOUND_IF`/`IPV6_BOUND_IF` by interface index.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::traits::{Dialer, OutboundConnection};
use crate::config::OutboundConfig;
use crate::error::OutboundError;

/// Maximum interface name length (IFNAMSIZ - 1)
pub const INTERFACE_MAX_LEN: usize = 15;

/// Dialer that opens real sockets
#[derive(Debug)]
pub struct DirectDialer {
    config: OutboundConfig,
    connects: AtomicU64,
    failures: AtomicU64,
}

impl DirectDialer {
    #[must_use]
    pub const fn new(config: OutboundConfig) -> Self {
        Self {
            config,
            connects: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Connect attempts and failures since creation
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.connects.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }

    fn create_socket(
        &self,
        addr: SocketAddr,
        ty: Type,
        protocol: Protocol,
        interface: Option<&str>,
    ) -> Result<Socket, OutboundError> {
        let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))
            .map_err(|e| OutboundError::socket_option("socket", e.to_string()))?;

        if let Some(interface) = interface {
            bind_to_interface(&socket, interface, addr.is_ipv6())?;
        }

        if let Some(mark) = self.config.routing_mark {
            set_routing_mark(&socket, mark)?;
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| OutboundError::socket_option("O_NONBLOCK", e.to_string()))?;
        Ok(socket)
    }

    fn create_tcp_socket(
        &self,
        addr: SocketAddr,
        interface: Option<&str>,
    ) -> Result<Socket, OutboundError> {
        let socket = self.create_socket(addr, Type::STREAM, Protocol::TCP, interface)?;

        let keepalive = TcpKeepalive::new()
            .with_time(self.config.keepalive_time())
            .with_interval(self.config.keepalive_interval());
        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| OutboundError::socket_option("TCP_KEEPALIVE", e.to_string()))?;
        Ok(socket)
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(OutboundConfig::default())
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn connect_tcp(
        &self,
        addr: SocketAddr,
        interface: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<OutboundConnection, OutboundError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let result = self.connect_inner(addr, interface, connect_timeout).await;
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn bind_udp(
        &self,
        peer: SocketAddr,
        interface: Option<&str>,
    ) -> Result<UdpSocket, OutboundError> {
        let socket = self.create_socket(peer, Type::DGRAM, Protocol::UDP, interface)?;
        let any: SocketAddr = if peer.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        socket
            .bind(&any.into())
            .map_err(|e| OutboundError::socket_option("bind", e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        debug!(interface = interface.unwrap_or("default"), "Bound outbound UDP socket");
        Ok(socket)
    }
}

impl DirectDialer {
    async fn connect_inner(
        &self,
        addr: SocketAddr,
        interface: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<OutboundConnection, OutboundError> {
        let socket = self.create_tcp_socket(addr, interface)?;

        // non-blocking connect reports EINPROGRESS
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(OutboundError::connection_failed(addr, e.to_string())),
        }

        // TcpStream owns the fd from here; every early return closes it
        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| OutboundError::connection_failed(addr, e.to_string()))?;

        let connected = timeout(connect_timeout, async {
            stream
                .writable()
                .await
                .map_err(|e| OutboundError::connection_failed(addr, e.to_string()))?;
            match stream.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(e)) | Err(e) => Err(OutboundError::connection_failed(addr, e.to_string())),
            }
        })
        .await;

        match connected {
            Ok(Ok(())) => {
                if self.config.tcp_nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                }
                debug!(%addr, interface = interface.unwrap_or("default"), "Outbound connected");
                Ok(OutboundConnection::new(
                    stream,
                    addr,
                    interface.map(str::to_string),
                ))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OutboundError::Timeout {
                addr,
                timeout_ms: u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

/// Pin `socket` to `interface`
///
/// # Errors
///
/// `OutboundError::BindDevice` if the name is unusable or the kernel
/// rejects the option.
#[cfg(target_os = "linux")]
pub fn bind_to_interface(socket: &Socket, interface: &str, _ipv6: bool) -> Result<(), OutboundError> {
    validate_interface_name(interface)?;

    // NUL-terminated, IFNAMSIZ bytes
    let mut ifname = [0u8; INTERFACE_MAX_LEN + 1];
    ifname[..interface.len()].copy_from_slice(interface.as_bytes());

    // SAFETY: fd is valid for the lifetime of `socket`; ifname outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr().cast::<libc::c_void>(),
            ifname.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(OutboundError::bind_device(
            interface,
            io::Error::last_os_error().to_string(),
        ));
    }

    debug!(%interface, "socket bound to device");
    Ok(())
}

/// Pin `socket` to `interface`
///
/// # Errors
///
/// `OutboundError::BindDevice` if the interface is unknown or the kernel
/// rejects the option.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn bind_to_interface(socket: &Socket, interface: &str, ipv6: bool) -> Result<(), OutboundError> {
    validate_interface_name(interface)?;
    let name = std::ffi::CString::new(interface)
        .map_err(|_| OutboundError::bind_device(interface, "interface name contains NUL"))?;

    // SAFETY: name is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(OutboundError::bind_device(interface, "no such interface"));
    }

    let (level, option) = if ipv6 {
        (libc::IPPROTO_IPV6, libc::IPV6_BOUND_IF)
    } else {
        (libc::IPPROTO_IP, libc::IP_BOUND_IF)
    };
    // SAFETY: fd is valid; index lives for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            std::ptr::addr_of!(index).cast::<libc::c_void>(),
            mem::size_of::<libc::c_uint>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(OutboundError::bind_device(
            interface,
            io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

/// Pin `socket` to `interface`
///
/// # Errors
///
/// Always fails: the platform has no per-socket interface binding.
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
pub fn bind_to_interface(_socket: &Socket, interface: &str, _ipv6: bool) -> Result<(), OutboundError> {
    Err(OutboundError::bind_device(
        interface,
        "interface binding is not supported on this platform",
    ))
}

fn validate_interface_name(interface: &str) -> Result<(), OutboundError> {
    if interface.is_empty() || interface.len() > INTERFACE_MAX_LEN {
        return Err(OutboundError::bind_device(
            interface,
            format!("interface name must be 1-{INTERFACE_MAX_LEN} bytes"),
        ));
    }
    if interface.bytes().any(|b| b == 0 || b == b'/' || b.is_ascii_whitespace()) {
        return Err(OutboundError::bind_device(interface, "invalid interface name"));
    }
    Ok(())
}

/// Tags outbound packets so policy routing can skip re-interception.
#[cfg(target_os = "linux")]
fn set_routing_mark(socket: &Socket, mark: u32) -> Result<(), OutboundError> {
    // SAFETY: fd is valid; mark lives for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(OutboundError::socket_option(
            "SO_MARK",
            format!("SO_MARK {mark}: {err}"),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_routing_mark(_socket: &Socket, mark: u32) -> Result<(), OutboundError> {
    Err(OutboundError::socket_option(
        "SO_MARK",
        format!("routing mark {mark} is only supported on Linux"),
    ))
}
