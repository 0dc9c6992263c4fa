//! Raw socket plumbing for transparent interception.
//!
//! Intercepted traffic arrives on sockets that carry `IP_TRANSPARENT`. For
//! TCP the pre-redirect destination is read back with `SO_ORIGINAL_DST`; for
//! UDP the kernel attaches it to every datagram once `IP_RECVORIGDSTADDR` is
//! set on the listening socket.
//!
//! Answers to UDP clients have to appear to come from the address the client
//! originally targeted. Those reply sockets go through [`SocketProvider`], so
//! the demultiplexer can run in tests on plain loopback sockets.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::TproxyError;

/// `SOL_IP` option letting a socket bind and accept foreign addresses
pub const IP_TRANSPARENT: libc::c_int = 19;

/// `SOL_IP` getsockopt returning a redirected connection's destination
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// `SOL_IP` option requesting the original destination as ancillary data
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// Source of sockets used to answer UDP clients.
pub trait SocketProvider: Send + Sync {
    /// Returns a non-blocking datagram socket bound to `bind_addr`.
    ///
    /// `bind_addr` is normally not a local address; it is the destination the
    /// client sent to, so replies carry it as their source.
    ///
    /// # Errors
    ///
    /// `TproxyError::ReplySocket` naming the step that failed.
    fn create_reply_socket(&self, bind_addr: SocketAddr) -> Result<Socket, TproxyError>;
}

/// Transparent reply sockets; needs `CAP_NET_ADMIN`
#[derive(Debug, Clone, Default)]
pub struct TransparentSocketProvider;

impl TransparentSocketProvider {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SocketProvider for TransparentSocketProvider {
    fn create_reply_socket(&self, bind_addr: SocketAddr) -> Result<Socket, TproxyError> {
        let fail = |step: &str, e: &dyn std::fmt::Display| {
            TproxyError::reply_socket(bind_addr, format!("{step}: {e}"))
        };

        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| fail("socket", &e))?;
        set_ip_transparent(&socket).map_err(|e| fail("IP_TRANSPARENT", &e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| fail("SO_REUSEADDR", &e))?;
        socket
            .bind(&bind_addr.into())
            .map_err(|e| fail("bind (is net.ipv4.ip_nonlocal_bind enabled?)", &e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| fail("O_NONBLOCK", &e))?;

        debug!(%bind_addr, "reply socket ready");
        Ok(socket)
    }
}

/// Provider used by the daemon.
#[must_use]
pub fn default_socket_provider() -> Arc<dyn SocketProvider> {
    Arc::new(TransparentSocketProvider::new())
}

/// Hands out ordinary loopback sockets, or fails on request
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockSocketProvider {
    pub simulate_permission_denied: bool,
}

#[cfg(test)]
impl SocketProvider for MockSocketProvider {
    fn create_reply_socket(&self, bind_addr: SocketAddr) -> Result<Socket, TproxyError> {
        if self.simulate_permission_denied {
            return Err(TproxyError::reply_socket(bind_addr, "EPERM (simulated)"));
        }
        let std_socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .and_then(|s| s.set_nonblocking(true).map(|()| s))
            .map_err(|e| TproxyError::reply_socket(bind_addr, e.to_string()))?;
        Ok(Socket::from(std_socket))
    }
}

/// Listening stream socket for intercepted TCP.
///
/// # Errors
///
/// `TproxyError::PermissionDenied` without `CAP_NET_ADMIN`, otherwise
/// `SocketCreation` or `SocketOption`.
pub fn create_tproxy_tcp_socket(reuse_port: bool) -> Result<Socket, TproxyError> {
    let socket = transparent_ipv4(Type::STREAM, Protocol::TCP, reuse_port)?;
    debug!(reuse_port, "transparent TCP socket ready");
    Ok(socket)
}

/// Listening datagram socket for intercepted UDP; destinations arrive as cmsg.
///
/// # Errors
///
/// Same as [`create_tproxy_tcp_socket`].
pub fn create_tproxy_udp_socket(reuse_port: bool) -> Result<Socket, TproxyError> {
    let socket = transparent_ipv4(Type::DGRAM, Protocol::UDP, reuse_port)?;
    enable_sol_ip(&socket, IP_RECVORIGDSTADDR)
        .map_err(|e| TproxyError::socket_option("IP_RECVORIGDSTADDR", e.to_string()))?;
    debug!(reuse_port, "transparent UDP socket ready");
    Ok(socket)
}

fn transparent_ipv4(ty: Type, proto: Protocol, reuse_port: bool) -> Result<Socket, TproxyError> {
    let socket = Socket::new(Domain::IPV4, ty, Some(proto))
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;
    set_ip_transparent(&socket)?;

    let option =
        |name: &'static str| move |e: io::Error| TproxyError::socket_option(name, e.to_string());
    socket
        .set_reuse_address(true)
        .map_err(option("SO_REUSEADDR"))?;
    if reuse_port {
        socket.set_reuse_port(true).map_err(option("SO_REUSEPORT"))?;
    }
    socket.set_nonblocking(true).map_err(option("O_NONBLOCK"))?;
    Ok(socket)
}

fn set_ip_transparent(socket: &Socket) -> Result<(), TproxyError> {
    enable_sol_ip(socket, IP_TRANSPARENT).map_err(|e| match e.raw_os_error() {
        Some(libc::EPERM) => TproxyError::PermissionDenied,
        _ => TproxyError::socket_option("IP_TRANSPARENT", e.to_string()),
    })
}

/// Sets an integer `SOL_IP` option to 1.
fn enable_sol_ip(socket: &Socket, option: libc::c_int) -> io::Result<()> {
    let on: libc::c_int = 1;
    // SAFETY: `socket` keeps the descriptor open for the call and `on` is a
    // live c_int whose size is passed alongside it.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            option,
            std::ptr::addr_of!(on).cast::<libc::c_void>(),
            mem::size_of_val(&on) as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Destination an accepted TCP connection was addressed to before redirection.
///
/// # Errors
///
/// `TproxyError::OriginalDstError` when the kernel has no redirect record for
/// the socket (`ENOPROTOOPT`) or the call fails.
pub fn get_original_dst(fd: RawFd) -> Result<SocketAddr, TproxyError> {
    // SAFETY: sockaddr_in is plain data and valid when zeroed.
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&addr) as libc::socklen_t;

    // SAFETY: `addr` and `len` outlive the call and `len` matches `addr`.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        let detail = match err.raw_os_error() {
            Some(libc::ENOPROTOOPT) => format!("fd {fd} was not redirected by the kernel"),
            _ => format!("fd {fd}: {err}"),
        };
        return Err(TproxyError::OriginalDstError(detail));
    }

    Ok(sockaddr_v4(&addr))
}

/// Network-order `sockaddr_in` to a std address
pub(super) fn sockaddr_v4(addr: &libc::sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    SocketAddrV4::new(ip, u16::from_be(addr.sin_port)).into()
}

/// Probes for `CAP_NET_ADMIN` by trying to create a transparent socket.
#[must_use]
pub fn has_net_admin_capability() -> bool {
    !matches!(
        create_tproxy_tcp_socket(false),
        Err(TproxyError::PermissionDenied)
    )
}

#[must_use]
pub fn is_root() -> bool {
    // SAFETY: geteuid cannot fail.
    unsafe { libc::geteuid() == 0 }
}
