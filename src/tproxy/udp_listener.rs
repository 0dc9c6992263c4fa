//! Intercepted UDP
//!
//! All redirected datagrams land on one socket. The kernel reports where
//! each was headed in an `IP_RECVORIGDSTADDR` control message, so receiving
//! goes through `recvmsg` rather than `recv_from`.
//!
//! IPv4 only. Reply sockets bind to foreign addresses, which needs
//! `net.ipv4.ip_nonlocal_bind = 1` and usually `rp_filter = 0`.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::{Bytes, BytesMut};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::{info, trace};

use super::socket::{create_tproxy_udp_socket, sockaddr_v4, IP_RECVORIGDSTADDR};
use crate::config::ListenConfig;
use crate::error::TproxyError;
use crate::flow::MAX_DATAGRAM_SIZE;

/// Room for one `sockaddr_in` control message with headers
const CONTROL_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct UdpPacketInfo {
    pub data: Bytes,
    pub client_addr: SocketAddr,
    /// Where the client sent the datagram
    pub original_dst: SocketAddr,
}

#[derive(Debug)]
pub struct TproxyUdpListener {
    socket: UdpSocket,
    listen_addr: SocketAddr,
}

impl TproxyUdpListener {
    /// Binds the transparent datagram socket. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` without `CAP_NET_ADMIN`, `BindError` when the
    /// address is taken, or other socket setup failures.
    pub fn bind(config: &ListenConfig) -> Result<Self, TproxyError> {
        let socket = create_tproxy_udp_socket(config.reuse_port)?;
        socket
            .bind(&config.address.into())
            .map_err(|e| TproxyError::bind(config.address, e.to_string()))?;

        let socket = UdpSocket::from_std(socket.into())?;
        let listen_addr = socket.local_addr().unwrap_or(config.address);
        info!(%listen_addr, "intercepting UDP");
        Ok(Self {
            socket,
            listen_addr,
        })
    }

    /// Next datagram with its client and original destination.
    ///
    /// # Errors
    ///
    /// `RecvError` when `recvmsg` fails or the datagram carries no original
    /// destination.
    pub async fn recv_packet(&self) -> Result<UdpPacketInfo, TproxyError> {
        let mut buf = BytesMut::zeroed(MAX_DATAGRAM_SIZE);
        let fd = self.socket.as_raw_fd();
        let (len, client_addr, original_dst) = self
            .socket
            .async_io(Interest::READABLE, || recv_with_original_dst(fd, &mut buf))
            .await
            .map_err(|e| TproxyError::RecvError(e.to_string()))?;

        trace!(%client_addr, %original_dst, len, "datagram intercepted");
        buf.truncate(len);
        Ok(UdpPacketInfo {
            data: buf.freeze(),
            client_addr,
            original_dst,
        })
    }

    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

/// One `recvmsg` call; returns `(len, source, original destination)`.
///
/// `WouldBlock` is passed through so the caller can wait for readiness.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn recv_with_original_dst(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, SocketAddr)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = [0u8; CONTROL_LEN];

    // SAFETY: both are plain C structs for which all-zero is valid.
    let mut source: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(source).cast();
    msg.msg_namelen = mem::size_of_val(&source) as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = CONTROL_LEN as _;

    // SAFETY: `msg` only points at locals and `buf`, all alive for the call.
    let received = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "control data truncated"));
    }

    let destination = original_dst_from_control(&msg).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "no IP_RECVORIGDSTADDR in control data",
        )
    })?;
    Ok((received as usize, sockaddr_v4(&source), destination))
}

#[allow(clippy::cast_ptr_alignment)]
fn original_dst_from_control(msg: &libc::msghdr) -> Option<SocketAddr> {
    // SAFETY: `msg` was filled in by recvmsg and the CMSG macros never step
    // past msg_controllen.
    unsafe {
        let mut header = libc::CMSG_FIRSTHDR(msg);
        while let Some(h) = header.as_ref() {
            if h.cmsg_level == libc::SOL_IP && h.cmsg_type == IP_RECVORIGDSTADDR {
                let data = libc::CMSG_DATA(header).cast::<libc::sockaddr_in>();
                return Some(sockaddr_v4(&data.read_unaligned()));
            }
            header = libc::CMSG_NXTHDR(msg, header);
        }
    }
    None
}
