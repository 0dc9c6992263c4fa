//! Kernel-redirected traffic in, flows out.
//!
//! [`TproxyListener`] accepts TCP connections diverted by the `TPROXY`
//! target and recovers their destination. [`TproxyUdpListener`] receives
//! diverted datagrams, which [`UdpDemux`] groups into one association per
//! client address. Only IPv4 is handled.
//!
//! The host needs `CAP_NET_ADMIN`, `net.ipv4.ip_nonlocal_bind = 1` (replies
//! leave from the address the client targeted) and `rp_filter` off. A
//! policy route sends marked packets to the local stack:
//!
//! ```bash
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! for proto in tcp udp; do
//!   iptables -t mangle -A PREROUTING -i br-lan -p $proto -j TPROXY \
//!       --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
//! done
//! ```
//!
//! Give dialed sockets an `outbound.routing_mark` and skip that mark in the
//! rules above, or outbound traffic loops back in.

mod dispatch;
mod listener;
mod socket;
mod udp_listener;

pub use dispatch::{run_accept_loop, run_udp_loop, TproxyAssociation, UdpDemux};
pub use listener::{InterceptedConnection, TproxyListener};
pub use socket::{
    create_tproxy_tcp_socket, create_tproxy_udp_socket, default_socket_provider, get_original_dst,
    has_net_admin_capability, is_root, SocketProvider, TransparentSocketProvider,
    IP_RECVORIGDSTADDR, IP_TRANSPARENT, SO_ORIGINAL_DST,
};
pub use udp_listener::{TproxyUdpListener, UdpPacketInfo};

#[cfg(test)]
pub use socket::MockSocketProvider;
