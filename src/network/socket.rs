// UDP socket construction for the engines
//
// Bind through socket2 so we can set reuse_address before the bind and
// manage multicast membership, then hand the socket to tokio.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Bind the engine socket: reuse-address (several engines may share a
/// machine), broadcast enabled, non-blocking for tokio.
pub fn bind(bind_addr: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(Error::Bind)?;

    socket.set_reuse_address(true).map_err(Error::Bind)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true).map_err(Error::Bind)?;

    let addr = SocketAddr::V4(SocketAddrV4::new(bind_addr, port));
    socket.bind(&addr.into()).map_err(Error::Bind)?;
    socket.set_broadcast(true).map_err(Error::Bind)?;
    socket.set_nonblocking(true).map_err(Error::Bind)?;

    let socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(socket).map_err(Error::Bind)
}

/// Join an IPv4 multicast group on the engine socket.
pub fn join_multicast(socket: &UdpSocket, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
    socket
        .join_multicast_v4(group, interface)
        .map_err(Error::Multicast)
}

/// Leave an IPv4 multicast group.
pub fn leave_multicast(socket: &UdpSocket, group: Ipv4Addr, interface: Ipv4Addr) -> Result<()> {
    socket
        .leave_multicast_v4(group, interface)
        .map_err(Error::Multicast)
}
