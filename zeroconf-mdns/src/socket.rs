//! Socket utilities for multicast DNS.
//!
//! The engine itself is sans-IO; [`MulticastSocket`] builds the UDP
//! socket a driver feeds it with.
//!
//! ```rust,ignore
//! use zeroconf_mdns::MulticastSocket;
//!
//! let std_socket = MulticastSocket::new().into_std()?;
//! let socket = tokio::net::UdpSocket::from_std(std_socket)?;
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::engine::MDNS_MULTICAST_IPV4;
use crate::MDNS_PORT;

/// Builder for a UDP socket joined to the mDNS multicast group.
///
/// The resulting socket has `SO_REUSEADDR` (and `SO_REUSEPORT` where
/// supported) enabled so it can share port 5353 with other responders,
/// and is set non-blocking for async drivers.
#[derive(Debug, Clone, Default)]
pub struct MulticastSocket {
    local_ipv4: Option<Ipv4Addr>,
    local_port: Option<u16>,
    interface: Option<Ipv4Addr>,
}

impl MulticastSocket {
    pub fn new() -> Self {
        MulticastSocket::default()
    }

    /// Overrides the local bind address. The platform default is the
    /// multicast group itself on Linux and `0.0.0.0` elsewhere.
    pub fn with_local_ipv4(mut self, local_ipv4: Ipv4Addr) -> Self {
        self.local_ipv4 = Some(local_ipv4);
        self
    }

    /// Overrides the local port, normally 5353.
    pub fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = Some(local_port);
        self
    }

    /// Joins the multicast group on one interface instead of
    /// `INADDR_ANY`.
    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Builds the configured `std::net::UdpSocket`.
    pub fn into_std(self) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;

        let local_ip = if let Some(local_ipv4) = self.local_ipv4 {
            IpAddr::V4(local_ipv4)
        } else if cfg!(target_os = "linux") {
            IpAddr::V4(MDNS_MULTICAST_IPV4)
        } else {
            // binding the group address does not work on Mac/Windows
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let local_addr = SocketAddr::new(local_ip, self.local_port.unwrap_or(MDNS_PORT));
        socket.bind(&local_addr.into())?;

        let iface = self.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(&MDNS_MULTICAST_IPV4, &iface)?;

        Ok(socket.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_constants() {
        assert_eq!(MDNS_MULTICAST_IPV4, Ipv4Addr::new(224, 0, 0, 251));
        assert_eq!(MDNS_PORT, 5353);
    }

    #[test]
    fn test_multicast_socket_builder() {
        let builder = MulticastSocket::new()
            .with_local_ipv4(Ipv4Addr::UNSPECIFIED)
            .with_local_port(5353);
        assert_eq!(builder.local_ipv4, Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(builder.local_port, Some(5353));
        assert!(builder.interface.is_none());
    }

    #[test]
    fn test_multicast_socket_with_interface() {
        let interface = Ipv4Addr::new(192, 168, 1, 100);
        let builder = MulticastSocket::new().with_interface(interface);
        assert_eq!(builder.interface, Some(interface));
    }

    // Socket creation itself needs network access and a free port, so
    // it is exercised by the examples rather than unit tests.
}
