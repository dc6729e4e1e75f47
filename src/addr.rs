//! IPv4 socket addresses as seen by the engine.

use std::fmt;

/// An IPv4 address and a port number.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct SocketAddr {
    /// IPv4 address.
    pub addr: [u8; 4],
    /// Port number, in host byte order.
    pub port: u16,
}

impl SocketAddr {
    /// Creates a socket address from its address octets and port.
    pub const fn new(addr: [u8; 4], port: u16) -> Self {
        Self { addr, port }
    }

    /// The unspecified address (`0.0.0.0`) with the given port.
    pub const fn any(port: u16) -> Self {
        Self::new([0, 0, 0, 0], port)
    }
}

impl From<std::net::SocketAddrV4> for SocketAddr {
    fn from(addr: std::net::SocketAddrV4) -> Self {
        Self::new(addr.ip().octets(), addr.port())
    }
}

impl From<SocketAddr> for std::net::SocketAddrV4 {
    fn from(addr: SocketAddr) -> Self {
        std::net::SocketAddrV4::new(addr.addr.into(), addr.port)
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}",
            self.addr[0], self.addr[1], self.addr[2], self.addr[3], self.port,
        )
    }
}
