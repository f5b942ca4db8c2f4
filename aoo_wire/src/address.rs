//! Socket address canonicalisation and the wire form of endpoints.
//!
//! Peer addresses on the wire are always *unmapped*: an IPv4 endpoint is
//! written as IPv4, never as an IPv4-in-IPv6 mapped address. A client
//! converts back to the mapped form only when its local socket is
//! IPv6-only with mapping enabled, right before the `sendto`.

use crate::osc::{OscReader, OscWriter};
use crate::WireError;
use std::net::{IpAddr, SocketAddr};

/// Canonicalises an address for the wire: IPv4-mapped IPv6 becomes IPv4.
#[inline]
pub fn unmapped(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// Maps an IPv4 address into the IPv6 space for v6-only sockets.
#[inline]
pub fn mapped(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) => SocketAddr::new(IpAddr::V6(ip.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

#[inline]
pub fn is_ipv4_mapped(addr: &SocketAddr) -> bool {
    matches!(addr.ip(), IpAddr::V6(ip) if ip.to_ipv4_mapped().is_some())
}

/// Writes an address as the `(name, port)` string pair used by the
/// control plane.
pub fn write_addr(w: &mut OscWriter, addr: SocketAddr) -> Result<(), WireError> {
    let addr = unmapped(addr);
    let mut name = arrayvec::ArrayString::<64>::new();
    use core::fmt::Write;
    write!(name, "{}", addr.ip()).map_err(|_| WireError::Overflow)?;
    w.str(&name)?;
    w.i32(addr.port() as i32)
}

/// Reads a `(name, port)` string pair back into a socket address.
pub fn read_addr(r: &mut OscReader) -> Result<SocketAddr, WireError> {
    let name = r.str()?;
    let port = r.i32()?;
    let ip: IpAddr = name.parse().map_err(|_| WireError::BadFormat)?;
    let port = u16::try_from(port).map_err(|_| WireError::BadFormat)?;
    Ok(SocketAddr::new(ip, port))
}

/// An unresolved relay endpoint as carried by the control plane: a host
/// name (not necessarily an IP literal) plus port.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostName {
    pub name: String,
    pub port: u16,
}

impl HostName {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// An empty host stands for "not provided".
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && self.port > 0
    }
}

impl core::fmt::Display for HostName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Writes an optional host pair; "not provided" is an empty name with
/// port zero.
pub fn write_host(w: &mut OscWriter, host: &HostName) -> Result<(), WireError> {
    w.str(&host.name)?;
    w.i32(host.port as i32)
}

pub fn read_host(r: &mut OscReader) -> Result<HostName, WireError> {
    let name = r.str()?;
    let port = r.i32()?;
    Ok(HostName {
        name: name.to_string(),
        port: u16::try_from(port).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmap_and_map() {
        let v4: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        let v6_mapped: SocketAddr = "[::ffff:192.0.2.1]:4000".parse().unwrap();
        assert_eq!(unmapped(v6_mapped), v4);
        assert_eq!(mapped(v4), v6_mapped);
        assert!(is_ipv4_mapped(&v6_mapped));
        assert!(!is_ipv4_mapped(&v4));

        let v6: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        assert_eq!(unmapped(v6), v6);
        assert_eq!(mapped(v6), v6);
    }

    #[test]
    fn addr_round_trip_unmaps() {
        let mut buf = [0u8; 128];
        let mut w = OscWriter::new(&mut buf, "/aoo/server/login", "si").unwrap();
        let mapped_addr: SocketAddr = "[::ffff:203.0.113.1]:5000".parse().unwrap();
        write_addr(&mut w, mapped_addr).unwrap();
        let bytes = w.finish().to_vec();
        let mut r = OscReader::parse(&bytes).unwrap();
        let parsed = read_addr(&mut r).unwrap();
        assert_eq!(parsed, "203.0.113.1:5000".parse().unwrap());
    }
}
