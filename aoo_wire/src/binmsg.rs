//! Compact binary message framing.
//!
//! Byte 0 carries the message type with the high (domain) bit set, which
//! cleanly separates binary traffic from OSC traffic (an OSC address
//! pattern starts with an ASCII `/`). Byte 1 carries the command, with
//! bit 0x40 selecting the wide header variant:
//!
//! ```text
//! short:  type|0x80, cmd,      to:u8,  from:u8
//! long:   type|0x80, cmd|0x40, 0, 0,   to:i32 BE, from:i32 BE
//! ```
//!
//! The relay header replaces ids with the ultimate destination address:
//!
//! ```text
//! type=Relay|0x80, cmd=(Ipv4|Ipv6), port:u16 BE, addr (4 or 16 bytes)
//! ```

use crate::{Id, INVALID_ID, WireError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// High bit of byte 0; set on every binary message.
pub const DOMAIN_BIT: u8 = 0x80;
/// Bit of byte 1 selecting 32-bit ids.
pub const WIDE_ID_BIT: u8 = 0x40;

pub const SHORT_HEADER_SIZE: usize = 4;
pub const LONG_HEADER_SIZE: usize = 12;
pub const RELAY_HEADER_SIZE_V4: usize = 8;
pub const RELAY_HEADER_SIZE_V6: usize = 20;

/// Message type discriminator shared by both wire framings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Source = 0,
    Sink = 1,
    Server = 2,
    Client = 3,
    Peer = 4,
    Relay = 5,
}

impl MsgType {
    #[inline]
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Source,
            1 => Self::Sink,
            2 => Self::Server,
            3 => Self::Client,
            4 => Self::Peer,
            5 => Self::Relay,
            _ => return None,
        })
    }
}

/// Peer commands in the binary framing.
pub const CMD_MESSAGE: u8 = 0;
pub const CMD_ACK: u8 = 1;

/// Relay commands (the address family of the embedded destination).
pub const CMD_RELAY_IPV4: u8 = 0;
pub const CMD_RELAY_IPV6: u8 = 1;

/// Returns `true` if the packet uses the binary framing.
#[inline(always)]
pub fn is_binary(data: &[u8]) -> bool {
    data.len() >= SHORT_HEADER_SIZE && (data[0] & DOMAIN_BIT) != 0
}

/// Writes a header without ids. Always the short form.
pub fn write_header(buf: &mut [u8], msg_type: MsgType, cmd: u8) -> Result<usize, WireError> {
    if buf.len() < SHORT_HEADER_SIZE {
        return Err(WireError::Overflow);
    }
    buf[0] = msg_type as u8 | DOMAIN_BIT;
    buf[1] = cmd;
    buf[2] = 0;
    buf[3] = 0;
    Ok(SHORT_HEADER_SIZE)
}

/// Writes a header addressed with `(to, from)` ids, choosing the short
/// form whenever both fit into a byte.
pub fn write_header_to_from(
    buf: &mut [u8],
    msg_type: MsgType,
    cmd: u8,
    to: Id,
    from: Id,
) -> Result<usize, WireError> {
    if to >= 256 || from >= 256 {
        if buf.len() < LONG_HEADER_SIZE {
            return Err(WireError::Overflow);
        }
        buf[0] = msg_type as u8 | DOMAIN_BIT;
        buf[1] = cmd | WIDE_ID_BIT;
        buf[2] = 0;
        buf[3] = 0;
        buf[4..8].copy_from_slice(&to.to_be_bytes());
        buf[8..12].copy_from_slice(&from.to_be_bytes());
        Ok(LONG_HEADER_SIZE)
    } else {
        if buf.len() < SHORT_HEADER_SIZE {
            return Err(WireError::Overflow);
        }
        buf[0] = msg_type as u8 | DOMAIN_BIT;
        buf[1] = cmd;
        buf[2] = to as u8;
        buf[3] = from as u8;
        Ok(SHORT_HEADER_SIZE)
    }
}

/// Decoded view of a binary message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub cmd: u8,
    pub to: Id,
    pub from: Id,
    /// Offset of the payload.
    pub size: usize,
}

/// Parses a binary header, including the id variant selection.
pub fn read_header(data: &[u8]) -> Result<Header, WireError> {
    if !is_binary(data) {
        return Err(WireError::BadFormat);
    }
    let msg_type = MsgType::from_u8(data[0] & !DOMAIN_BIT).ok_or(WireError::BadFormat)?;
    let wide = data[1] & WIDE_ID_BIT != 0;
    let cmd = data[1] & !WIDE_ID_BIT;
    if wide {
        if data.len() < LONG_HEADER_SIZE {
            return Err(WireError::BadFormat);
        }
        Ok(Header {
            msg_type,
            cmd,
            to: Id::from_be_bytes(data[4..8].try_into().unwrap()),
            from: Id::from_be_bytes(data[8..12].try_into().unwrap()),
            size: LONG_HEADER_SIZE,
        })
    } else {
        Ok(Header {
            msg_type,
            cmd,
            to: data[2] as Id,
            from: data[3] as Id,
            size: SHORT_HEADER_SIZE,
        })
    }
}

/// In peer messages the `to` field carries the group id and `from` the
/// sender's user id.
impl Header {
    #[inline(always)]
    pub const fn group(&self) -> Id {
        self.to
    }

    #[inline(always)]
    pub const fn user(&self) -> Id {
        self.from
    }
}

/// Writes a relay header carrying the given destination (or, after a
/// server rewrite, source) address. The inner packet follows immediately.
pub fn write_relay_header(buf: &mut [u8], addr: SocketAddr) -> Result<usize, WireError> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            if buf.len() < RELAY_HEADER_SIZE_V4 {
                return Err(WireError::Overflow);
            }
            buf[0] = MsgType::Relay as u8 | DOMAIN_BIT;
            buf[1] = CMD_RELAY_IPV4;
            buf[2..4].copy_from_slice(&addr.port().to_be_bytes());
            buf[4..8].copy_from_slice(&ip.octets());
            Ok(RELAY_HEADER_SIZE_V4)
        }
        IpAddr::V6(ip) => {
            if buf.len() < RELAY_HEADER_SIZE_V6 {
                return Err(WireError::Overflow);
            }
            buf[0] = MsgType::Relay as u8 | DOMAIN_BIT;
            buf[1] = CMD_RELAY_IPV6;
            buf[2..4].copy_from_slice(&addr.port().to_be_bytes());
            buf[4..20].copy_from_slice(&ip.octets());
            Ok(RELAY_HEADER_SIZE_V6)
        }
    }
}

/// Parses a relay header, returning the embedded address and the offset
/// of the wrapped packet.
pub fn read_relay_header(data: &[u8]) -> Result<(SocketAddr, usize), WireError> {
    let header = read_header(data)?;
    if header.msg_type != MsgType::Relay {
        return Err(WireError::BadFormat);
    }
    match data[1] {
        CMD_RELAY_IPV4 => {
            if data.len() < RELAY_HEADER_SIZE_V4 {
                return Err(WireError::BadFormat);
            }
            let port = u16::from_be_bytes(data[2..4].try_into().unwrap());
            let octets: [u8; 4] = data[4..8].try_into().unwrap();
            Ok((
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port),
                RELAY_HEADER_SIZE_V4,
            ))
        }
        CMD_RELAY_IPV6 => {
            if data.len() < RELAY_HEADER_SIZE_V6 {
                return Err(WireError::BadFormat);
            }
            let port = u16::from_be_bytes(data[2..4].try_into().unwrap());
            let octets: [u8; 16] = data[4..20].try_into().unwrap();
            Ok((
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
                RELAY_HEADER_SIZE_V6,
            ))
        }
        _ => Err(WireError::BadFormat),
    }
}

/// Dummy id used in headers whose command does not address an entity.
pub const NO_ID: Id = INVALID_ID;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header_round_trip() {
        let mut buf = [0u8; 16];
        let n = write_header_to_from(&mut buf, MsgType::Peer, CMD_ACK, 3, 250).unwrap();
        assert_eq!(n, SHORT_HEADER_SIZE);
        assert_eq!(&buf[..4], &[MsgType::Peer as u8 | 0x80, CMD_ACK, 3, 250]);
        let h = read_header(&buf[..n]).unwrap();
        assert_eq!(h.msg_type, MsgType::Peer);
        assert_eq!(h.cmd, CMD_ACK);
        assert_eq!((h.to, h.from), (3, 250));
    }

    #[test]
    fn long_header_round_trip() {
        let mut buf = [0u8; 16];
        let n = write_header_to_from(&mut buf, MsgType::Peer, CMD_MESSAGE, 256, 7).unwrap();
        assert_eq!(n, LONG_HEADER_SIZE);
        assert_eq!(buf[1], CMD_MESSAGE | WIDE_ID_BIT);
        let h = read_header(&buf[..n]).unwrap();
        assert_eq!((h.msg_type, h.cmd), (MsgType::Peer, CMD_MESSAGE));
        assert_eq!((h.to, h.from), (256, 7));
    }

    #[test]
    fn osc_traffic_is_not_binary() {
        assert!(!is_binary(b"/aoo/peer/ping\0\0"));
        assert!(is_binary(&[0x84, 0, 0, 0]));
        assert!(!is_binary(&[0x84])); // truncated
    }

    #[test]
    fn relay_header_v4() {
        let mut buf = [0u8; 32];
        let addr: SocketAddr = "198.51.100.1:5000".parse().unwrap();
        let n = write_relay_header(&mut buf, addr).unwrap();
        assert_eq!(n, RELAY_HEADER_SIZE_V4);
        assert_eq!(buf[0], MsgType::Relay as u8 | DOMAIN_BIT);
        assert_eq!(buf[1], CMD_RELAY_IPV4);
        let (parsed, onset) = read_relay_header(&buf[..n]).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(onset, n);
    }

    #[test]
    fn relay_header_v6() {
        let mut buf = [0u8; 32];
        let addr: SocketAddr = "[2001:db8::1]:9999".parse().unwrap();
        let n = write_relay_header(&mut buf, addr).unwrap();
        assert_eq!(n, RELAY_HEADER_SIZE_V6);
        let (parsed, onset) = read_relay_header(&buf[..n]).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(onset, n);
    }
}
