//! Wire codec for the AOO ("audio over OSC") protocol.
//!
//! Every datagram exchanged between AOO endpoints uses one of two framings:
//!
//! - **OSC framing**: a plain OSC message whose address pattern starts with
//!   the domain prefix `/aoo`, followed by a type word (`/src`, `/sink`,
//!   `/server`, `/client`, `/peer`, `/relay`), an optional numeric id, and
//!   a verb. The single-character `/d` pattern is a compact variant used
//!   for single-frame stream data.
//! - **Binary framing**: a fixed little header whose first byte has the
//!   high bit set, which is impossible for OSC (address patterns begin with
//!   a printable `/`). Inspecting byte 0 is therefore enough to tell the
//!   two framings apart, and to quickly discard foreign traffic.
//!
//! This crate implements both framings plus the shared protocol
//! vocabulary: ids, NTP time tags, the version word, address
//! canonicalisation rules and metadata blobs. It does not touch sockets
//! and performs no allocation on the encode/decode hot paths; writers
//! borrow caller-provided buffers and readers yield borrowed slices.

pub mod binmsg;
pub mod osc;
pub mod pattern;
pub mod time;

mod address;
mod error;
mod metadata;

pub use address::*;
pub use error::*;
pub use metadata::*;

/// Entity identifier. Clients, groups, users, sources and sinks each have
/// their own id space.
pub type Id = i32;

/// Reserved "invalid" id value.
pub const INVALID_ID: Id = -1;

/// Maximum size of a single AOO datagram in bytes.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Maximum number of frames a block may be split into (bitset-limited).
pub const MAX_FRAME_COUNT: usize = 256;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The framing discriminant did not match, a header was truncated, or
    /// an argument type tag disagreed with the requested type.
    #[error("malformed packet")]
    BadFormat,
    /// The output buffer was too small for the encoded message.
    #[error("insufficient buffer")]
    Overflow,
}

pub const VERSION_MAJOR: u8 = 2;
pub const VERSION_MINOR: u8 = 0;
pub const VERSION_BUGFIX: u8 = 0;

/// Builds the 32-bit version word: `major << 24 | minor << 16 |
/// bugfix << 8 | protocol flags`.
#[inline(always)]
pub const fn make_version(protocol_flags: u8) -> u32 {
    ((VERSION_MAJOR as u32) << 24)
        | ((VERSION_MINOR as u32) << 16)
        | ((VERSION_BUGFIX as u32) << 8)
        | protocol_flags as u32
}

/// Two peers are compatible iff their major versions match.
#[inline(always)]
pub const fn check_version(version: u32) -> bool {
    (version >> 24) as u8 == VERSION_MAJOR
}

/// Extracts the protocol flags from the LSB of a version word.
#[inline(always)]
pub const fn version_flags(version: u32) -> u8 {
    version as u8
}

/// Sinks advertising this flag accept the compact `/d` data framing.
pub const PROTOCOL_FLAG_COMPACT_DATA: u8 = 0x01;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trip() {
        let v = make_version(PROTOCOL_FLAG_COMPACT_DATA);
        assert!(check_version(v));
        assert_eq!(version_flags(v), PROTOCOL_FLAG_COMPACT_DATA);
        assert!(!check_version(make_version(0) ^ (1 << 24)));
    }
}
