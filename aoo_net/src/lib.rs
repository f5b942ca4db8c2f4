//! Session control plane and peer-to-peer path.
//!
//! Three subsystems live here:
//!
//! - the **rendezvous server** ([`server::Server`]): a passive,
//!   host-driven broker that authenticates clients over TCP, manages
//!   groups and users, fans out peer endpoint information, and
//!   optionally relays UDP traffic between peers that cannot reach each
//!   other directly;
//! - the **client session engine** ([`client::Client`]): the per-node
//!   orchestrator that logs in to the server, joins groups, builds
//!   [`peer::Peer`]s from the roster and multiplexes any number of
//!   stream engines over one UDP socket;
//! - the **peer path** ([`peer`]): NAT-traversal handshake, liveness
//!   pings with RTT estimation, relay fallback, and a reliable,
//!   fragmented message sub-protocol with acknowledgements.
//!
//! All control requests are *commands*: they may be produced on any
//! thread, carry a reply callback, and execute on the network thread.

pub mod client;
pub mod peer;
pub mod reliable;
pub mod server;

mod digest;
mod link;
mod reactor;

pub use digest::encrypt_password;
pub use link::*;
pub use reactor::*;

pub use aoo_wire::AooError;

use aoo_wire::{Id, Metadata};

/// Default interval between UDP handshake probes.
pub const QUERY_INTERVAL_MS: u64 = 100;
/// Give up on a UDP handshake (server or peer) after this long.
pub const QUERY_TIMEOUT_MS: u64 = 5000;
/// Interval between liveness pings (server and connected peers).
pub const PING_INTERVAL_MS: u64 = 5000;

/// An error reply to a request: kind, system error code (if any) and a
/// human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({kind})")]
pub struct ErrorReply {
    pub kind: AooError,
    pub code: i32,
    pub message: String,
}

impl ErrorReply {
    pub fn new(kind: AooError) -> Self {
        Self {
            kind,
            code: 0,
            message: kind.to_string(),
        }
    }

    pub fn with_message(kind: AooError, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: 0,
            message: message.into(),
        }
    }
}

impl From<AooError> for ErrorReply {
    fn from(kind: AooError) -> Self {
        Self::new(kind)
    }
}

/// Successful request responses, by request kind.
#[derive(Debug)]
pub enum Response {
    Connect {
        client_id: Id,
        server_relay: bool,
        metadata: Option<Metadata>,
    },
    Disconnect,
    GroupJoin {
        group_id: Id,
        user_id: Id,
        group_metadata: Option<Metadata>,
        user_metadata: Option<Metadata>,
        private_metadata: Option<Metadata>,
    },
    GroupLeave,
    GroupUpdate {
        metadata: Option<Metadata>,
    },
    UserUpdate {
        metadata: Option<Metadata>,
    },
    Custom {
        data: Option<Metadata>,
        flags: i32,
    },
}

/// Reply callback attached to every request command.
pub type ReplyFn = Box<dyn FnOnce(Result<Response, ErrorReply>) + Send + 'static>;

/// A no-op reply callback for fire-and-forget requests.
pub fn ignore_reply() -> ReplyFn {
    Box::new(|_| {})
}

/// Identifies a peer within the session: `(group id, user id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub group: Id,
    pub user: Id,
}

impl core::fmt::Display for PeerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}|{}", self.group, self.user)
    }
}

/// Asynchronous session events, delivered in generation order per peer.
#[derive(Debug)]
pub enum ClientEvent {
    /// The TCP connection died or the session was closed.
    Disconnected(ErrorReply),
    /// A peer entered the roster and its UDP handshake started.
    PeerHandshake(PeerId, String, String),
    /// The UDP handshake completed; streaming is possible now.
    PeerJoin(PeerId, String, String, std::net::SocketAddr),
    /// A peer left (or its handshake was still pending when it did).
    PeerLeave(PeerId),
    /// A peer's UDP handshake gave up (direct and relayed).
    PeerTimeout(PeerId),
    /// Round-trip measurement for a connected peer.
    PeerPing {
        peer: PeerId,
        rtt: f64,
        average_rtt: f64,
    },
    /// An application message from a peer, in order if reliable.
    PeerMessage {
        peer: PeerId,
        tt: aoo_wire::time::NtpTime,
        data: Metadata,
    },
    /// Peer metadata changed.
    PeerUpdate(PeerId, Option<Metadata>),
    /// Group metadata changed (by the given user).
    GroupUpdate(Id, Id, Option<Metadata>),
    /// Our own user metadata was changed server-side.
    UserUpdate(Id, Id, Option<Metadata>),
    /// We were ejected from a group by the server.
    GroupEject(Id),
    /// Opaque server notification.
    Notification(Metadata),
    /// Non-fatal error worth surfacing.
    Error(ErrorReply),
}
