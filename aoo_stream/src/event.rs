//! Events raised by the stream engines.
//!
//! Events are pushed from whichever thread observed them and drained by
//! the host through a channel receiver; the audio thread only ever
//! pushes, so delivery never blocks processing.

use crate::codec::Format;
use crate::Endpoint;
use aoo_wire::time::NtpTime;

/// Play/stop state of a remote source as observed by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Playing,
}

/// Events raised by a [`crate::sink::Sink`].
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// A new source started talking to this sink.
    SourceAdded(Endpoint),
    /// A source pushed a new format (salt change).
    Format(Endpoint, Format),
    /// The source started or stopped delivering audio.
    State(Endpoint, StreamState),
    /// Blocks given up on (delivered as silence).
    BlockLost(Endpoint, i32),
    /// Blocks that arrived out of sequence order.
    BlockReordered(Endpoint, i32),
    /// Blocks recovered through retransmission.
    BlockResent(Endpoint, i32),
    /// Sequence gaps observed (in blocks).
    BlockGap(Endpoint, i32),
    /// Ping from a source; `tt1` is the source send time, `tt2` our
    /// receive time.
    Ping(Endpoint, NtpTime, NtpTime),
}

/// Events raised by a [`crate::source::Source`].
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A sink asked to be added (invitation).
    Invite(Endpoint),
    /// A sink asked to be removed.
    Uninvite(Endpoint),
    /// Ping reply from a sink: `(tt1, tt2, tt3)` are our send time, the
    /// sink receive time and our reply-receive time; `lost` is the
    /// sink's packet-loss count since its last ping.
    PingReply(Endpoint, NtpTime, NtpTime, NtpTime, i32),
    /// A sink asked for a codec change. The host decides whether to
    /// apply it (see `respect_codec_change`).
    CodecChangeRequest(Endpoint, Format),
}
