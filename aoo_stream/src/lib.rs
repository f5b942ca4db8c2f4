//! Audio stream engine: the sender-side packetizer with retransmission
//! history and the receiver-side jitter buffer with reordering,
//! gap-filling, loss recovery and dynamic resampling.
//!
//! The engine is transport-agnostic: the host (or the session layer in
//! `aoo_net`) owns the UDP socket and drives two entry points per
//! engine object:
//!
//! - `process()` from the real-time audio callback. Never blocks on I/O,
//!   never takes a writer lock, never allocates outside the pre-sized
//!   queues.
//! - `send()` / `handle_message()` from the network thread. All encoding,
//!   packetizing and retransmission happens here.
//!
//! The two threads meet in block-structured SPSC rings (`aoo_utils`):
//! resampled input samples flow from the audio callback to the encoder,
//! decoded output samples flow from the jitter buffer to the audio
//! callback, and a per-block sample-rate hint channel drives the dynamic
//! resampler on the far side.

pub mod codec;
pub mod event;
pub mod sink;
pub mod source;

mod block;
mod resample;
mod timing;

pub use block::{Block, BlockQueue, FrameSet, HistoryBuffer};
pub use event::{SinkEvent, SourceEvent, StreamState};
pub use resample::DynamicResampler;
pub use timing::{TimeDll, Timer, TimerResult};

use aoo_wire::Id;
use std::net::SocketAddr;

/// A remote stream endpoint: socket address plus source/sink id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub id: Id,
}

impl core::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}|{}", self.addr, self.id)
    }
}

/// Callback used to emit datagrams; the session layer routes them to the
/// peer path (applying relay wrapping when required).
pub type SendFn<'a> = &'a mut dyn FnMut(&[u8], SocketAddr);

/// One fragment of a stream block as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPacket<'a> {
    pub sequence: i32,
    /// The source's momentary effective sample rate.
    pub samplerate: f64,
    pub channel: i32,
    /// Encoded size of the whole block; `0` denotes a dropped block.
    pub total_size: i32,
    pub num_frames: i32,
    pub frame: i32,
    pub data: &'a [u8],
}

// Engine defaults (all tunable per engine).
pub const DEFAULT_SOURCE_BUFFER_MS: i32 = 25;
pub const DEFAULT_SINK_BUFFER_MS: i32 = 120;
pub const DEFAULT_PACKET_SIZE: usize = 512;
pub const MIN_PACKET_SIZE: usize = 64;
pub const DEFAULT_RESEND_BUFFER_MS: i32 = 1000;
pub const DEFAULT_REDUNDANCY: i32 = 1;
pub const DEFAULT_RESEND_LIMIT: i32 = 5;
pub const DEFAULT_RESEND_INTERVAL_MS: i32 = 10;
pub const MAX_RESEND_INTERVAL: f64 = 1.0;
pub const DEFAULT_RESEND_MAX_FRAMES: i32 = 16;
pub const DEFAULT_PING_INTERVAL_MS: i32 = 1000;
pub const DEFAULT_TIMEFILTER_BANDWIDTH: f64 = 0.012;
