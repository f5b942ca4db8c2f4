//! Reliable (and unreliable) peer message buffers.
//!
//! A logical message is fragmented into frames sized to the peer path
//! MTU. The sender keeps a [`SentMessage`] per in-flight message and
//! retransmits unacknowledged frames with exponential backoff; the
//! receiver reassembles frames in a [`ReceiveBuffer`] that preserves
//! strict per-peer sequence order, inserting placeholders for messages
//! whose first fragment has not arrived yet.

use aoo_stream::FrameSet;
use aoo_wire::time::NtpTime;
use aoo_wire::{INVALID_ID, MAX_FRAME_COUNT};
use std::collections::VecDeque;

/// Resend backoff parameters (seconds).
pub const MIN_RESEND_INTERVAL: f64 = 0.02;
pub const MAX_RESEND_INTERVAL: f64 = 1.0;
const RESEND_BACKOFF: f64 = 2.0;

/// An acknowledgement unit: `frame == -1` covers the whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageAck {
    pub sequence: i32,
    pub frame: i32,
}

/// One reliable message awaiting acknowledgement.
#[derive(Debug)]
pub struct SentMessage {
    pub data: Vec<u8>,
    pub dtype: i32,
    pub tt: NtpTime,
    pub sequence: i32,
    pub num_frames: i32,
    pub frame_size: i32,
    frames: FrameSet,
    last_send: f64,
    interval: f64,
}

impl SentMessage {
    pub fn new(
        data: Vec<u8>,
        dtype: i32,
        tt: NtpTime,
        sequence: i32,
        num_frames: i32,
        frame_size: i32,
        interval: f64,
    ) -> Self {
        debug_assert!(num_frames as usize <= MAX_FRAME_COUNT);
        Self {
            data,
            dtype,
            tt,
            sequence,
            num_frames,
            frame_size,
            frames: FrameSet::all_missing(num_frames as usize),
            last_send: 0.0,
            interval: interval.clamp(MIN_RESEND_INTERVAL, MAX_RESEND_INTERVAL),
        }
    }

    /// Whether frames should be retransmitted now. The first call only
    /// arms the timer; each subsequent hit doubles the interval up to
    /// one second.
    pub fn need_resend(&mut self, now: f64) -> bool {
        if self.last_send > 0.0 {
            if now - self.last_send >= self.interval {
                self.last_send = now;
                self.interval = (self.interval * RESEND_BACKOFF).min(MAX_RESEND_INTERVAL);
                return true;
            }
        } else {
            self.last_send = now;
        }
        false
    }

    #[inline(always)]
    pub fn has_frame(&self, frame: i32) -> bool {
        !self.frames.is_missing(frame as usize)
    }

    /// Bytes of one frame.
    pub fn frame(&self, frame: i32) -> &[u8] {
        if self.num_frames == 1 {
            &self.data
        } else if frame == self.num_frames - 1 {
            &self.data[(frame * self.frame_size) as usize..]
        } else {
            let onset = (frame * self.frame_size) as usize;
            &self.data[onset..onset + self.frame_size as usize]
        }
    }

    pub fn ack_frame(&mut self, frame: i32) {
        if frame >= 0 && frame < self.num_frames {
            self.frames.clear(frame as usize);
        }
    }

    pub fn ack_all(&mut self) {
        self.frames = FrameSet::default();
    }

    #[inline(always)]
    pub fn complete(&self) -> bool {
        self.frames.none_missing()
    }

    /// Frames not yet acknowledged.
    pub fn missing_frames(&self) -> impl Iterator<Item = i32> + '_ {
        (0..self.num_frames).filter(|&f| !self.has_frame(f))
    }
}

/// In-flight reliable messages, in send order.
#[derive(Debug, Default)]
pub struct SendBuffer {
    messages: VecDeque<SentMessage>,
}

impl SendBuffer {
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn push(&mut self, message: SentMessage) -> &mut SentMessage {
        self.messages.push_back(message);
        self.messages.back_mut().unwrap()
    }

    pub fn find(&mut self, sequence: i32) -> Option<&mut SentMessage> {
        self.messages.iter_mut().find(|m| m.sequence == sequence)
    }

    /// Pops fully acknowledged messages off the front.
    pub fn pop_complete(&mut self) {
        while self.messages.front().is_some_and(SentMessage::complete) {
            self.messages.pop_front();
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SentMessage> {
        self.messages.iter_mut()
    }
}

/// One message under reassembly.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub sequence: i32,
    pub dtype: i32,
    pub tt: NtpTime,
    buffer: Vec<u8>,
    frames: FrameSet,
    num_frames: i32,
}

impl ReceivedMessage {
    /// A placeholder for a sequence whose metadata has not arrived.
    pub fn placeholder(sequence: i32) -> Self {
        Self {
            sequence,
            dtype: aoo_wire::DATA_UNSPECIFIED,
            tt: NtpTime::EMPTY,
            buffer: Vec::new(),
            // all bits set, so complete() stays false until init
            frames: FrameSet::all_missing(MAX_FRAME_COUNT),
            num_frames: 0,
        }
    }

    pub fn init(&mut self, num_frames: i32, total_size: usize) {
        debug_assert!(num_frames as usize <= MAX_FRAME_COUNT);
        self.buffer.clear();
        self.buffer.resize(total_size, 0);
        self.num_frames = num_frames;
        self.frames = FrameSet::all_missing(num_frames as usize);
    }

    #[inline(always)]
    pub fn initialized(&self) -> bool {
        self.num_frames > 0
    }

    pub fn set_info(&mut self, dtype: i32, tt: NtpTime) {
        self.dtype = dtype;
        self.tt = tt;
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    #[inline(always)]
    pub fn complete(&self) -> bool {
        self.frames.none_missing()
    }

    #[inline(always)]
    pub fn has_frame(&self, frame: i32) -> bool {
        frame >= 0 && frame < self.num_frames && !self.frames.is_missing(frame as usize)
    }

    /// Copies a frame into place; rejects frames that do not fit.
    #[must_use]
    pub fn add_frame(&mut self, frame: i32, data: &[u8]) -> bool {
        if frame < 0 || frame >= self.num_frames {
            return false;
        }
        if frame == self.num_frames - 1 {
            let Some(onset) = self.buffer.len().checked_sub(data.len()) else {
                return false;
            };
            self.buffer[onset..].copy_from_slice(data);
        } else {
            let onset = frame as usize * data.len();
            let Some(slot) = self.buffer.get_mut(onset..onset + data.len()) else {
                return false;
            };
            slot.copy_from_slice(data);
        }
        self.frames.clear(frame as usize);
        true
    }
}

/// Ordered reassembly buffer for reliable messages.
#[derive(Debug)]
pub struct ReceiveBuffer {
    messages: VecDeque<ReceivedMessage>,
    last_pushed: i32,
    last_popped: i32,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self {
            messages: VecDeque::new(),
            last_pushed: INVALID_ID,
            last_popped: INVALID_ID,
        }
    }
}

impl ReceiveBuffer {
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[inline(always)]
    pub fn last_pushed(&self) -> i32 {
        self.last_pushed
    }

    #[inline(always)]
    pub fn last_popped(&self) -> i32 {
        self.last_popped
    }

    pub fn push(&mut self, message: ReceivedMessage) -> &mut ReceivedMessage {
        self.last_pushed = message.sequence;
        self.messages.push_back(message);
        self.messages.back_mut().unwrap()
    }

    pub fn find(&mut self, sequence: i32) -> Option<&mut ReceivedMessage> {
        self.messages.iter_mut().find(|m| m.sequence == sequence)
    }

    pub fn front(&self) -> Option<&ReceivedMessage> {
        self.messages.front()
    }

    pub fn pop_front(&mut self) -> Option<ReceivedMessage> {
        let message = self.messages.pop_front()?;
        self.last_popped = message.sequence;
        Some(message)
    }

    /// Marker for the scratch slot used by unreliable multi-frame
    /// assembly.
    pub fn scratch() -> ReceivedMessage {
        ReceivedMessage::placeholder(INVALID_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_message_frames_and_acks() {
        // 10 bytes in 3 frames of 4/4/2
        let mut msg = SentMessage::new(
            (0u8..10).collect(),
            1,
            NtpTime::EMPTY,
            0,
            3,
            4,
            MIN_RESEND_INTERVAL,
        );
        assert_eq!(msg.frame(0), &[0, 1, 2, 3]);
        assert_eq!(msg.frame(2), &[8, 9]);
        assert_eq!(msg.missing_frames().count(), 3);

        msg.ack_frame(1);
        assert_eq!(msg.missing_frames().collect::<Vec<_>>(), vec![0, 2]);
        msg.ack_all();
        assert!(msg.complete());
    }

    #[test]
    fn resend_backoff_doubles() {
        let mut msg = SentMessage::new(vec![0; 4], 1, NtpTime::EMPTY, 0, 1, 4, 0.02);
        // first call arms
        assert!(!msg.need_resend(0.0));
        assert!(!msg.need_resend(0.01));
        assert!(msg.need_resend(0.02));
        // interval now 0.04
        assert!(!msg.need_resend(0.05));
        assert!(msg.need_resend(0.06));
    }

    #[test]
    fn receive_buffer_keeps_order() {
        let mut buf = ReceiveBuffer::default();
        buf.push(ReceivedMessage::placeholder(0));
        buf.push(ReceivedMessage::placeholder(1));
        let m = buf.find(1).unwrap();
        m.init(1, 3);
        assert!(m.add_frame(0, b"abc"));
        assert!(m.complete());

        // front (0) is incomplete, so nothing pops yet
        assert!(!buf.front().unwrap().complete());
        let m0 = buf.find(0).unwrap();
        m0.init(1, 2);
        assert!(m0.add_frame(0, b"xy"));
        assert!(buf.front().unwrap().complete());
        assert_eq!(buf.pop_front().unwrap().data(), b"xy");
        assert_eq!(buf.pop_front().unwrap().data(), b"abc");
        assert_eq!(buf.last_popped(), 1);
    }
}
