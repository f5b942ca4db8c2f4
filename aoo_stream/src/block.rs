//! Stream block reassembly primitives: the jitter queue, the ACK list
//! driving retransmit requests, and the sender-side history ring.

use aoo_wire::MAX_FRAME_COUNT;
use rustc_hash::FxHashMap;

/// Bit set tracking which frames of a block are still missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSet([u64; MAX_FRAME_COUNT / 64]);

impl FrameSet {
    /// Marks frames `0..n` as missing.
    #[inline]
    pub fn all_missing(n: usize) -> Self {
        debug_assert!(n <= MAX_FRAME_COUNT);
        let mut set = Self::default();
        for i in 0..n {
            set.0[i / 64] |= 1 << (i % 64);
        }
        set
    }

    #[inline(always)]
    pub fn clear(&mut self, frame: usize) {
        self.0[frame / 64] &= !(1 << (frame % 64));
    }

    #[inline(always)]
    pub fn is_missing(&self, frame: usize) -> bool {
        self.0[frame / 64] & (1 << (frame % 64)) != 0
    }

    #[inline(always)]
    pub fn none_missing(&self) -> bool {
        self.0.iter().all(|&word| word == 0)
    }
}

/// One encoded block in flight, possibly partially received.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub sequence: i32,
    pub samplerate: f64,
    pub channel: i32,
    buffer: Vec<u8>,
    frames: FrameSet,
    num_frames: i32,
    frame_size: i32,
}

impl Block {
    /// Re-initialises the slot for a block whose frames will arrive
    /// individually.
    pub fn init_receiving(
        &mut self,
        sequence: i32,
        samplerate: f64,
        channel: i32,
        total_size: usize,
        num_frames: i32,
    ) {
        debug_assert!(total_size > 0);
        self.sequence = sequence;
        self.samplerate = samplerate;
        self.channel = channel;
        self.num_frames = num_frames;
        self.frame_size = 0;
        self.frames = FrameSet::all_missing(num_frames as usize);
        self.buffer.clear();
        self.buffer.resize(total_size, 0);
    }

    /// Re-initialises the slot with complete data (sender side).
    pub fn init_complete(
        &mut self,
        sequence: i32,
        samplerate: f64,
        channel: i32,
        data: &[u8],
        num_frames: i32,
        frame_size: i32,
    ) {
        self.sequence = sequence;
        self.samplerate = samplerate;
        self.channel = channel;
        self.num_frames = num_frames;
        self.frame_size = frame_size;
        self.frames = FrameSet::default();
        self.buffer.clear();
        self.buffer.extend_from_slice(data);
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    pub fn num_frames(&self) -> i32 {
        self.num_frames
    }

    #[inline(always)]
    pub fn complete(&self) -> bool {
        self.frames.none_missing()
    }

    #[inline(always)]
    pub fn has_frame(&self, frame: i32) -> bool {
        !self.frames.is_missing(frame as usize)
    }

    /// Copies a received frame into place. Frames `0..n-2` share one
    /// size; the last frame carries the remainder. Returns `false` if
    /// the frame does not fit the declared block layout.
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
            let Some(slot) = self
                .buffer
                .get_mut(onset..onset + data.len())
                .filter(|_| !data.is_empty())
            else {
                return false;
            };
            slot.copy_from_slice(data);
            self.frame_size = data.len() as i32;
        }
        self.frames.clear(frame as usize);
        true
    }

    /// Returns the bytes of one frame of a complete block.
    pub fn frame(&self, frame: i32) -> &[u8] {
        debug_assert!(frame >= 0 && frame < self.num_frames);
        let frame_size = self.frame_size as usize;
        let onset = frame as usize * frame_size;
        if frame == self.num_frames - 1 {
            &self.buffer[onset..]
        } else {
            &self.buffer[onset..onset + frame_size]
        }
    }

    pub fn frame_size(&self, frame: i32) -> usize {
        self.frame(frame).len()
    }
}

//-------------------------- BlockQueue ------------------------------//

/// Bounded, sequence-ordered queue of blocks under reassembly.
///
/// Insertion keeps blocks sorted by sequence (they usually arrive in
/// order, so the common case appends). Slot storage is pre-allocated;
/// popped slots are recycled to keep the receive path allocation-light.
#[derive(Debug, Default)]
pub struct BlockQueue {
    blocks: Vec<Block>,
    len: usize,
}

impl BlockQueue {
    pub fn resize(&mut self, capacity: usize) {
        self.blocks.clear();
        self.blocks.resize(capacity.max(1), Block::default());
        self.len = 0;
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    #[inline(always)]
    pub fn front(&self) -> Option<&Block> {
        self.as_slice().first()
    }

    #[inline(always)]
    pub fn back(&self) -> Option<&Block> {
        self.as_slice().last()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[Block] {
        &self.blocks[..self.len]
    }

    /// Inserts a fresh receiving slot for `sequence`, keeping order.
    /// The queue must not be full and must not already hold the
    /// sequence.
    pub fn insert(
        &mut self,
        sequence: i32,
        samplerate: f64,
        channel: i32,
        total_size: usize,
        num_frames: i32,
    ) -> &mut Block {
        debug_assert!(!self.is_full());
        debug_assert!(self.find(sequence).is_none());

        // most blocks arrive in sequential order, so try the end first
        let pos = if self.len == 0 || sequence > self.blocks[self.len - 1].sequence {
            self.len
        } else {
            self.blocks[..self.len]
                .partition_point(|b| b.sequence < sequence)
        };

        // rotate the free slot past the end into position
        self.blocks[pos..=self.len].rotate_right(1);
        self.len += 1;

        let slot = &mut self.blocks[pos];
        slot.init_receiving(sequence, samplerate, channel, total_size, num_frames);
        slot
    }

    pub fn find(&mut self, sequence: i32) -> Option<&mut Block> {
        if self.len == 0 {
            return None;
        }
        // completing the most recent block is the common case
        if self.blocks[self.len - 1].sequence == sequence {
            return Some(&mut self.blocks[self.len - 1]);
        }
        let pos = self.blocks[..self.len].partition_point(|b| b.sequence < sequence);
        if pos < self.len && self.blocks[pos].sequence == sequence {
            Some(&mut self.blocks[pos])
        } else {
            None
        }
    }

    pub fn pop_front(&mut self) -> Option<&Block> {
        if self.len == 0 {
            return None;
        }
        self.blocks[..self.len].rotate_left(1);
        self.len -= 1;
        // the popped block now sits in the first free slot
        Some(&self.blocks[self.len])
    }
}

//-------------------------- AckList ---------------------------------//

/// Retransmit bookkeeping for one awaited block.
#[derive(Debug, Clone, Copy)]
pub struct BlockAck {
    remaining: i32,
    interval: f64,
    timestamp: f64,
}

impl BlockAck {
    fn new(limit: i32, interval: f64) -> Self {
        Self {
            remaining: limit,
            interval,
            timestamp: f64::NEG_INFINITY,
        }
    }

    /// Returns `true` if a request should go out now. Each attempt
    /// decrements the budget and doubles the per-block interval up to
    /// [`crate::MAX_RESEND_INTERVAL`].
    pub fn update(&mut self, now: f64) -> bool {
        if self.remaining <= 0 {
            return false;
        }
        if now - self.timestamp >= self.interval {
            self.timestamp = now;
            self.remaining -= 1;
            self.interval = (self.interval * 2.0).min(crate::MAX_RESEND_INTERVAL);
            true
        } else {
            false
        }
    }

    #[inline(always)]
    pub fn remaining(&self) -> i32 {
        self.remaining
    }
}

/// The set of sequences currently awaited for retransmission.
#[derive(Debug, Default)]
pub struct AckList {
    entries: FxHashMap<i32, BlockAck>,
    limit: i32,
    interval: f64,
}

impl AckList {
    pub fn configure(&mut self, limit: i32, interval: f64) {
        self.limit = limit;
        self.interval = interval;
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, sequence: i32) -> bool {
        self.entries.contains_key(&sequence)
    }

    /// Looks up or creates the entry for `sequence`.
    pub fn get(&mut self, sequence: i32) -> &mut BlockAck {
        self.entries
            .entry(sequence)
            .or_insert_with(|| BlockAck::new(self.limit, self.interval))
    }

    pub fn find(&mut self, sequence: i32) -> Option<&mut BlockAck> {
        self.entries.get_mut(&sequence)
    }

    pub fn remove(&mut self, sequence: i32) -> bool {
        self.entries.remove(&sequence).is_some()
    }

    /// Garbage-collects entries older than `sequence`; returns the
    /// number removed.
    pub fn remove_before(&mut self, sequence: i32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|&seq, _| seq >= sequence);
        before - self.entries.len()
    }
}

//------------------------ HistoryBuffer -----------------------------//

/// Ring of the most recently sent blocks, keyed by sequence, consulted
/// by retransmit requests.
///
/// Blocks are pushed in chronological order, so the ranges `[head..]`
/// and `[..head]` are each sorted and can be searched in logarithmic
/// time.
#[derive(Debug, Default)]
pub struct HistoryBuffer {
    buffer: Vec<Block>,
    oldest: i32,
    head: usize,
}

impl HistoryBuffer {
    pub fn resize(&mut self, capacity: usize) {
        self.buffer.clear();
        self.buffer.resize(capacity, Block::default());
        self.clear();
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.oldest = -1;
        for block in &mut self.buffer {
            block.sequence = -1;
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(
        &mut self,
        sequence: i32,
        samplerate: f64,
        data: &[u8],
        num_frames: i32,
        frame_size: i32,
    ) {
        if self.buffer.is_empty() {
            return;
        }
        debug_assert!(!data.is_empty());
        if self.buffer[self.head].sequence >= 0 {
            // about to overwrite the oldest block
            self.oldest = self.buffer[self.head].sequence;
        }
        self.buffer[self.head].init_complete(sequence, samplerate, 0, data, num_frames, frame_size);
        self.head += 1;
        if self.head >= self.buffer.len() {
            self.head = 0;
        }
    }

    pub fn find(&self, sequence: i32) -> Option<&Block> {
        if sequence < self.oldest {
            log::debug!("history: block {sequence} too old");
            return None;
        }
        let search = |range: &[Block]| -> Option<usize> {
            let pos = range.partition_point(|b| b.sequence < sequence);
            (pos < range.len() && range[pos].sequence == sequence).then_some(pos)
        };
        let (front, back) = self.buffer.split_at(self.head);
        if let Some(pos) = search(back) {
            return Some(&back[pos]);
        }
        search(front).map(|pos| &front[pos])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_set_tracks_missing() {
        let mut set = FrameSet::all_missing(70);
        assert!(set.is_missing(0));
        assert!(set.is_missing(69));
        assert!(!set.is_missing(70));
        for i in 0..70 {
            set.clear(i);
        }
        assert!(set.none_missing());
    }

    #[test]
    fn block_reassembles_out_of_order() {
        let mut block = Block::default();
        // 10 bytes in 3 frames: 4 + 4 + 2
        block.init_receiving(5, 44100.0, 0, 10, 3);
        assert!(!block.complete());
        assert!(block.add_frame(2, &[8, 9]));
        assert!(block.add_frame(0, &[0, 1, 2, 3]));
        assert!(!block.complete());
        assert!(block.add_frame(1, &[4, 5, 6, 7]));
        assert!(!block.add_frame(3, &[0]));
        assert!(block.complete());
        assert_eq!(block.data(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(block.frame(1), &[4, 5, 6, 7]);
        assert_eq!(block.frame(2), &[8, 9]);
    }

    #[test]
    fn queue_keeps_order_and_recycles() {
        let mut q = BlockQueue::default();
        q.resize(4);
        q.insert(2, 0.0, 0, 4, 1);
        q.insert(0, 0.0, 0, 4, 1);
        q.insert(3, 0.0, 0, 4, 1);
        q.insert(1, 0.0, 0, 4, 1);
        let seqs: Vec<_> = q.as_slice().iter().map(|b| b.sequence).collect();
        assert_eq!(seqs, [0, 1, 2, 3]);
        assert!(q.is_full());

        assert_eq!(q.pop_front().unwrap().sequence, 0);
        assert_eq!(q.len(), 3);
        assert!(q.find(2).is_some());
        assert!(q.find(0).is_none());
    }

    #[test]
    fn ack_backoff_and_budget() {
        let mut list = AckList::default();
        list.configure(3, 0.01);
        let ack = list.get(7);
        assert!(ack.update(0.0));
        // interval doubled to 0.02
        assert!(!ack.update(0.015));
        assert!(ack.update(0.025));
        assert!(ack.update(1.0));
        assert_eq!(ack.remaining(), 0);
        assert!(!ack.update(10.0));

        list.get(3);
        list.get(9);
        assert_eq!(list.remove_before(7), 1);
        assert!(list.contains(7) && list.contains(9));
    }

    #[test]
    fn history_finds_recent_blocks_only() {
        let mut h = HistoryBuffer::default();
        h.resize(4);
        for seq in 0..6 {
            h.push(seq, 48e3, &[seq as u8; 8], 2, 4);
        }
        // 0 and 1 have been overwritten
        assert!(h.find(0).is_none());
        assert!(h.find(1).is_none());
        for seq in 2..6 {
            let block = h.find(seq).unwrap();
            assert_eq!(block.sequence, seq);
            assert_eq!(block.data(), &[seq as u8; 8]);
        }
        assert!(h.find(6).is_none());
    }
}
