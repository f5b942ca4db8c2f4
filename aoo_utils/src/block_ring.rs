//! A block-structured SPSC sample ring.
//!
//! Audio and network threads exchange sample data in units of one codec
//! block. The ring is a plain [`rtrb`] ring of samples; the block
//! structure is enforced by always acquiring chunks of exactly one block
//! size. Producers never block, never allocate, and a full ring simply
//! refuses the block (the caller counts the drop).

use core::num;

pub type Sample = f32;

pub const SILENCE: Sample = 0.0;

/// Creates a connected block ring with room for `capacity_blocks` blocks
/// of `block_size` samples each.
pub fn block_ring(
    block_size: num::NonZeroUsize,
    capacity_blocks: usize,
) -> (BlockRingTx, BlockRingRx) {
    let (tx, rx) = rtrb::RingBuffer::new(block_size.get() * capacity_blocks);
    (
        BlockRingTx { tx, block_size },
        BlockRingRx { rx, block_size },
    )
}

/// Producer half of a block ring.
pub struct BlockRingTx {
    tx: rtrb::Producer<Sample>,
    block_size: num::NonZeroUsize,
}

impl BlockRingTx {
    #[inline(always)]
    pub const fn block_size(&self) -> num::NonZeroUsize {
        self.block_size
    }

    /// Total capacity in blocks.
    #[inline(always)]
    pub fn capacity_blocks(&self) -> usize {
        self.tx.buffer().capacity() / self.block_size
    }

    /// Number of whole blocks that can currently be written.
    #[inline(always)]
    pub fn blocks_writable(&self) -> usize {
        self.tx.slots() / self.block_size
    }

    #[inline(always)]
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_abandoned()
    }

    /// Writes one block from the given sample iterator; the block is
    /// padded with silence if the iterator runs short. Returns `false`
    /// (and consumes nothing) when no block-sized chunk is free.
    #[inline]
    pub fn write_block(&mut self, samples: impl IntoIterator<Item = Sample>) -> bool {
        let n = self.block_size.get();
        let Ok(chunk) = self.tx.write_chunk_uninit(n) else {
            return false;
        };
        let written = chunk.fill_from_iter(samples.into_iter().chain(core::iter::repeat(SILENCE)).take(n));
        debug_assert_eq!(written, n);
        true
    }

    /// Writes one block of silence. Returns `false` when the ring is
    /// full.
    #[inline]
    pub fn write_silence(&mut self) -> bool {
        self.write_block(core::iter::empty())
    }
}

/// Consumer half of a block ring.
pub struct BlockRingRx {
    rx: rtrb::Consumer<Sample>,
    block_size: num::NonZeroUsize,
}

impl BlockRingRx {
    #[inline(always)]
    pub const fn block_size(&self) -> num::NonZeroUsize {
        self.block_size
    }

    #[inline(always)]
    pub fn capacity_blocks(&self) -> usize {
        self.rx.buffer().capacity() / self.block_size
    }

    /// Number of whole blocks ready to be read.
    #[inline(always)]
    pub fn blocks_readable(&self) -> usize {
        self.rx.slots() / self.block_size
    }

    #[inline(always)]
    pub fn is_abandoned(&self) -> bool {
        self.rx.is_abandoned()
    }

    /// Reads one block, handing the (possibly split) sample slices to
    /// `consume`. Returns `false` when no complete block is available.
    #[inline]
    pub fn read_block(&mut self, consume: impl FnOnce(&[Sample], &[Sample])) -> bool {
        let n = self.block_size.get();
        let Ok(chunk) = self.rx.read_chunk(n) else {
            return false;
        };
        let (first, second) = chunk.as_slices();
        consume(first, second);
        chunk.commit_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(block: usize, cap: usize) -> (BlockRingTx, BlockRingRx) {
        block_ring(num::NonZeroUsize::new(block).unwrap(), cap)
    }

    #[test]
    fn whole_blocks_only() {
        let (mut tx, mut rx) = ring(4, 2);
        assert_eq!(tx.blocks_writable(), 2);
        assert!(tx.write_block([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(rx.blocks_readable(), 1);

        let mut got = Vec::new();
        assert!(rx.read_block(|a, b| {
            got.extend_from_slice(a);
            got.extend_from_slice(b);
        }));
        assert_eq!(got, [1.0, 2.0, 3.0, 4.0]);
        assert!(!rx.read_block(|_, _| unreachable!()));
    }

    #[test]
    fn short_iterators_are_padded() {
        let (mut tx, mut rx) = ring(4, 1);
        assert!(tx.write_block([7.0]));
        let mut got = Vec::new();
        rx.read_block(|a, b| {
            got.extend_from_slice(a);
            got.extend_from_slice(b);
        });
        assert_eq!(got, [7.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn full_ring_refuses() {
        let (mut tx, _rx) = ring(2, 1);
        assert!(tx.write_silence());
        assert!(!tx.write_silence());
        assert_eq!(tx.blocks_writable(), 0);
    }
}
