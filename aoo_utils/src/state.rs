//! Tiny atomic state helpers used by the stream engines.
//!
//! These follow the exchange-latch idiom: one side sets, the other side
//! takes (reads and clears) in a single atomic operation, so no update
//! is ever observed twice or lost.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// A boolean that is set on one thread and consumed on another.
#[derive(Debug, Default)]
pub struct Latch(AtomicBool);

impl Latch {
    #[inline(always)]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline(always)]
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Reads and clears the latch.
    #[inline(always)]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    #[inline(always)]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// An event counter that is accumulated on one thread and drained on
/// another.
#[derive(Debug, Default)]
pub struct Tally(AtomicI32);

impl Tally {
    #[inline(always)]
    pub const fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    #[inline(always)]
    pub fn add(&self, n: i32) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Reads and clears the counter.
    #[inline(always)]
    pub fn take(&self) -> i32 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_takes_once() {
        let l = Latch::new();
        assert!(!l.take());
        l.set();
        assert!(l.get());
        assert!(l.take());
        assert!(!l.take());
    }

    #[test]
    fn tally_drains() {
        let t = Tally::new();
        t.add(3);
        t.add(4);
        assert_eq!(t.take(), 7);
        assert_eq!(t.take(), 0);
    }
}
