//! Runtime plumbing shared by the stream engines: real-time safe
//! single-producer/single-consumer rings and small atomic helpers.
//!
//! Re-exports [`rtrb`] for convenience.

pub use rtrb;

mod block_ring;
pub use block_ring::*;

mod state;
pub use state::*;
