//! Per-shard storage engine.
//!
//! Each shard owns one [`Map`] and one [`Allocator`]; neither is ever
//! shared across tasks. The map stores keys with precomputed hashes, and
//! values are either slices into the allocator's blocks or standalone
//! heap buffers for oversized payloads.

pub mod alloc;
pub mod map;
pub mod shard;

pub use alloc::{Allocator, SliceSource, Value, ValueSource, BLOCK_SIZE};
pub use map::{Key, Map};
pub use shard::{ClientStream, KeysReply, OpReply, Shard, ShardMessage};
