//! Block-based bump allocator with overflow and defragmentation.
//!
//! Small payloads are read straight off the wire into the tail of the
//! current block; payloads larger than a block get their own buffer.
//! Overwrites and deletes only bump `reusable` counters; the bytes stay
//! in place until a compaction pass copies the survivors out of heavily
//! fragmented blocks and resets them.

use crate::storage::map::Map;
use bytes::Bytes;
use std::io;

/// Fixed capacity of every block.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Fraction of a block's capacity that must be reusable before the block
/// (or the allocator as a whole) is considered fragmented.
pub const FRAGMENTATION_THRESHOLD: f64 = 0.2;

/// Marks a block as drain-only until compaction resets it.
const FRAGMENTED: i64 = -1;

fn reusable_limit() -> i64 {
    (BLOCK_SIZE as f64 * FRAGMENTATION_THRESHOLD) as i64
}

/// Source of exactly-sized payload bytes for [`Allocator::allocate`].
///
/// `read_into` must fill the whole buffer or fail; the network stream
/// implements it by draining its read buffer and then reading the socket
/// directly into the destination.
pub trait ValueSource {
    /// Fill `buf` completely from the source.
    fn read_into(&mut self, buf: &mut [u8]) -> impl std::future::Future<Output = io::Result<()>>;
}

/// A byte slice as a [`ValueSource`]; used by the compaction sweep.
pub struct SliceSource<'a> {
    data: &'a [u8],
}

impl<'a> SliceSource<'a> {
    /// Wrap a slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl ValueSource for SliceSource<'_> {
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.data.len() < buf.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let (head, rest) = self.data.split_at(buf.len());
        buf.copy_from_slice(head);
        self.data = rest;
        Ok(())
    }
}

/// A stored value: either a slice into an allocator block or an owned
/// buffer for payloads larger than [`BLOCK_SIZE`].
#[derive(Debug, Clone)]
pub enum Value {
    /// Byte range `[start, end)` inside block `block`.
    Small {
        /// Index of the owning block.
        block: usize,
        /// First byte of the payload.
        start: usize,
        /// One past the last byte.
        end: usize,
    },
    /// Standalone buffer sized exactly to the payload.
    Large(Bytes),
}

impl Value {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Value::Small { start, end, .. } => end - start,
            Value::Large(bytes) => bytes.len(),
        }
    }

    /// True for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Block {
    data: Box<[u8]>,
    used: usize,
    /// Bytes released by overwritten or removed values; `-1` while the
    /// block is fragmented and draining.
    reusable: i64,
}

impl Block {
    fn new() -> Self {
        Self {
            data: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            used: 0,
            reusable: 0,
        }
    }

    fn remaining(&self) -> usize {
        BLOCK_SIZE - self.used
    }

    fn is_fragmented(&self) -> bool {
        self.reusable == FRAGMENTED
    }

    fn reset(&mut self) {
        self.data.fill(0);
        self.used = 0;
        self.reusable = 0;
    }
}

/// Bump allocator over an ordered list of fixed-size blocks.
///
/// `blocks[current]` is the active block for new small allocations;
/// every block before it is full or fragmented.
#[derive(Debug)]
pub struct Allocator {
    blocks: Vec<Block>,
    current: usize,
    reusable: i64,
}

impl Allocator {
    /// An allocator with one empty block.
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::new()],
            current: 0,
            reusable: 0,
        }
    }

    /// Read `size` payload bytes from `source` into storage.
    ///
    /// Payloads larger than [`BLOCK_SIZE`] become [`Value::Large`]; the
    /// rest are placed at the tail of the first block that can take them,
    /// appending a fresh block when none can. Blocks skipped because their
    /// tail is too short have that tail counted as reusable. I/O errors
    /// propagate unchanged; bytes already read stay in the block as
    /// unreferenced tail waste since no value was created.
    pub async fn allocate<S: ValueSource>(
        &mut self,
        source: &mut S,
        size: usize,
    ) -> io::Result<Value> {
        if size > BLOCK_SIZE {
            let mut buf = vec![0u8; size];
            source.read_into(&mut buf).await?;
            return Ok(Value::Large(buf.into()));
        }

        let mut idx = self.current;
        while idx < self.blocks.len() {
            let block = &mut self.blocks[idx];
            if block.is_fragmented() || block.remaining() == 0 {
                idx += 1;
                continue;
            }
            if block.remaining() < size {
                let tail = block.remaining() as i64;
                block.reusable += tail;
                block.used = BLOCK_SIZE;
                self.reusable += tail;
                idx += 1;
                continue;
            }
            let start = block.used;
            source.read_into(&mut block.data[start..start + size]).await?;
            block.used = start + size;
            self.current = idx;
            return Ok(Value::Small {
                block: idx,
                start,
                end: start + size,
            });
        }

        self.blocks.push(Block::new());
        let idx = self.blocks.len() - 1;
        self.current = idx;
        let block = &mut self.blocks[idx];
        source.read_into(&mut block.data[..size]).await?;
        block.used = size;
        Ok(Value::Small {
            block: idx,
            start: 0,
            end: size,
        })
    }

    /// Release a value that left the map.
    ///
    /// Small values surrender their byte range to the reusable counters;
    /// the bytes themselves stay until defragmentation. Large buffers are
    /// simply dropped.
    pub fn release(&mut self, value: Value) {
        if let Value::Small { block, start, end } = value {
            let len = (end - start) as i64;
            let block = &mut self.blocks[block];
            debug_assert!(!block.is_fragmented(), "released value in draining block");
            block.reusable += len;
            self.reusable += len;
        }
    }

    /// The payload bytes of a value stored here.
    pub fn bytes<'a>(&'a self, value: &'a Value) -> &'a [u8] {
        match value {
            Value::Small { block, start, end } => &self.blocks[*block].data[*start..*end],
            Value::Large(bytes) => bytes,
        }
    }

    /// True once enough bytes are reusable to make compaction worthwhile.
    ///
    /// The comparison is against an absolute fraction of one block's
    /// capacity, not of the total heap, which keeps amortized compaction
    /// cost linear.
    pub fn should_defragment(&self) -> bool {
        self.reusable >= reusable_limit()
    }

    /// Compact live values out of fragmented blocks.
    ///
    /// Marks every block past the per-block threshold as drain-only,
    /// rewrites each live small value held in one of them into a healthy
    /// block, then resets the drained blocks and the counters.
    pub async fn defragment(&mut self, map: &mut Map) -> io::Result<()> {
        for block in &mut self.blocks {
            if block.reusable >= reusable_limit() {
                block.reusable = FRAGMENTED;
            }
        }
        self.current = 0;

        for value in map.values_mut() {
            let Value::Small { block, start, end } = value else {
                continue;
            };
            let (block, start, end) = (*block, *start, *end);
            if !self.blocks[block].is_fragmented() {
                continue;
            }
            let payload = self.blocks[block].data[start..end].to_vec();
            let mut source = SliceSource::new(&payload);
            *value = self.allocate(&mut source, payload.len()).await?;
        }

        for block in &mut self.blocks {
            if block.is_fragmented() {
                block.reset();
            }
        }
        self.current = 0;
        self.reusable = 0;
        Ok(())
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashSeed, SeededHasher};
    use crate::storage::map::Key;

    fn payload(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    async fn alloc_bytes(alloc: &mut Allocator, data: &[u8]) -> Value {
        let mut source = SliceSource::new(data);
        alloc.allocate(&mut source, data.len()).await.unwrap()
    }

    /// sum(live) + reusable == used, per non-fragmented block.
    fn check_conservation(alloc: &Allocator, live: &[Value]) {
        let mut live_per_block = vec![0i64; alloc.blocks.len()];
        for value in live {
            if let Value::Small { block, start, end } = value {
                live_per_block[*block] += (end - start) as i64;
            }
        }
        let mut total_reusable = 0;
        for (i, block) in alloc.blocks.iter().enumerate() {
            assert!(!block.is_fragmented(), "no block is draining at rest");
            assert_eq!(
                live_per_block[i] + block.reusable,
                block.used as i64,
                "block {i} accounting"
            );
            total_reusable += block.reusable;
        }
        assert_eq!(alloc.reusable, total_reusable);
    }

    #[tokio::test]
    async fn small_values_pack_into_the_current_block() {
        let mut alloc = Allocator::new();
        let a = alloc_bytes(&mut alloc, b"hello").await;
        let b = alloc_bytes(&mut alloc, b"world!").await;

        assert_eq!(alloc.bytes(&a), b"hello");
        assert_eq!(alloc.bytes(&b), b"world!");
        assert!(matches!(&a, Value::Small { block: 0, start: 0, end: 5 }));
        assert!(matches!(&b, Value::Small { block: 0, start: 5, end: 11 }));
        assert_eq!(alloc.blocks.len(), 1);
        check_conservation(&alloc, &[a, b]);
    }

    #[tokio::test]
    async fn oversized_payloads_become_large() {
        let mut alloc = Allocator::new();
        let data = payload(BLOCK_SIZE + 1, 0xab);
        let value = alloc_bytes(&mut alloc, &data).await;

        assert!(matches!(&value, Value::Large(_)));
        assert_eq!(alloc.bytes(&value), &data[..]);
        assert_eq!(alloc.blocks[0].used, 0, "blocks untouched by large values");
    }

    #[tokio::test]
    async fn short_tail_is_marked_reusable_and_skipped() {
        let mut alloc = Allocator::new();
        let a = alloc_bytes(&mut alloc, &payload(3 * 1024 * 1024, 1)).await;
        let b = alloc_bytes(&mut alloc, &payload(2 * 1024 * 1024, 2)).await;

        assert!(matches!(&b, Value::Small { block: 1, .. }));
        assert_eq!(alloc.blocks[0].used, BLOCK_SIZE);
        assert_eq!(alloc.blocks[0].reusable, 1024 * 1024);
        assert_eq!(alloc.reusable, 1024 * 1024);
        assert_eq!(alloc.current, 1);
        check_conservation(&alloc, &[a, b]);
    }

    #[tokio::test]
    async fn release_accumulates_reusable_bytes() {
        let mut alloc = Allocator::new();
        let a = alloc_bytes(&mut alloc, b"abcdef").await;
        let b = alloc_bytes(&mut alloc, b"ghij").await;

        alloc.release(a);
        assert_eq!(alloc.blocks[0].reusable, 6);
        assert_eq!(alloc.reusable, 6);

        alloc.release(Value::Large(Bytes::from_static(b"unrelated")));
        assert_eq!(alloc.reusable, 6, "large values do not touch counters");
        check_conservation(&alloc, &[b]);
    }

    #[tokio::test]
    async fn defragment_threshold_is_a_fifth_of_a_block() {
        let mut alloc = Allocator::new();
        let limit = reusable_limit() as usize;

        let a = alloc_bytes(&mut alloc, &payload(limit - 1, 0)).await;
        let b = alloc_bytes(&mut alloc, &payload(1, 0)).await;
        alloc.release(a);
        assert!(!alloc.should_defragment());
        alloc.release(b);
        assert!(alloc.should_defragment());
    }

    #[tokio::test]
    async fn failed_reads_do_not_advance_the_block() {
        struct FailingSource;
        impl ValueSource for FailingSource {
            async fn read_into(&mut self, _buf: &mut [u8]) -> io::Result<()> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
        }

        let mut alloc = Allocator::new();
        let a = alloc_bytes(&mut alloc, b"before").await;

        let err = alloc.allocate(&mut FailingSource, 100).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(alloc.blocks[0].used, 6, "cursor did not advance");

        let b = alloc_bytes(&mut alloc, b"after").await;
        assert_eq!(alloc.bytes(&b), b"after");
        check_conservation(&alloc, &[a, b]);
    }

    #[tokio::test]
    async fn defragment_round_trip_preserves_live_values() {
        let hasher = SeededHasher::from_seed(HashSeed::new(3, 5));
        let mut alloc = Allocator::new();
        let mut map = Map::new();

        // Two blocks' worth of 512 KiB values.
        let chunk = 512 * 1024;
        for i in 0..14u8 {
            let name = Bytes::from(format!("key:{i}"));
            let key = Key {
                hash: hasher.hash(&name),
                name,
            };
            let value = alloc_bytes(&mut alloc, &payload(chunk, i)).await;
            map.set(key, value);
        }
        assert!(alloc.blocks.len() >= 2);

        // Drop every even key; both blocks cross the per-block threshold.
        for i in (0..14u8).step_by(2) {
            let name = Bytes::from(format!("key:{i}"));
            let key = Key {
                hash: hasher.hash(&name),
                name,
            };
            let value = map.remove(&key).unwrap();
            alloc.release(value);
        }
        assert!(alloc.should_defragment());

        alloc.defragment(&mut map).await.unwrap();

        assert_eq!(alloc.reusable, 0);
        for block in &alloc.blocks {
            assert!(!block.is_fragmented());
        }
        for i in (1..14u8).step_by(2) {
            let name = Bytes::from(format!("key:{i}"));
            let key = Key {
                hash: hasher.hash(&name),
                name,
            };
            let value = map.get(&key).expect("odd keys survive");
            assert_eq!(alloc.bytes(value), &payload(chunk, i)[..], "key:{i}");
        }
    }

    #[tokio::test]
    async fn drained_blocks_accept_new_allocations() {
        let mut alloc = Allocator::new();
        let mut map = Map::new();

        let value = alloc_bytes(&mut alloc, &payload(1024 * 1024, 7)).await;
        alloc.release(value);
        alloc.defragment(&mut map).await.unwrap();

        let fresh = alloc_bytes(&mut alloc, b"fresh").await;
        assert!(matches!(&fresh, Value::Small { block: 0, start: 0, end: 5 }));
        assert_eq!(alloc.bytes(&fresh), b"fresh");
    }
}
