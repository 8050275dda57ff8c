//! Shard registry and rendezvous selection.
//!
//! The pool spawns one task per shard at startup and afterwards only
//! hands out mailbox senders. Selection is rendezvous hashing: every
//! shard index is scored against the key hash and the highest score
//! wins, which gives a uniform, deterministic assignment for a fixed
//! seed and shard count.

use crate::hash::SeededHasher;
use crate::storage::shard::{Shard, ShardMessage};
use tokio::sync::mpsc;

/// Commands a shard can queue before backpressure reaches connections.
const MAILBOX_DEPTH: usize = 64;

/// Pick the rendezvous winner among `count` shards for a key hash.
///
/// Ties go to the lower index.
pub fn rendezvous_index(hasher: &SeededHasher, count: usize, key_hash: u64) -> usize {
    let mut best = 0;
    let mut best_score = hasher.hash_pair(0, key_hash);
    for index in 1..count {
        let score = hasher.hash_pair(index as u64, key_hash);
        if score > best_score {
            best = index;
            best_score = score;
        }
    }
    best
}

/// The running shard set.
pub struct ShardPool {
    senders: Vec<mpsc::Sender<ShardMessage>>,
    hasher: SeededHasher,
}

impl ShardPool {
    /// Spawn `count` shard tasks and collect their mailboxes.
    pub fn spawn(count: usize, hasher: &SeededHasher) -> Self {
        let mut senders = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
            tokio::spawn(Shard::new(id).run(rx));
            senders.push(tx);
        }
        Self {
            senders,
            hasher: hasher.clone(),
        }
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// True when the pool has no shards (never, for a validated config).
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// The mailbox of the shard owning a key hash.
    pub fn select(&self, key_hash: u64) -> &mpsc::Sender<ShardMessage> {
        &self.senders[rendezvous_index(&self.hasher, self.senders.len(), key_hash)]
    }

    /// Every shard mailbox, in shard-index order.
    pub fn senders(&self) -> &[mpsc::Sender<ShardMessage>] {
        &self.senders
    }
}
