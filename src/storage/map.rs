//! Robin Hood open-addressing hash map.
//!
//! Keys carry their hash, computed once per pipeline argument by the
//! connection; the map never hashes. Capacity is a power of two and the
//! probe sequence is linear. On insertion an entry displaces any occupant
//! with a smaller probe distance, which keeps lookups short; on removal
//! the following cluster is shifted back one slot.

use crate::storage::alloc::Value;
use bytes::Bytes;

/// Initial slot count; doubles on resize.
const INITIAL_CAPACITY: usize = 64;

/// Resize when `size >= capacity * 9 / 10`.
const LOAD_NUM: usize = 9;
const LOAD_DEN: usize = 10;

/// A key name plus its precomputed hash.
///
/// Equality is by name only; two keys with the same name always carry
/// the same hash because the seed is process-wide.
#[derive(Debug, Clone)]
pub struct Key {
    /// The key bytes as received on the wire.
    pub name: Bytes,
    /// Hash of `name` under the process seed.
    pub hash: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    key: Key,
    value: Value,
    distance: u32,
}

/// Hash map from key name to [`Value`], one per shard.
#[derive(Debug)]
pub struct Map {
    slots: Vec<Option<Entry>>,
    size: usize,
    resize_at: usize,
}

impl Map {
    /// An empty map with the initial capacity.
    pub fn new() -> Self {
        Self {
            slots: vec![None; INITIAL_CAPACITY],
            size: 0,
            resize_at: INITIAL_CAPACITY * LOAD_NUM / LOAD_DEN,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Look up a key's value.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        let idx = self.index_of(key)?;
        self.slots[idx].as_ref().map(|entry| &entry.value)
    }

    /// Insert or replace. Returns the previous value when the key was
    /// already present.
    pub fn set(&mut self, key: Key, value: Value) -> Option<Value> {
        if self.size >= self.resize_at {
            self.grow();
        }
        self.insert(Entry {
            key,
            value,
            distance: 0,
        })
    }

    /// Remove a key, returning its value when present.
    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let idx = self.index_of(key)?;
        let entry = self.slots[idx].take()?;
        self.size -= 1;

        // Backward shift: pull the following cluster one slot toward the
        // hole until a slot that is empty or already at its desired index.
        let mask = self.mask();
        let mut hole = idx;
        loop {
            let next = (hole + 1) & mask;
            match &self.slots[next] {
                Some(e) if e.distance > 0 => {
                    let mut moved = self.slots[next].take().expect("slot just matched");
                    moved.distance -= 1;
                    self.slots[hole] = Some(moved);
                    hole = next;
                }
                _ => break,
            }
        }

        Some(entry.value)
    }

    /// Key names in slot order. The order is unspecified to clients.
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|e| &e.key.name))
    }

    /// Mutable access to every live value, for compaction sweeps.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut().map(|e| &mut e.value))
    }

    fn index_of(&self, key: &Key) -> Option<usize> {
        let mask = self.mask();
        let mut idx = (key.hash as usize) & mask;
        let mut distance = 0u32;
        loop {
            let entry = self.slots[idx].as_ref()?;
            // Robin Hood invariant: anything stored closer to home than
            // our current probe distance proves the key is absent.
            if entry.distance < distance {
                return None;
            }
            if entry.key.hash == key.hash && entry.key.name == key.name {
                return Some(idx);
            }
            distance += 1;
            idx = (idx + 1) & mask;
        }
    }

    fn insert(&mut self, mut entry: Entry) -> Option<Value> {
        let mask = self.mask();
        let mut idx = (entry.key.hash as usize) & mask;
        loop {
            match &mut self.slots[idx] {
                None => {
                    self.slots[idx] = Some(entry);
                    self.size += 1;
                    return None;
                }
                Some(occupant) => {
                    if occupant.key.name == entry.key.name {
                        return Some(std::mem::replace(&mut occupant.value, entry.value));
                    }
                    if occupant.distance < entry.distance {
                        std::mem::swap(occupant, &mut entry);
                    }
                }
            }
            entry.distance += 1;
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; new_capacity]);
        self.size = 0;
        self.resize_at = new_capacity * LOAD_NUM / LOAD_DEN;
        for mut entry in old.into_iter().flatten() {
            entry.distance = 0;
            self.insert(entry);
        }
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}
