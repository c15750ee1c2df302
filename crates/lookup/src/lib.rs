//! # Lookup — memtable location index
//!
//! A fixed-size table mapping key hashes to memtable ids, so a read can jump
//! straight to the memtable (or flushed table) holding the freshest version
//! of a key without scanning every level.
//!
//! The table never rehashes: a key occupies slot `hash % size`, and keys
//! that collide share the slot. Flush and compaction race to update a slot
//! and resolve the race with a single-slot compare-and-swap, which makes the
//! update linearisable per slot — exactly one of two concurrent `cas` calls
//! for the same slot wins, and the loser observes the winner's value.

use std::sync::atomic::{AtomicU32, Ordering};

/// Sentinel meaning "no memtable holds this key".
pub const NO_LOCATION: u32 = 0;

/// Fixed-size atomic hash-to-memtable-id index.
pub struct LookupIndex {
    slots: Vec<AtomicU32>,
}

impl LookupIndex {
    /// Creates an index with `size` slots, all empty.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "lookup index must have at least one slot");
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            slots.push(AtomicU32::new(NO_LOCATION));
        }
        Self { slots }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, hash: u64) -> &AtomicU32 {
        &self.slots[(hash % self.slots.len() as u64) as usize]
    }

    /// Returns the memtable id recorded for this hash, or [`NO_LOCATION`].
    pub fn lookup(&self, hash: u64) -> u32 {
        self.slot(hash).load(Ordering::Acquire)
    }

    /// Unconditionally records `memtable_id` for this hash.
    pub fn insert(&self, hash: u64, memtable_id: u32) {
        self.slot(hash).store(memtable_id, Ordering::Release);
    }

    /// Replaces `current` with `new` iff the slot still holds `current`.
    ///
    /// Returns `true` on success. On failure the slot already reflects a
    /// concurrent winner and is left untouched.
    pub fn cas(&self, hash: u64, current: u32, new: u32) -> bool {
        self.slot(hash)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Serializes the table: `[size: u32][slot: u32]*`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());
        for slot in &self.slots {
            buf.extend_from_slice(&slot.load(Ordering::Acquire).to_le_bytes());
        }
    }

    /// Restores a table written by [`encode`](LookupIndex::encode).
    /// Returns `None` if the buffer is malformed.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let size = u32::from_le_bytes(buf[0..4].try_into().ok()?) as usize;
        if size == 0 || buf.len() < 4 + size * 4 {
            return None;
        }
        let mut slots = Vec::with_capacity(size);
        for i in 0..size {
            let at = 4 + i * 4;
            let v = u32::from_le_bytes(buf[at..at + 4].try_into().ok()?);
            slots.push(AtomicU32::new(v));
        }
        Some(Self { slots })
    }
}

/// FNV-1a hash used for slot selection; the same basis everywhere so the
/// index, the memtable and the flush path agree on slots.
#[must_use]
pub fn key_hash(key: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001b3;
    let mut hash = FNV_OFFSET;
    for &byte in key {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests;
