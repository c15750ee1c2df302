//! Merge iterator over decoded entry runs.
//!
//! Produces entries in ascending key order. When the same key appears in
//! multiple runs, only the entry with the highest sequence number is
//! emitted (newest wins). This is the core primitive for remote compaction:
//! the StoC decodes each input file's data region into a run, merges, and
//! writes the result into the output files.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::format::TableEntry;

struct HeapEntry {
    entry: TableEntry,
    /// Index of the source run; the tiebreaker is arbitrary but
    /// deterministic.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse the key comparison so the
        // smallest key surfaces first.
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// K-way merge of sorted entry runs with newest-seq deduplication.
pub struct MergeIterator {
    runs: Vec<std::vec::IntoIter<TableEntry>>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergeIterator {
    /// Each run must be sorted by ascending key with unique keys.
    pub fn new(runs: Vec<Vec<TableEntry>>) -> Self {
        let mut iters = Vec::with_capacity(runs.len());
        let mut heap = BinaryHeap::new();
        for (source, run) in runs.into_iter().enumerate() {
            let mut iter = run.into_iter();
            if let Some(entry) = iter.next() {
                heap.push(HeapEntry { entry, source });
            }
            iters.push(iter);
        }
        Self { runs: iters, heap }
    }

    /// Next entry in ascending key order, duplicates resolved by highest
    /// sequence number.
    pub fn next_entry(&mut self) -> Option<TableEntry> {
        let top = self.heap.pop()?;
        if let Some(next) = self.runs[top.source].next() {
            self.heap.push(HeapEntry {
                entry: next,
                source: top.source,
            });
        }

        let mut best = top.entry;
        while let Some(peek) = self.heap.peek() {
            if peek.entry.key != best.key {
                break;
            }
            let dup = self.heap.pop().expect("peeked entry");
            if dup.entry.seq > best.seq {
                best = dup.entry;
            }
            if let Some(next) = self.runs[dup.source].next() {
                self.heap.push(HeapEntry {
                    entry: next,
                    source: dup.source,
                });
            }
        }
        Some(best)
    }

    /// Drains the merge into a vector.
    pub fn collect_all(mut self) -> Vec<TableEntry> {
        let mut out = Vec::new();
        while let Some(e) = self.next_entry() {
            out.push(e);
        }
        out
    }
}
