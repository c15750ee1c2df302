//! The log arena: region 0, holding replicated memtable records.
//!
//! Allocation is a bump cursor over one preallocated buffer. A log file may
//! hold several slots (each replicate burst that outgrows its lease gets a
//! new one); recovery queries report the first slot per file, and the
//! scanner follows the self-describing frames from there.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use crate::registry::StocError;

#[derive(Debug, Clone, Copy)]
struct LogSlot {
    offset: u64,
    size: u64,
}

struct Inner {
    buf: Vec<u8>,
    cursor: u64,
    files: HashMap<String, Vec<LogSlot>>,
}

/// Bump-allocated in-memory log buffers, addressed as region 0.
pub struct LogArena {
    inner: Mutex<Inner>,
    capacity: u64,
}

impl LogArena {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity as usize],
                cursor: 0,
                files: HashMap::new(),
            }),
            capacity,
        }
    }

    /// Reserves `size` bytes for `log_file`. Returns `(offset, size)`, or
    /// `None` when the arena is full (the response then carries size 0,
    /// which the compute side treats as retryable).
    pub fn allocate(&self, log_file: &str, size: u64) -> Option<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.cursor + size > self.capacity {
            return None;
        }
        let offset = inner.cursor;
        inner.cursor += size;
        inner
            .files
            .entry(log_file.to_string())
            .or_default()
            .push(LogSlot { offset, size });
        debug!("log arena: {log_file} += [{offset}, {})", offset + size);
        Some((offset, size))
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), StocError> {
        let mut inner = self.inner.lock().unwrap();
        let end = offset as usize + data.len();
        if end > inner.buf.len() {
            return Err(StocError::OutOfBounds(0));
        }
        inner.buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, StocError> {
        let inner = self.inner.lock().unwrap();
        let end = (offset + size) as usize;
        if end > inner.buf.len() {
            return Err(StocError::OutOfBounds(0));
        }
        Ok(inner.buf[offset as usize..end].to_vec())
    }

    /// Releases a closed log file's slots. The space itself is reclaimed
    /// when the arena turns over with its memtables.
    pub fn delete(&self, log_file: &str) -> bool {
        self.inner.lock().unwrap().files.remove(log_file).is_some()
    }

    /// `(log_file, first slot offset)` for every file whose name starts
    /// with `prefix` — the recovery map.
    pub fn query(&self, prefix: &str) -> Vec<(String, u64)> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<(String, u64)> = inner
            .files
            .iter()
            .filter(|(name, slots)| name.starts_with(prefix) && !slots.is_empty())
            .map(|(name, slots)| (name.clone(), slots[0].offset))
            .collect();
        out.sort();
        out
    }

    /// Every slot reserved for a log file, in allocation order. A file
    /// gains a slot per replicate burst that outgrew its lease.
    pub fn slots(&self, log_file: &str) -> Vec<(u64, u64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(log_file)
            .map(|slots| slots.iter().map(|s| (s.offset, s.size)).collect())
            .unwrap_or_default()
    }

    pub fn holds(&self, log_file: &str) -> bool {
        self.inner.lock().unwrap().files.contains_key(log_file)
    }

    pub fn bytes_used(&self) -> u64 {
        self.inner.lock().unwrap().cursor
    }
}
