//! # Mempool — size-classed buffer arena
//!
//! Stands in for the registered-memory manager of the RDMA fabric: workers
//! borrow fixed-size slabs for chunk staging, log batches and read scratch,
//! and return them to the pool when dropped.
//!
//! Buffers come in power-of-two size classes. `alloc` pops a recycled slab
//! from the smallest class that fits, or allocates a fresh one when the
//! class's free list is empty. Requests larger than the biggest class are
//! served straight from the heap and freed on drop (the backstop), so an
//! oversized request never fails — it just skips recycling.
//!
//! ## Example
//! ```rust
//! use mempool::MemPool;
//!
//! let pool = MemPool::with_default_classes();
//! let mut buf = pool.alloc(1000);
//! buf[0] = 7;
//! assert_eq!(buf.len(), 1000);
//! drop(buf); // slab returns to the 1 KiB class
//! ```

use std::sync::{Arc, Mutex};

/// Default size classes: 1 KiB through 16 MiB.
const DEFAULT_MIN_CLASS: usize = 1 << 10;
const DEFAULT_MAX_CLASS: usize = 1 << 24;

/// Per-class recycling stats, surfaced through [`MemPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Slab size for this class.
    pub slab_size: usize,
    /// Total slabs handed out over the pool's lifetime.
    pub allocated: u64,
    /// Hand-outs served from the free list instead of a fresh allocation.
    pub recycled: u64,
}

struct SizeClass {
    slab_size: usize,
    free: Vec<Box<[u8]>>,
    allocated: u64,
    recycled: u64,
}

struct Shared {
    classes: Mutex<Vec<SizeClass>>,
}

/// A slab pool with power-of-two size classes and a heap backstop.
#[derive(Clone)]
pub struct MemPool {
    shared: Arc<Shared>,
}

impl MemPool {
    /// Builds a pool whose classes double from `min_class` to `max_class`
    /// inclusive. Both bounds are rounded up to powers of two.
    pub fn new(min_class: usize, max_class: usize) -> Self {
        let min = min_class.max(8).next_power_of_two();
        let max = max_class.max(min).next_power_of_two();
        let mut classes = Vec::new();
        let mut size = min;
        while size <= max {
            classes.push(SizeClass {
                slab_size: size,
                free: Vec::new(),
                allocated: 0,
                recycled: 0,
            });
            size <<= 1;
        }
        Self {
            shared: Arc::new(Shared {
                classes: Mutex::new(classes),
            }),
        }
    }

    /// Builds a pool with the default 1 KiB .. 16 MiB classes.
    pub fn with_default_classes() -> Self {
        Self::new(DEFAULT_MIN_CLASS, DEFAULT_MAX_CLASS)
    }

    /// Borrows a buffer of at least `len` bytes, zero-filled up to `len`.
    pub fn alloc(&self, len: usize) -> PoolBuf {
        let mut classes = self.shared.classes.lock().unwrap();
        let idx = classes.iter().position(|c| c.slab_size >= len);
        match idx {
            Some(i) => {
                let class = &mut classes[i];
                class.allocated += 1;
                let slab = match class.free.pop() {
                    Some(mut s) => {
                        class.recycled += 1;
                        s[..len].fill(0);
                        s
                    }
                    None => vec![0u8; class.slab_size].into_boxed_slice(),
                };
                debug_assert!(slab.len() >= len);
                PoolBuf {
                    slab: Some(slab),
                    len,
                    class: Some(i),
                    pool: Arc::clone(&self.shared),
                }
            }
            None => PoolBuf {
                slab: Some(vec![0u8; len].into_boxed_slice()),
                len,
                class: None,
                pool: Arc::clone(&self.shared),
            },
        }
    }

    /// Snapshot of per-class counters.
    pub fn stats(&self) -> Vec<ClassStats> {
        let classes = self.shared.classes.lock().unwrap();
        classes
            .iter()
            .map(|c| ClassStats {
                slab_size: c.slab_size,
                allocated: c.allocated,
                recycled: c.recycled,
            })
            .collect()
    }

    /// Number of slabs currently sitting in free lists.
    pub fn free_slabs(&self) -> usize {
        let classes = self.shared.classes.lock().unwrap();
        classes.iter().map(|c| c.free.len()).sum()
    }
}

/// A borrowed slab. Derefs to `[u8]` of the requested length; the backing
/// slab keeps its class capacity and returns to the pool on drop.
pub struct PoolBuf {
    slab: Option<Box<[u8]>>,
    len: usize,
    /// Index of the owning size class; `None` for backstop allocations.
    class: Option<usize>,
    pool: Arc<Shared>,
}

impl PoolBuf {
    /// Requested length (may be smaller than the slab capacity).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity of the underlying slab.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slab.as_ref().map_or(0, |s| s.len())
    }
}

impl std::ops::Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.slab.as_ref().expect("slab present until drop")[..self.len]
    }
}

impl std::ops::DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.slab.as_mut().expect("slab present until drop")[..len]
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let (Some(slab), Some(class)) = (self.slab.take(), self.class) {
            let mut classes = self.pool.classes.lock().unwrap();
            if let Some(c) = classes.get_mut(class) {
                c.free.push(slab);
            }
        }
        // Backstop allocations fall out of scope here.
    }
}

impl std::fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("pooled", &self.class.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests;
