//! Remote random-access reader over a file's handle list.
//!
//! Two modes, chosen at construction:
//!
//! - **On-demand**: each `read` issues a one-sided fetch against one handle,
//!   memoised in a small block cache keyed by a compact hash of the remote
//!   location, which amortises repeated reads of the same block during a
//!   scan.
//! - **Prefetch-all**: the whole file is pulled handle-by-handle into one
//!   pooled buffer at construction; a `logical offset → local segment` map
//!   turns subsequent reads into pointer math, and the handle argument is
//!   ignored.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{bail, ensure, Context, Result};
use log::debug;

use client::CcClient;
use mempool::{MemPool, PoolBuf};
use wire::{FileMetaData, RTableHandle};

use crate::format::{decode_entry, parse_meta, TableEntry, TableMeta};

/// One prefetched segment: where a run of logical bytes landed locally.
#[derive(Debug, Clone, Copy)]
struct LocalSegment {
    local_offset: usize,
    size: u64,
}

/// Random-access reader for one remote SSTable.
pub struct RemoteSstReader {
    meta: FileMetaData,
    prefetch_all: bool,
    backing: Option<PoolBuf>,
    /// logical offset → prefetched segment, filled in handle order.
    segments: BTreeMap<u64, LocalSegment>,
    /// Recently fetched block bytes, keyed by a compact hash of
    /// `(rtable_id, absolute offset, length)`.
    block_cache: Mutex<HashMap<u32, Vec<u8>>>,
    /// Lazily parsed meta block (filter + index).
    table_meta: Mutex<Option<TableMeta>>,
}

impl RemoteSstReader {
    /// Opens a reader. With `prefetch_all`, every handle is fetched into a
    /// single file-sized buffer before this returns.
    pub fn new(
        meta: FileMetaData,
        cc: &mut CcClient,
        pool: &MemPool,
        prefetch_all: bool,
    ) -> Result<Self> {
        let mut reader = Self {
            meta,
            prefetch_all,
            backing: None,
            segments: BTreeMap::new(),
            block_cache: Mutex::new(HashMap::new()),
            table_meta: Mutex::new(None),
        };
        if prefetch_all {
            reader.prefetch(cc, pool)?;
        }
        Ok(reader)
    }

    #[must_use]
    pub fn file_meta(&self) -> &FileMetaData {
        &self.meta
    }

    fn prefetch(&mut self, cc: &mut CcClient, pool: &MemPool) -> Result<()> {
        let total = self.meta.file_size as usize;
        let mut backing = pool.alloc(total);
        let mut logical = 0u64;
        let handles: Vec<RTableHandle> = self.meta.handles().copied().collect();
        for handle in handles {
            let req = cc.initiate_rtable_read_data_block(&handle, 0, handle.size)?;
            let resp = cc.wait(req)?;
            if resp.failed {
                bail!("prefetch of rtable {} failed", handle.rtable_id);
            }
            ensure!(
                resp.bytes.len() as u64 == handle.size,
                "short prefetch read: {} of {} bytes",
                resp.bytes.len(),
                handle.size
            );
            let at = logical as usize;
            backing[at..at + resp.bytes.len()].copy_from_slice(&resp.bytes);
            self.segments.insert(
                logical,
                LocalSegment {
                    local_offset: at,
                    size: handle.size,
                },
            );
            logical += handle.size;
        }
        ensure!(
            logical as usize == total,
            "prefetched {} bytes of a {} byte file",
            logical,
            total
        );
        debug!(
            "prefetched file {} ({} bytes, {} segments)",
            self.meta.number,
            total,
            self.segments.len()
        );
        self.backing = Some(backing);
        Ok(())
    }

    /// Reads `n` bytes. Prefetched readers treat `offset` as a logical
    /// offset into the whole file image and ignore `handle`; on-demand
    /// readers read `[offset, offset + n)` within the range behind
    /// `handle`.
    pub fn read(
        &self,
        cc: &mut CcClient,
        handle: &RTableHandle,
        offset: u64,
        n: u64,
    ) -> Result<Vec<u8>> {
        if self.prefetch_all {
            return self.read_prefetched(offset, n);
        }
        let absolute = handle.offset + offset;
        let key = cache_key(handle.rtable_id, absolute, n);
        if let Some(hit) = self.block_cache.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }
        let req = cc.initiate_rtable_read_data_block(handle, offset, n)?;
        let resp = cc.wait(req)?;
        if resp.failed {
            bail!(
                "read of rtable {} at {} failed (gone or transport)",
                handle.rtable_id,
                absolute
            );
        }
        ensure!(
            resp.bytes.len() as u64 == n,
            "short read: {} of {} bytes",
            resp.bytes.len(),
            n
        );
        self.block_cache
            .lock()
            .unwrap()
            .insert(key, resp.bytes.clone());
        Ok(resp.bytes)
    }

    fn read_prefetched(&self, offset: u64, n: u64) -> Result<Vec<u8>> {
        let backing = self
            .backing
            .as_ref()
            .context("prefetch buffer missing")?;
        ensure!(
            offset + n <= backing.len() as u64,
            "logical read [{}, {}) outside file of {} bytes",
            offset,
            offset + n,
            backing.len()
        );
        // Segments are contiguous in logical order, so the local offset
        // equals the logical offset once the owning segment checks out.
        let (start, segment) = self
            .segments
            .range(..=offset)
            .next_back()
            .context("logical offset before the first segment")?;
        debug_assert!(offset < start + segment.size || n == 0);
        let at = segment.local_offset + (offset - start) as usize;
        Ok(backing[at..at + n as usize].to_vec())
    }

    /// Reads a logical byte range, stitching across chunk handles when the
    /// range straddles a boundary.
    fn read_logical(&self, cc: &mut CcClient, offset: u64, n: u64) -> Result<Vec<u8>> {
        if self.prefetch_all {
            return self.read_prefetched(offset, n);
        }
        let mut out = Vec::with_capacity(n as usize);
        let mut logical = 0u64;
        let mut remaining = n;
        let mut cursor = offset;
        for handle in self.meta.handles() {
            let end = logical + handle.size;
            if cursor < end && remaining > 0 {
                let rel = cursor - logical;
                let take = (handle.size - rel).min(remaining);
                out.extend_from_slice(&self.read(cc, handle, rel, take)?);
                cursor += take;
                remaining -= take;
            }
            logical = end;
            if remaining == 0 {
                break;
            }
        }
        ensure!(remaining == 0, "logical read past end of file");
        Ok(out)
    }

    fn ensure_table_meta(&self, cc: &mut CcClient) -> Result<()> {
        {
            if self.table_meta.lock().unwrap().is_some() {
                return Ok(());
            }
        }
        let meta_handle = self
            .meta
            .meta_handle
            .context("file has no meta handle")?;
        let bytes = if self.prefetch_all {
            self.read_prefetched(self.meta.data_size(), meta_handle.size)?
        } else {
            self.read(cc, &meta_handle, 0, meta_handle.size)?
        };
        let parsed = parse_meta(&bytes)?;
        *self.table_meta.lock().unwrap() = Some(parsed);
        Ok(())
    }

    /// Point lookup. Consults the filter first, then resolves the indexed
    /// entry with a single bounded read.
    pub fn get(&self, cc: &mut CcClient, key: &[u8]) -> Result<Option<TableEntry>> {
        self.ensure_table_meta(cc)?;
        let located = {
            let guard = self.table_meta.lock().unwrap();
            let tm = guard.as_ref().expect("meta parsed above");
            if !tm.filter.may_contain(key) {
                return Ok(None);
            }
            tm.locate(key)
        };
        let (offset, len) = match located {
            Some(span) => span,
            None => return Ok(None),
        };
        let bytes = self.read_logical(cc, offset, len)?;
        let mut pos = 0usize;
        let entry = decode_entry(&bytes, &mut pos)?;
        ensure!(
            entry.key == key,
            "index pointed to a mismatching key at offset {}",
            offset
        );
        Ok(Some(entry))
    }
}

/// Compact cache key for a fetched block.
fn cache_key(rtable_id: u32, offset: u64, len: u64) -> u32 {
    let mut h: u64 = 0xcbf29ce484222325;
    for part in [u64::from(rtable_id), offset, len] {
        h ^= part;
        h = h.wrapping_mul(0x00000100000001b3);
    }
    (h ^ (h >> 32)) as u32
}
