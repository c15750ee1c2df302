//! The write-back memory file: an SSTable image built in pooled memory,
//! then chunked to a StoC and converted into a durable handle list.

use anyhow::{bail, ensure, Result};
use log::debug;
use std::thread;
use std::time::Duration;

use client::{CcClient, CcResponse};
use dispatch::ServerId;
use mempool::{MemPool, PoolBuf};
use wire::{FileMetaData, RTableHandle};

use crate::format::{build_meta, encode_entry, KeyFilter, TableEntry};

/// Target false-positive rate for the embedded key filter (1%).
const FILTER_FPR: f64 = 0.01;

/// Retries per chunk before a flush is declared failed.
const MAX_CHUNK_RETRIES: u32 = 3;

/// Progress of one chunk through allocate → write → persist.
///
/// A chunk is done iff `handle` is filled, which happens only when its
/// PERSIST response has been observed.
#[derive(Debug)]
pub struct PersistStatus {
    pub server_id: ServerId,
    pub req_id: u32,
    pub handle: Option<RTableHandle>,
}

/// One SSTable being written. Lifecycle:
///
/// 1. [`add`](SstMemFile::add) (or raw [`append`](SstMemFile::append))
///    entries in ascending key order;
/// 2. [`format`](SstMemFile::format) builds filter/index/footer in place;
/// 3. [`finalize`](SstMemFile::finalize) issues one async chunk write per
///    bounded data chunk plus a trailing meta chunk;
/// 4. [`wait_for_persisting_data_blocks`](SstMemFile::wait_for_persisting_data_blocks)
///    polls until every chunk carries its handle;
/// 5. [`into_file_meta`](SstMemFile::into_file_meta) yields the
///    [`FileMetaData`] whose handle order is the file's byte order.
pub struct SstMemFile {
    dbname: String,
    file_number: u64,
    server_id: ServerId,
    backing: PoolBuf,
    used: usize,
    /// Set by `format()`; the meta block starts here.
    data_len: usize,
    chunk_size: usize,
    index: Vec<(Vec<u8>, u64)>,
    filter: KeyFilter,
    smallest: Vec<u8>,
    largest: Vec<u8>,
    statuses: Vec<PersistStatus>,
    formatted: bool,
    scratch: Vec<u8>,
}

impl SstMemFile {
    /// Allocates a write-back file with a fixed byte budget. `capacity`
    /// must cover the data region plus the meta block.
    pub fn new(
        pool: &MemPool,
        dbname: &str,
        file_number: u64,
        server_id: ServerId,
        capacity: usize,
        expected_entries: usize,
        chunk_size: usize,
    ) -> Self {
        Self {
            dbname: dbname.to_string(),
            file_number,
            server_id,
            backing: pool.alloc(capacity),
            used: 0,
            data_len: 0,
            chunk_size: chunk_size.max(1),
            index: Vec::with_capacity(expected_entries),
            filter: KeyFilter::new(expected_entries, FILTER_FPR),
            smallest: Vec::new(),
            largest: Vec::new(),
            statuses: Vec::new(),
            formatted: false,
            scratch: Vec::with_capacity(256),
        }
    }

    #[must_use]
    pub fn used_size(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.backing.len()
    }

    #[must_use]
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Encodes one entry into the data region. Keys must arrive in
    /// ascending order; the caller deduplicates.
    pub fn add(&mut self, key: &[u8], seq: u64, value: Option<&[u8]>) -> Result<()> {
        ensure!(!self.formatted, "add after format");
        if let Some(last) = self.index.last() {
            ensure!(
                key > last.0.as_slice(),
                "keys must be added in ascending order"
            );
        }
        let entry = TableEntry {
            seq,
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
        };
        self.scratch.clear();
        encode_entry(&mut self.scratch, &entry);
        let offset = self.used;
        self.append_raw(offset, self.scratch.len())?;

        self.filter.insert(key);
        self.index.push((key.to_vec(), offset as u64));
        if self.smallest.is_empty() {
            self.smallest = key.to_vec();
        }
        self.largest = key.to_vec();
        Ok(())
    }

    /// Copies pre-encoded bytes into the data region.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        ensure!(!self.formatted, "append after format");
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        let offset = self.used;
        self.append_raw(offset, data.len())
    }

    fn append_raw(&mut self, offset: usize, len: usize) -> Result<()> {
        ensure!(
            offset + len <= self.backing.len(),
            "sstable budget exhausted: {} + {} > {}",
            offset,
            len,
            self.backing.len()
        );
        self.backing[offset..offset + len].copy_from_slice(&self.scratch[..len]);
        self.used = offset + len;
        Ok(())
    }

    /// Builds filter + index + footer in place after the data region.
    pub fn format(&mut self) -> Result<()> {
        ensure!(!self.formatted, "format called twice");
        ensure!(self.used > 0, "refusing to format an empty SSTable");
        self.data_len = self.used;
        let meta = build_meta(&self.filter, &self.index, self.data_len as u64);
        self.scratch = meta;
        let offset = self.used;
        let len = self.scratch.len();
        self.append_raw(offset, len)?;
        self.formatted = true;
        Ok(())
    }

    /// `(start, end, is_meta)` spans: the data region in `chunk_size`
    /// slices, then the meta block as one trailing chunk.
    fn chunk_spans(&self) -> Vec<(usize, usize, bool)> {
        let mut spans = Vec::new();
        let mut at = 0usize;
        while at < self.data_len {
            let end = (at + self.chunk_size).min(self.data_len);
            spans.push((at, end, false));
            at = end;
        }
        spans.push((self.data_len, self.used, true));
        spans
    }

    /// Issues one async chunk write per span and records its
    /// [`PersistStatus`]. Returns the chunk count.
    pub fn finalize(&mut self, cc: &mut CcClient) -> Result<u32> {
        ensure!(self.formatted, "finalize before format");
        ensure!(self.statuses.is_empty(), "finalize called twice");
        for (start, end, is_meta) in self.chunk_spans() {
            let req_id = cc.initiate_rtable_write_data_blocks(
                self.server_id,
                &self.dbname,
                self.file_number,
                self.backing[start..end].to_vec(),
                is_meta,
            )?;
            self.statuses.push(PersistStatus {
                server_id: self.server_id,
                req_id,
                handle: None,
            });
        }
        debug!(
            "file {} finalized into {} chunks ({} data bytes, {} meta bytes)",
            self.file_number,
            self.statuses.len(),
            self.data_len,
            self.used - self.data_len
        );
        Ok(self.statuses.len() as u32)
    }

    /// Cooperatively polls every chunk until it carries a handle. Failed
    /// chunks are re-issued with backoff up to a fixed cap.
    pub fn wait_for_persisting_data_blocks(&mut self, cc: &mut CcClient) -> Result<()> {
        let spans = self.chunk_spans();
        for (i, span) in spans.iter().enumerate() {
            let mut retries = 0u32;
            loop {
                let status = &mut self.statuses[i];
                if status.handle.is_some() {
                    break;
                }
                let mut resp = CcResponse::default();
                if !cc.is_done(status.req_id, &mut resp, Some(Duration::from_millis(100)))? {
                    continue;
                }
                if !resp.failed {
                    match resp.handle {
                        Some(h) => status.handle = Some(h),
                        None => bail!("persist response for chunk {} carried no handle", i),
                    }
                    break;
                }
                retries += 1;
                if retries > MAX_CHUNK_RETRIES {
                    bail!(
                        "chunk {} of file {} failed after {} retries",
                        i,
                        self.file_number,
                        MAX_CHUNK_RETRIES
                    );
                }
                thread::sleep(Duration::from_millis(10 << retries));
                let (start, end, is_meta) = *span;
                status.req_id = cc.initiate_rtable_write_data_blocks(
                    self.server_id,
                    &self.dbname,
                    self.file_number,
                    self.backing[start..end].to_vec(),
                    is_meta,
                )?;
            }
        }
        Ok(())
    }

    /// Chunk handles in chunk (= byte) order; complete only after
    /// [`wait_for_persisting_data_blocks`](Self::wait_for_persisting_data_blocks).
    #[must_use]
    pub fn rhs(&self) -> Vec<RTableHandle> {
        self.statuses.iter().filter_map(|s| s.handle).collect()
    }

    /// Consumes the writer into the file's metadata. The last handle is the
    /// meta chunk; the rest are data chunks in byte order.
    pub fn into_file_meta(self, level: u32) -> Result<FileMetaData> {
        let mut handles = Vec::with_capacity(self.statuses.len());
        for (i, s) in self.statuses.iter().enumerate() {
            match s.handle {
                Some(h) => handles.push(h),
                None => bail!("chunk {} of file {} never persisted", i, self.file_number),
            }
        }
        let meta_handle = handles.pop();
        ensure!(meta_handle.is_some(), "file has no meta chunk");
        Ok(FileMetaData {
            number: self.file_number,
            level,
            file_size: self.used as u64,
            smallest: self.smallest,
            largest: self.largest,
            data_handles: handles,
            meta_handle,
        })
    }
}
