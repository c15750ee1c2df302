//! The StoC request handler and the remote compaction runner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};

use dispatch::ServerId;
use sstable::format::{build_meta, decode_entries, encode_entry, KeyFilter, TableEntry};
use sstable::MergeIterator;
use wire::{CompactionRequest, DcStats, FileMetaData, Message, LOG_ARENA_RTABLE_ID};

use crate::arena::LogArena;
use crate::registry::{RTableRegistry, StocError};

/// Filter false-positive rate for compaction outputs (matches the writer).
const FILTER_FPR: f64 = 0.01;

/// One storage node: region registry + log arena + request handler.
pub struct StocServer {
    server_id: ServerId,
    registry: RTableRegistry,
    arena: LogArena,
    /// `filename → rtable_id` pushed by the compute side for GC.
    fn_rtable: Mutex<HashMap<String, u32>>,
    inflight: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    nreplicates: AtomicU64,
    ncompactions: AtomicU64,
}

impl StocServer {
    pub fn new(
        server_id: ServerId,
        capacity: u64,
        log_capacity: u64,
        dir: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            server_id,
            registry: RTableRegistry::new(server_id, capacity, dir)?,
            arena: LogArena::new(log_capacity),
            fn_rtable: Mutex::new(HashMap::new()),
            inflight: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            nreplicates: AtomicU64::new(0),
            ncompactions: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Reloads persisted regions after a restart.
    pub fn recover(&self) -> Result<usize> {
        self.registry.recover()
    }

    #[must_use]
    pub fn registry(&self) -> &RTableRegistry {
        &self.registry
    }

    #[must_use]
    pub fn arena(&self) -> &LogArena {
        &self.arena
    }

    /// One-sided READ target: region 0 is the log arena, everything else
    /// the registry.
    pub fn read_mem(&self, rtable_id: u32, offset: u64, size: u64) -> Result<Vec<u8>, StocError> {
        self.read_bytes.fetch_add(size, Ordering::Relaxed);
        if rtable_id == LOG_ARENA_RTABLE_ID {
            self.arena.read(offset, size)
        } else {
            self.registry.read(rtable_id, offset, size)
        }
    }

    /// One-sided WRITE target.
    pub fn write_mem(&self, rtable_id: u32, offset: u64, data: &[u8]) -> Result<(), StocError> {
        self.write_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if rtable_id == LOG_ARENA_RTABLE_ID {
            self.arena.write(offset, data)
        } else {
            self.registry.write(rtable_id, offset, data)
        }
    }

    /// Decodes one request and acts on it, returning the encoded response
    /// if the message defines one. A decode failure or a response-tagged
    /// message is a protocol violation: the error propagates and the
    /// fabric tears down this server's queue pair.
    pub fn handle_message(&self, buf: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self.dispatch_message(buf);
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn dispatch_message(&self, buf: &[u8]) -> Result<Option<Vec<u8>>> {
        let msg = Message::decode(buf).context("undecodable request")?;
        let reply = match msg {
            Message::AllocateSstableBuffer {
                dbname,
                file_number,
                size,
                ..
            } => {
                let handle = self.registry.allocate(&dbname, file_number, size);
                Some(Message::AllocateSstableBufferSucc { handle })
            }
            // Combined allocate variant kept for transports without the
            // two-phase path; same allocation, different response tag.
            Message::RtableWriteSstable {
                dbname,
                file_number,
                size,
                ..
            } => {
                let handle = self.registry.allocate(&dbname, file_number, size);
                Some(Message::RtableWriteSstableResponse { handle })
            }
            Message::FlushSstableBuf { rtable_id, .. } => {
                // The persist flag lets a StoC defer; this server persists
                // eagerly so the response always implies durability.
                let handle = self.registry.persist(rtable_id)?;
                Some(Message::RtablePersistResponse { handle })
            }
            Message::FlushSstable { file_number } => {
                let handles = self.registry.persist_file(file_number)?;
                Some(Message::FlushSstableSucc { handles })
            }
            Message::ReleaseSstableBuffer { rtable_id } => {
                self.registry.release(rtable_id);
                None
            }
            Message::DeleteTables { tables } => {
                self.registry.delete(&tables);
                None
            }
            Message::RtableReadBlocks {
                handle,
                offset,
                size,
            } => {
                // Messaged read fallback; the reply is the raw bytes.
                let bytes = self.read_mem(handle.rtable_id, handle.offset + offset, size)?;
                return Ok(Some(bytes));
            }
            Message::ReadBlocks {
                rtable_id,
                offset,
                size,
            } => {
                let bytes = self.read_mem(rtable_id, offset, size)?;
                return Ok(Some(bytes));
            }
            Message::ReadInMemoryLogFile { offset, size } => {
                let bytes = self.arena.read(offset, size)?;
                return Ok(Some(bytes));
            }
            Message::AllocateLogBuffer { log_file, size } => {
                let (offset, size) = self.arena.allocate(&log_file, size).unwrap_or((0, 0));
                Some(Message::AllocateLogBufferSucc { offset, size })
            }
            Message::DeleteLogFile { log_file } => {
                self.arena.delete(&log_file);
                Some(Message::DeleteLogFileSucc { log_file })
            }
            Message::ReplicateLogRecords { log_file, .. } => {
                // Messaged fallback: stage the batch exactly as a one-sided
                // write would, so recovery scans see the same frames.
                self.nreplicates.fetch_add(1, Ordering::Relaxed);
                if let Some((offset, _)) = self.arena.allocate(&log_file, buf.len() as u64) {
                    self.arena.write(offset, buf)?;
                }
                None
            }
            Message::QueryLogFiles { db_id } => {
                let offsets = self.arena.query(&format!("db{db_id}-"));
                Some(Message::QueryLogFilesResponse { offsets })
            }
            Message::DcReadStats => Some(Message::DcReadStatsResponse {
                stats: self.stats(),
            }),
            Message::FilenameRtableId { mapping } => {
                self.fn_rtable.lock().unwrap().extend(mapping);
                Some(Message::FilenameRtableIdResponse)
            }
            Message::Compaction { request } => {
                let outputs = self.run_compaction(&request)?;
                Some(Message::CompactionResponse { outputs })
            }
            other => bail!(
                "unexpected message {:?} at storage node",
                other.msg_type()
            ),
        };
        Ok(reply.map(|m| m.encode()))
    }

    fn stats(&self) -> DcStats {
        DcStats {
            queue_depth: self.inflight.load(Ordering::SeqCst).saturating_sub(1),
            pending_read_bytes: self.read_bytes.load(Ordering::Relaxed),
            pending_write_bytes: self.write_bytes.load(Ordering::Relaxed),
        }
    }

    /// Number of filename → rtable mappings retained for GC.
    pub fn mapped_filenames(&self) -> usize {
        self.fn_rtable.lock().unwrap().len()
    }

    /// Executes a compaction plan: merge the inputs, drop dead tombstones,
    /// split outputs at the guide anchors, write and persist each output.
    ///
    /// Output file numbers are `max(input numbers) + 1 + i`, so re-running
    /// an identical plan reproduces the same numbers and key ranges.
    fn run_compaction(&self, req: &CompactionRequest) -> Result<Vec<FileMetaData>> {
        self.ncompactions.fetch_add(1, Ordering::Relaxed);
        let mut runs = Vec::new();
        let mut max_number = 0u64;
        for file in req.inputs.iter().flatten() {
            max_number = max_number.max(file.number);
            let mut data = Vec::with_capacity(file.data_size() as usize);
            for h in &file.data_handles {
                let bytes = self
                    .registry
                    .read(h.rtable_id, h.offset, h.size)
                    .map_err(|e| anyhow::anyhow!("input file {}: {e}", file.number))?;
                data.extend_from_slice(&bytes);
            }
            runs.push(decode_entries(&data)?);
        }

        // Merge, GC tombstones nothing can read anymore, and cut a new
        // output at every guide anchor.
        let mut merge = MergeIterator::new(runs);
        let mut partitions: Vec<Vec<TableEntry>> = Vec::new();
        let mut current: Vec<TableEntry> = Vec::new();
        let mut guide_idx = 0usize;
        while let Some(entry) = merge.next_entry() {
            if entry.value.is_none() && entry.seq <= req.smallest_snapshot {
                continue;
            }
            while guide_idx < req.guides.len()
                && entry.key.as_slice() >= req.guides[guide_idx].as_slice()
            {
                if !current.is_empty() {
                    partitions.push(std::mem::take(&mut current));
                }
                guide_idx += 1;
            }
            current.push(entry);
        }
        if !current.is_empty() {
            partitions.push(current);
        }

        let mut outputs = Vec::with_capacity(partitions.len());
        for (i, entries) in partitions.iter().enumerate() {
            let number = max_number + 1 + i as u64;
            outputs.push(self.write_table(&req.dbname, number, req.target_level, entries)?);
        }
        info!(
            "stoc {}: compaction of {}+{} inputs produced {} outputs",
            self.server_id,
            req.inputs[0].len(),
            req.inputs[1].len(),
            outputs.len()
        );
        Ok(outputs)
    }

    /// Writes one compaction output into freshly allocated, persisted
    /// regions: one data chunk plus the meta block.
    fn write_table(
        &self,
        dbname: &str,
        number: u64,
        level: u32,
        entries: &[TableEntry],
    ) -> Result<FileMetaData> {
        ensure!(!entries.is_empty(), "refusing to write an empty output");
        let mut data = Vec::new();
        let mut index = Vec::with_capacity(entries.len());
        let mut filter = KeyFilter::new(entries.len(), FILTER_FPR);
        for entry in entries {
            filter.insert(&entry.key);
            index.push((entry.key.clone(), data.len() as u64));
            encode_entry(&mut data, entry);
        }
        let meta_block = build_meta(&filter, &index, data.len() as u64);

        let data_handle = self
            .registry
            .allocate(dbname, number, data.len() as u64);
        ensure!(!data_handle.is_null(), "storage capacity exhausted");
        self.registry
            .write(data_handle.rtable_id, data_handle.offset, &data)?;

        let meta_handle = self
            .registry
            .allocate(dbname, number, meta_block.len() as u64);
        ensure!(!meta_handle.is_null(), "storage capacity exhausted");
        self.registry
            .write(meta_handle.rtable_id, meta_handle.offset, &meta_block)?;

        // Both chunks share the file's region; one persist covers them.
        self.registry.persist(data_handle.rtable_id)?;
        debug!(
            "stoc {}: wrote compaction output {number} ({} entries, {} bytes)",
            self.server_id,
            entries.len(),
            data.len() + meta_block.len()
        );

        Ok(FileMetaData {
            number,
            level,
            file_size: (data.len() + meta_block.len()) as u64,
            smallest: entries.first().expect("non-empty").key.clone(),
            largest: entries.last().expect("non-empty").key.clone(),
            data_handles: vec![data_handle],
            meta_handle: Some(meta_handle),
        })
    }
}
