//! The LTC node: an LSM front end whose tables live on remote StoCs.
//!
//! Writes replicate their log records to the configured replica StoCs
//! before touching the memtable; a full memtable flushes into a remote
//! SSTable through the write-back mem file; reads check the memtable, then
//! L0 (newest first), then L1; compaction ships a plan to the StoC holding
//! the tables and swaps the returned outputs in.
//!
//! Placement: every SSTable of this node lands on the first configured
//! StoC so a remote compaction finds all of its inputs locally; log
//! records fan out across the whole StoC list.

use std::collections::{hash_map::Entry, BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use log::{info, warn};

use client::{spawn_async_workers, CcClient, CcResponse, WriteState};
use config::NodeConfig;
use lookup::{key_hash, LookupIndex, NO_LOCATION};
use mempool::MemPool;
use sstable::{RemoteSstReader, SstMemFile};
use stoc::{MemFabric, StocServer};
use wire::{CompactionRequest, DcStats, FileMetaData, LogRecord, SSTableRTablePair, SubRange};

/// Single database per node in the shell.
const DB_NAME: &str = "db0";
const DB_ID: u32 = 0;

/// L0 file count that triggers a compaction after flush.
const L0_COMPACTION_TRIGGER: usize = 4;

/// Slots in the memtable lookup index.
const LOOKUP_SLOTS: usize = 64 * 1024;

/// Log arena capacity per StoC.
const LOG_ARENA_CAPACITY: u64 = 64 * 1024 * 1024;

/// Replication attempts before a write is failed back to the caller.
const REPLICATE_RETRIES: u32 = 3;

/// Keys seeded by `enable_load_data`.
const LOAD_KEYS: u32 = 1000;

struct MemEntry {
    seq: u64,
    value: Option<Vec<u8>>,
}

fn entry_bytes(key: &[u8], value: Option<&[u8]>) -> usize {
    4 + 4 + key.len() + 8 + 1 + value.map_or(0, |v| 4 + v.len())
}

/// One compute node over an in-process fabric.
pub struct LtcNode {
    cfg: NodeConfig,
    pool: MemPool,
    fabric: MemFabric,
    cc: CcClient,
    /// StoC hosting this node's SSTables.
    sst_server: u32,
    mem: BTreeMap<Vec<u8>, MemEntry>,
    mem_bytes: usize,
    /// Current memtable id; starts at 1 (0 is the locator's empty slot).
    memtable_id: u32,
    seq: u64,
    next_file_number: u64,
    l0: Vec<FileMetaData>,
    l1: Vec<FileMetaData>,
    locator: LookupIndex,
    readers: HashMap<u64, RemoteSstReader>,
}

impl LtcNode {
    /// Boots the StoCs, the fabric and the worker pool, then recovers any
    /// persisted regions.
    pub fn start(cfg: NodeConfig) -> Result<Self> {
        if let Err(problems) = cfg.validate() {
            bail!("invalid configuration:\n- {}", problems.join("\n- "));
        }

        let pool = MemPool::with_default_classes();
        let fabric = MemFabric::new();
        for id in cfg.stoc_ids() {
            let dir = cfg.db_path.join(format!("stoc-{id}"));
            let server = StocServer::new(id, cfg.stoc_capacity, LOG_ARENA_CAPACITY, Some(dir))
                .with_context(|| format!("starting stoc {id}"))?;
            server.recover()?;
            fabric.register(Arc::new(server));
        }

        let fabric_for_workers = fabric.clone();
        let workers = spawn_async_workers(
            cfg.num_async_workers,
            |_id| fabric_for_workers.store_for_worker(),
            cfg.log_buf_size,
            cfg.rdma.max_num_sends * 8,
        );
        let cc = CcClient::new(workers);
        let sst_server = cfg.stoc_ids()[0];

        let mut node = Self {
            pool,
            fabric,
            cc,
            sst_server,
            mem: BTreeMap::new(),
            mem_bytes: 0,
            memtable_id: 1,
            seq: 0,
            next_file_number: 1,
            l0: Vec::new(),
            l1: Vec::new(),
            locator: LookupIndex::new(LOOKUP_SLOTS),
            readers: HashMap::new(),
            cfg,
        };
        if node.cfg.enable_load_data {
            node.load_data()?;
        }
        info!(
            "ltc node up: {} stocs, {} async workers, replicas={}",
            node.cfg.stoc_servers.len(),
            node.cfg.num_async_workers,
            node.cfg.log_replicas
        );
        Ok(node)
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn l0_count(&self) -> usize {
        self.l0.len()
    }

    #[must_use]
    pub fn l1_count(&self) -> usize {
        self.l1.len()
    }

    #[must_use]
    pub fn fabric(&self) -> &MemFabric {
        &self.fabric
    }

    fn log_file(&self) -> String {
        format!("db{DB_ID}-mem{}", self.memtable_id)
    }

    /// Replicates a record batch to the memtable's replica set, retrying
    /// replicas that failed mid-write.
    fn replicate(&mut self, records: Vec<LogRecord>) -> Result<()> {
        let replicas = self.cfg.log_replica_set(self.memtable_id);
        let states = Arc::new(Mutex::new(vec![WriteState::None; replicas.len()]));
        let log_file = self.log_file();
        for attempt in 0..REPLICATE_RETRIES {
            let req = self.cc.initiate_replicate_log_records(
                &log_file,
                &replicas,
                records.clone(),
                Arc::clone(&states),
            )?;
            let mut resp = CcResponse::default();
            if self
                .cc
                .is_done(req, &mut resp, Some(Duration::from_secs(1)))?
            {
                return Ok(());
            }
            self.cc.abandon(req);
            warn!(
                "replication of {log_file} incomplete (attempt {}), retrying failed replicas",
                attempt + 1
            );
            std::thread::sleep(Duration::from_millis(10 << attempt));
        }
        bail!("log replication of {log_file} failed after {REPLICATE_RETRIES} attempts");
    }

    /// Inserts a key-value pair: replicate the log record, then apply.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        ensure!(!key.is_empty(), "key must not be empty");
        self.seq += 1;
        let seq = self.seq;
        self.replicate(vec![LogRecord {
            sequence: seq,
            key: key.clone(),
            value: value.clone(),
        }])?;

        self.mem_bytes += entry_bytes(&key, Some(&value));
        self.locator.insert(key_hash(&key), self.memtable_id);
        self.mem.insert(
            key,
            MemEntry {
                seq,
                value: Some(value),
            },
        );

        if self.mem_bytes >= self.cfg.write_buffer_mb * 1024 * 1024 {
            self.flush()?;
        }
        Ok(())
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&mut self, key: Vec<u8>) -> Result<()> {
        ensure!(!key.is_empty(), "key must not be empty");
        self.seq += 1;
        let seq = self.seq;
        self.replicate(vec![LogRecord {
            sequence: seq,
            key: key.clone(),
            value: Vec::new(),
        }])?;

        self.mem_bytes += entry_bytes(&key, None);
        self.locator.insert(key_hash(&key), self.memtable_id);
        self.mem.insert(key, MemEntry { seq, value: None });
        Ok(())
    }

    /// Point lookup: memtable, then L0 newest-first, then L1.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.mem.get(key) {
            return Ok(entry.value.clone());
        }
        let candidates: Vec<FileMetaData> = self
            .l0
            .iter()
            .chain(self.l1.iter())
            .filter(|f| f.smallest.as_slice() <= key && key <= f.largest.as_slice())
            .cloned()
            .collect();
        for meta in candidates {
            let reader = match self.readers.entry(meta.number) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(v) => {
                    let reader = RemoteSstReader::new(meta.clone(), &mut self.cc, &self.pool, false)?;
                    v.insert(reader)
                }
            };
            if let Some(entry) = reader.get(&mut self.cc, key)? {
                // A tombstone shadows anything older.
                return Ok(entry.value);
            }
        }
        Ok(None)
    }

    /// Flushes the memtable into a remote SSTable and releases its log.
    pub fn flush(&mut self) -> Result<()> {
        if self.mem.is_empty() {
            return Ok(());
        }
        let file_number = self.next_file_number;
        self.next_file_number += 1;

        // Data plus index/filter/footer headroom.
        let capacity = 2 * self.mem_bytes + 16 * self.mem.len() + 4096;
        let mut writer = SstMemFile::new(
            &self.pool,
            DB_NAME,
            file_number,
            self.sst_server,
            capacity,
            self.mem.len(),
            self.cfg.sst_chunk_size,
        );
        for (key, entry) in &self.mem {
            writer.add(key, entry.seq, entry.value.as_deref())?;
        }
        writer.format()?;
        let chunks = writer.finalize(&mut self.cc)?;
        writer.wait_for_persisting_data_blocks(&mut self.cc)?;
        let meta = writer.into_file_meta(0)?;

        // Let the StoC tie the file name to its region for GC.
        if let Some(first) = meta.handles().next() {
            let req = self.cc.initiate_filename_rtable_mapping(
                self.sst_server,
                vec![(format!("{file_number:06}.sst"), first.rtable_id)],
            )?;
            self.cc.wait(req)?;
        }

        // The memtable is durable in the table now; drop its log.
        let replicas = self.cfg.log_replica_set(self.memtable_id);
        let req = self.cc.initiate_close_log_file(&self.log_file(), &replicas)?;
        let resp = self.cc.wait(req)?;
        if resp.failed {
            warn!("closing {} reported a failed replica", self.log_file());
        }

        // Flushed keys resolve through tables from here on.
        for key in self.mem.keys() {
            self.locator.cas(key_hash(key), self.memtable_id, NO_LOCATION);
        }

        info!(
            "flushed memtable {} into file {file_number} ({chunks} chunks, {} bytes)",
            self.memtable_id, meta.file_size
        );
        self.mem.clear();
        self.mem_bytes = 0;
        self.memtable_id += 1;
        self.l0.insert(0, meta);

        if self.l0.len() >= L0_COMPACTION_TRIGGER {
            self.compact()?;
        }
        Ok(())
    }

    /// Ships a compaction plan for all current tables and installs the
    /// outputs as the new L1.
    pub fn compact(&mut self) -> Result<()> {
        if self.l0.len() + self.l1.len() < 2 {
            return Ok(());
        }
        let inputs = [self.l0.clone(), self.l1.clone()];

        // Output anchors: every input file boundary except the global
        // smallest.
        let mut guides: Vec<Vec<u8>> = inputs
            .iter()
            .flatten()
            .map(|f| f.smallest.clone())
            .collect();
        guides.sort();
        guides.dedup();
        if !guides.is_empty() {
            guides.remove(0);
        }

        let lower = inputs
            .iter()
            .flatten()
            .map(|f| f.smallest.clone())
            .min()
            .unwrap_or_default();
        let upper = inputs
            .iter()
            .flatten()
            .map(|f| f.largest.clone())
            .max()
            .unwrap_or_default();

        let request = CompactionRequest {
            dbname: DB_NAME.to_string(),
            smallest_snapshot: self.seq,
            source_level: 0,
            target_level: 1,
            inputs: inputs.clone(),
            guides,
            subranges: vec![SubRange { lower, upper }],
            outputs: Vec::new(),
        };
        let req = self.cc.initiate_compaction(self.sst_server, request)?;
        let resp = self.cc.wait(req)?;
        if resp.failed {
            bail!("remote compaction failed");
        }
        let mut outputs = resp.outputs;
        outputs.sort_by(|a, b| a.smallest.cmp(&b.smallest));

        // Retire the inputs once the outputs are in hand.
        let mut pairs: Vec<SSTableRTablePair> = inputs
            .iter()
            .flatten()
            .flat_map(|f| {
                f.handles().map(|h| SSTableRTablePair {
                    file_number: f.number,
                    rtable_id: h.rtable_id,
                })
            })
            .collect();
        pairs.sort_by_key(|p| (p.file_number, p.rtable_id));
        pairs.dedup_by_key(|p| (p.file_number, p.rtable_id));
        let req = self.cc.initiate_delete_tables(self.sst_server, pairs)?;
        self.cc.wait(req)?;

        self.next_file_number = outputs
            .iter()
            .map(|f| f.number + 1)
            .max()
            .unwrap_or(self.next_file_number);
        info!(
            "compaction replaced {}+{} files with {} outputs",
            self.l0.len(),
            self.l1.len(),
            outputs.len()
        );
        self.l0.clear();
        self.l1 = outputs;
        self.readers.clear();
        Ok(())
    }

    /// Queue depth and pending bytes of the table StoC.
    pub fn dc_stats(&mut self) -> Result<DcStats> {
        let req = self.cc.initiate_read_dc_stats(self.sst_server)?;
        let resp = self.cc.wait(req)?;
        resp.stats.context("stats response missing payload")
    }

    /// Seeds the key range, cold keys first so hot ones end up in the
    /// upper levels.
    fn load_data(&mut self) -> Result<()> {
        info!("loading {LOAD_KEYS} keys");
        for i in (0..LOAD_KEYS).rev() {
            let key = format!("{i:06}").into_bytes();
            let fill = b'a' + (i % 10) as u8;
            self.put(key, vec![fill; 64])?;
        }
        info!("load complete, seq={}", self.seq);
        Ok(())
    }
}

impl std::fmt::Debug for LtcNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LtcNode")
            .field("seq", &self.seq)
            .field("memtable_id", &self.memtable_id)
            .field("memtable_entries", &self.mem.len())
            .field("memtable_bytes", &self.mem_bytes)
            .field("l0_files", &self.l0.len())
            .field("l1_files", &self.l1.len())
            .field("next_file_number", &self.next_file_number)
            .field("locator_slots", &self.locator.size())
            .finish()
    }
}
