//! # Config — node configuration
//!
//! One explicit [`NodeConfig`] value is built at startup and threaded
//! through every constructor; nothing reads configuration globally.
//!
//! All settings come from `DRIFT_*` environment variables with defaults:
//!
//! ```text
//! DRIFT_DB_PATH             database path                  (default "data/drift")
//! DRIFT_SERVER_ID           this node's id                 (default 0)
//! DRIFT_LTC_SERVERS         comma-separated compute nodes  (default "ltc-0")
//! DRIFT_STOC_SERVERS        comma-separated storage nodes  (default "stoc-0")
//! DRIFT_CONN_WORKERS        connection worker threads      (default 1)
//! DRIFT_ASYNC_WORKERS       async worker threads           (default 2)
//! DRIFT_COMPACTION_WORKERS  compaction worker threads      (default 1)
//! DRIFT_LOG_REPLICAS        log replication fan-out        (default 1)
//! DRIFT_RDMA_PORT           fabric port                    (default 11211)
//! DRIFT_RDMA_MAX_MSG_KB     max message size in KiB        (default 256)
//! DRIFT_RDMA_MAX_SENDS      pending sends per queue pair   (default 64)
//! DRIFT_RDMA_DOORBELL       doorbell batch size            (default 8)
//! DRIFT_RDMA_PQ_BATCH       posts buffered before polling  (default 8)
//! DRIFT_MEM_POOL_MB         buffer pool size in MiB        (default 64)
//! DRIFT_WRITE_BUFFER_MB     memtable budget in MiB         (default 4)
//! DRIFT_BLOCK_CACHE_MB      block cache size in MiB        (default 8)
//! DRIFT_LOG_BUF_KB          log buffer lease in KiB        (default 64)
//! DRIFT_SST_CHUNK_KB        SSTable chunk size in KiB      (default 64)
//! DRIFT_STOC_CAPACITY_MB    per-StoC region budget in MiB  (default 256)
//! DRIFT_ENABLE_RDMA         use the fabric                 (default true)
//! DRIFT_ENABLE_LOAD_DATA    seed initial data              (default false)
//! ```

use std::path::PathBuf;

/// Fabric tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaOptions {
    pub port: u16,
    pub max_msg_size: usize,
    /// Pending sends per queue pair; the same number of receives is kept
    /// posted.
    pub max_num_sends: usize,
    pub doorbell_batch_size: usize,
    /// Posts a worker buffers before polling the completion queue.
    pub pq_batch_size: usize,
}

impl Default for RdmaOptions {
    fn default() -> Self {
        Self {
            port: 11211,
            max_msg_size: 256 * 1024,
            max_num_sends: 64,
            doorbell_batch_size: 8,
            pq_batch_size: 8,
        }
    }
}

/// Complete configuration of one DriftKV node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub db_path: PathBuf,
    pub server_id: u32,
    pub ltc_servers: Vec<String>,
    pub stoc_servers: Vec<String>,
    pub num_conn_workers: usize,
    pub num_async_workers: usize,
    pub num_compaction_workers: usize,
    /// Replica StoCs each memtable's log is written to.
    pub log_replicas: usize,
    pub rdma: RdmaOptions,
    pub mem_pool_mb: usize,
    pub write_buffer_mb: usize,
    pub block_cache_mb: usize,
    /// Default log buffer lease per (replica, log file).
    pub log_buf_size: u64,
    /// Upper bound per SSTable data chunk.
    pub sst_chunk_size: usize,
    /// Region budget per StoC.
    pub stoc_capacity: u64,
    pub enable_rdma: bool,
    pub enable_load_data: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/drift"),
            server_id: 0,
            ltc_servers: vec!["ltc-0".to_string()],
            stoc_servers: vec!["stoc-0".to_string()],
            num_conn_workers: 1,
            num_async_workers: 2,
            num_compaction_workers: 1,
            log_replicas: 1,
            rdma: RdmaOptions::default(),
            mem_pool_mb: 64,
            write_buffer_mb: 4,
            block_cache_mb: 8,
            log_buf_size: 64 * 1024,
            sst_chunk_size: 64 * 1024,
            stoc_capacity: 256 * 1024 * 1024,
            enable_rdma: true,
            enable_load_data: false,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl NodeConfig {
    /// Builds a configuration from `DRIFT_*` environment variables.
    pub fn from_env() -> Self {
        let d = NodeConfig::default();
        Self {
            db_path: PathBuf::from(env_or("DRIFT_DB_PATH", "data/drift")),
            server_id: env_parse("DRIFT_SERVER_ID", d.server_id),
            ltc_servers: split_servers(&env_or("DRIFT_LTC_SERVERS", "ltc-0")),
            stoc_servers: split_servers(&env_or("DRIFT_STOC_SERVERS", "stoc-0")),
            num_conn_workers: env_parse("DRIFT_CONN_WORKERS", d.num_conn_workers),
            num_async_workers: env_parse("DRIFT_ASYNC_WORKERS", d.num_async_workers),
            num_compaction_workers: env_parse("DRIFT_COMPACTION_WORKERS", d.num_compaction_workers),
            log_replicas: env_parse("DRIFT_LOG_REPLICAS", d.log_replicas),
            rdma: RdmaOptions {
                port: env_parse("DRIFT_RDMA_PORT", d.rdma.port),
                max_msg_size: env_parse::<usize>("DRIFT_RDMA_MAX_MSG_KB", 256) * 1024,
                max_num_sends: env_parse("DRIFT_RDMA_MAX_SENDS", d.rdma.max_num_sends),
                doorbell_batch_size: env_parse("DRIFT_RDMA_DOORBELL", d.rdma.doorbell_batch_size),
                pq_batch_size: env_parse("DRIFT_RDMA_PQ_BATCH", d.rdma.pq_batch_size),
            },
            mem_pool_mb: env_parse("DRIFT_MEM_POOL_MB", d.mem_pool_mb),
            write_buffer_mb: env_parse("DRIFT_WRITE_BUFFER_MB", d.write_buffer_mb),
            block_cache_mb: env_parse("DRIFT_BLOCK_CACHE_MB", d.block_cache_mb),
            log_buf_size: env_parse::<u64>("DRIFT_LOG_BUF_KB", 64) * 1024,
            sst_chunk_size: env_parse::<usize>("DRIFT_SST_CHUNK_KB", 64) * 1024,
            stoc_capacity: env_parse::<u64>("DRIFT_STOC_CAPACITY_MB", 256) * 1024 * 1024,
            enable_rdma: env_parse("DRIFT_ENABLE_RDMA", d.enable_rdma),
            enable_load_data: env_parse("DRIFT_ENABLE_LOAD_DATA", d.enable_load_data),
        }
    }

    /// Startup invariants. Violations are configuration bugs, reported all
    /// at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.stoc_servers.is_empty() {
            problems.push("at least one StoC server is required".to_string());
        }
        if self.log_replicas == 0 || self.log_replicas > self.stoc_servers.len() {
            problems.push(format!(
                "log_replicas {} must be in 1..={}",
                self.log_replicas,
                self.stoc_servers.len()
            ));
        }
        if self.num_async_workers == 0 {
            problems.push("num_async_workers must be non-zero".to_string());
        }
        if self.num_compaction_workers == 0 {
            problems.push("num_compaction_workers must be non-zero".to_string());
        }
        if self.sst_chunk_size == 0 {
            problems.push("sst_chunk_size must be non-zero".to_string());
        }
        if self.log_buf_size == 0 {
            problems.push("log_buf_size must be non-zero".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Server ids of the StoCs, following the LTC ids in the global list.
    pub fn stoc_ids(&self) -> Vec<u32> {
        let base = self.ltc_servers.len() as u32;
        (0..self.stoc_servers.len() as u32)
            .map(|i| base + i)
            .collect()
    }

    /// The replica set for a memtable's log, chosen round-robin from the
    /// StoC list.
    pub fn log_replica_set(&self, memtable_id: u32) -> Vec<u32> {
        let ids = self.stoc_ids();
        (0..self.log_replicas)
            .map(|i| ids[(memtable_id as usize + i) % ids.len()])
            .collect()
    }
}
