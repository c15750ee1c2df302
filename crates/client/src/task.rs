//! Typed tasks handed from the facade to an async worker.

use dispatch::ServerId;
use wire::{CompactionRequest, LogRecord, RTableHandle, SSTableRTablePair};

use crate::context::{SharedContext, SharedStates};

/// One queued fabric request. Every variant carries the shared context the
/// protocol engine completes into.
#[derive(Debug)]
pub enum AsyncTask {
    /// One-sided read of a byte range behind a handle.
    Read {
        handle: RTableHandle,
        offset: u64,
        size: u64,
        ctx: SharedContext,
    },
    /// Allocate → write → persist one SSTable chunk.
    WriteDataBlocks {
        server_id: ServerId,
        dbname: String,
        file_number: u64,
        is_meta_blocks: bool,
        payload: Vec<u8>,
        ctx: SharedContext,
    },
    /// Replicate a framed record batch to every listed replica.
    ReplicateLogRecords {
        log_file: String,
        replicas: Vec<ServerId>,
        records: Vec<LogRecord>,
        states: SharedStates,
        ctx: SharedContext,
    },
    /// Broadcast DELETE_LOG_FILE and await every ack.
    CloseLogFile {
        log_file: String,
        replicas: Vec<ServerId>,
        ctx: SharedContext,
    },
    /// Fire-and-forget region reclaim (done at send completion).
    DeleteTables {
        server_id: ServerId,
        tables: Vec<SSTableRTablePair>,
        ctx: SharedContext,
    },
    ReadDcStats {
        server_id: ServerId,
        ctx: SharedContext,
    },
    /// Recovery: ask a StoC which log files it holds and where.
    QueryLogFiles {
        server_id: ServerId,
        db_id: u32,
        ctx: SharedContext,
    },
    /// One-sided read of a log arena segment.
    ReadLogFile {
        server_id: ServerId,
        remote_offset: u64,
        size: u64,
        ctx: SharedContext,
    },
    /// Push the filename → rtable map for garbage collection.
    FilenameRtableMapping {
        server_id: ServerId,
        mapping: Vec<(String, u32)>,
        ctx: SharedContext,
    },
    /// Ship a compaction plan and await the output file metadata.
    Compaction {
        server_id: ServerId,
        request: CompactionRequest,
        ctx: SharedContext,
    },
}
