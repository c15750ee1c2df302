//! Per-request shared state between the caller and the protocol engine.

use std::sync::{Arc, Mutex};

use dispatch::ServerId;
use wire::{DcStats, FileMetaData, RTableHandle};

/// Replica progress during one log replication call.
///
/// Transitions are strictly forward within a call:
/// `None → WaitForAlloc → AllocSuccess → WaitForWrite → WriteSuccess`.
/// A replica whose write fails is reset to `None` so a retry can re-drive
/// it; the call as a whole completes only when every replica reads
/// `WriteSuccess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteState {
    #[default]
    None,
    WaitForAlloc,
    AllocSuccess,
    WaitForWrite,
    WriteSuccess,
}

impl WriteState {
    /// Short name for log lines.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            WriteState::None => "NONE",
            WriteState::WaitForAlloc => "WAIT_FOR_ALLOC",
            WriteState::AllocSuccess => "ALLOC_SUCCESS",
            WriteState::WaitForWrite => "WAIT_FOR_WRITE",
            WriteState::WriteSuccess => "WRITE_SUCCESS",
        }
    }
}

/// Replica state array shared between the caller and the engine, one entry
/// per replica in call order.
pub type SharedStates = Arc<Mutex<Vec<WriteState>>>;

/// The typed kind of an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    WriteDataBlocks,
    ReplicateLogRecords,
    CloseLogFile,
    DeleteTables,
    ReadDcStats,
    QueryLogFiles,
    ReadLogFile,
    FilenameRtableMapping,
    Compaction,
}

/// The slot a caller polls through `is_done`. Created at `initiate_*`,
/// mutated by the protocol engine, consumed when `is_done` returns true.
#[derive(Debug)]
pub struct RequestContext {
    pub kind: RequestKind,
    /// Destination server; for broadcast kinds, the first replica.
    pub server_id: ServerId,
    pub done: bool,
    pub failed: bool,
    /// Set by `abandon`; the facade sweeps abandoned slots lazily once
    /// their completion has landed.
    pub abandoned: bool,
    /// Acks still outstanding for broadcast kinds (close-log) and replicas
    /// still short of `WriteSuccess` for replication.
    pub pending_acks: usize,
    /// WRITE_DATA_BLOCKS result.
    pub handle: Option<RTableHandle>,
    /// READ / READ_LOG_FILE result.
    pub bytes: Option<Vec<u8>>,
    /// READ_DC_STATS result.
    pub stats: Option<DcStats>,
    /// QUERY_LOG_FILES result.
    pub log_offsets: Vec<(String, u64)>,
    /// COMPACTION result.
    pub outputs: Vec<FileMetaData>,
}

impl RequestContext {
    pub fn new(kind: RequestKind, server_id: ServerId) -> Self {
        Self {
            kind,
            server_id,
            done: false,
            failed: false,
            abandoned: false,
            pending_acks: 0,
            handle: None,
            bytes: None,
            stats: None,
            log_offsets: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// Shared ownership of a request slot between facade and engine.
pub type SharedContext = Arc<Mutex<RequestContext>>;

/// Results moved out of a completed request by `is_done`.
#[derive(Debug, Default)]
pub struct CcResponse {
    /// The operation failed (transport error, allocation failure, stale
    /// handle). Retry policy is the caller's.
    pub failed: bool,
    pub handle: Option<RTableHandle>,
    pub bytes: Vec<u8>,
    pub stats: Option<DcStats>,
    pub log_offsets: Vec<(String, u64)>,
    pub outputs: Vec<FileMetaData>,
}

impl CcResponse {
    /// Fills the response from a completed context, draining its results.
    pub(crate) fn take_from(&mut self, ctx: &mut RequestContext) {
        self.failed = ctx.failed;
        self.handle = ctx.handle.take();
        self.bytes = ctx.bytes.take().unwrap_or_default();
        self.stats = ctx.stats.take();
        self.log_offsets = std::mem::take(&mut ctx.log_offsets);
        self.outputs = std::mem::take(&mut ctx.outputs);
    }
}
