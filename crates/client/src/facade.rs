//! The `CcClient` facade: request ids, the pending map, `initiate_*` and
//! `is_done`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use dispatch::{spawn_worker, PushError, RdmaStore, ServerId, WorkerHandle};
use wire::{CompactionRequest, LogRecord, RTableHandle, SSTableRTablePair};

use crate::context::{CcResponse, RequestContext, RequestKind, SharedContext, WriteState};
use crate::protocol::CcProtocol;
use crate::task::AsyncTask;
use crate::{CcError, SharedStates};

/// Spawns the async worker pool, one [`CcProtocol`] per worker. The store
/// factory hands each worker its own endpoint set.
pub fn spawn_async_workers<F>(
    num_workers: usize,
    store_for_worker: F,
    log_buf_size: u64,
    queue_capacity: usize,
) -> Vec<Arc<WorkerHandle<AsyncTask>>>
where
    F: Fn(usize) -> Arc<dyn RdmaStore>,
{
    (0..num_workers.max(1))
        .map(|id| {
            let protocol = CcProtocol::new(id, log_buf_size);
            Arc::new(spawn_worker(
                id,
                protocol,
                store_for_worker(id),
                queue_capacity,
            ))
        })
        .collect()
}

/// Per-caller typed facade over the async worker pool.
///
/// Each caller thread owns its own `CcClient` (they share the workers), so
/// request ids are unique per client and the pending map needs no lock.
pub struct CcClient {
    workers: Vec<Arc<WorkerHandle<AsyncTask>>>,
    next_worker: usize,
    next_req_id: u32,
    pending: HashMap<u32, SharedContext>,
}

impl CcClient {
    pub fn new(workers: Vec<Arc<WorkerHandle<AsyncTask>>>) -> Self {
        assert!(!workers.is_empty(), "need at least one async worker");
        Self {
            workers,
            next_worker: 0,
            next_req_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Lazily sweeps abandoned slots whose completion has landed.
    fn gc_abandoned(&mut self) {
        self.pending.retain(|_, ctx| {
            let guard = ctx.lock().unwrap();
            !(guard.abandoned && guard.done)
        });
    }

    /// Enqueues `task` on the next worker, yielding through backpressure,
    /// and registers the context under a fresh request id.
    fn submit(&mut self, ctx: SharedContext, task: AsyncTask) -> Result<u32, CcError> {
        self.gc_abandoned();
        let worker = &self.workers[self.next_worker % self.workers.len()];
        self.next_worker = self.next_worker.wrapping_add(1);

        let mut task = task;
        loop {
            match worker.enqueue(task) {
                Ok(()) => break,
                Err(PushError::Full(t)) => {
                    task = t;
                    thread::yield_now();
                }
                Err(PushError::Closed(_)) => return Err(CcError::Shutdown),
            }
        }

        self.next_req_id = self.next_req_id.wrapping_add(1);
        let req_id = self.next_req_id;
        self.pending.insert(req_id, ctx);
        Ok(req_id)
    }

    /// Chunk write: allocate on `server_id`, one-sided write, persist. The
    /// completed response carries the chunk's [`RTableHandle`].
    pub fn initiate_rtable_write_data_blocks(
        &mut self,
        server_id: ServerId,
        dbname: &str,
        file_number: u64,
        payload: Vec<u8>,
        is_meta_blocks: bool,
    ) -> Result<u32, CcError> {
        debug!(
            "write_data_blocks server={server_id} db={dbname} file={file_number} \
             len={} meta={is_meta_blocks}",
            payload.len()
        );
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::WriteDataBlocks,
            server_id,
        )));
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::WriteDataBlocks {
                server_id,
                dbname: dbname.to_string(),
                file_number,
                is_meta_blocks,
                payload,
                ctx,
            },
        )
    }

    /// One-sided read of `size` bytes at `offset` within the range behind
    /// `handle`. The completed response carries the bytes.
    pub fn initiate_rtable_read_data_block(
        &mut self,
        handle: &RTableHandle,
        offset: u64,
        size: u64,
    ) -> Result<u32, CcError> {
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::Read,
            handle.server_id,
        )));
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::Read {
                handle: *handle,
                offset,
                size,
                ctx,
            },
        )
    }

    /// Replicates a record batch to every replica. `states` must hold one
    /// entry per replica; replicas already at `WriteSuccess` (from an
    /// earlier partial attempt) are left alone. The request completes only
    /// when every replica reaches `WriteSuccess`.
    pub fn initiate_replicate_log_records(
        &mut self,
        log_file: &str,
        replicas: &[ServerId],
        records: Vec<LogRecord>,
        states: SharedStates,
    ) -> Result<u32, CcError> {
        let remaining = {
            let guard = states.lock().unwrap();
            if guard.len() != replicas.len() {
                return Err(CcError::BadReplicaStates);
            }
            guard
                .iter()
                .filter(|s| **s != WriteState::WriteSuccess)
                .count()
        };
        let first = replicas.first().copied().unwrap_or_default();
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::ReplicateLogRecords,
            first,
        )));
        ctx.lock().unwrap().pending_acks = remaining;
        if remaining == 0 {
            ctx.lock().unwrap().done = true;
        }
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::ReplicateLogRecords {
                log_file: log_file.to_string(),
                replicas: replicas.to_vec(),
                records,
                states,
                ctx,
            },
        )
    }

    /// Broadcasts DELETE_LOG_FILE to every replica and completes when all
    /// acks arrive.
    pub fn initiate_close_log_file(
        &mut self,
        log_file: &str,
        replicas: &[ServerId],
    ) -> Result<u32, CcError> {
        let first = replicas.first().copied().unwrap_or_default();
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::CloseLogFile,
            first,
        )));
        {
            let mut guard = ctx.lock().unwrap();
            guard.pending_acks = replicas.len();
            if replicas.is_empty() {
                guard.done = true;
            }
        }
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::CloseLogFile {
                log_file: log_file.to_string(),
                replicas: replicas.to_vec(),
                ctx,
            },
        )
    }

    /// Fire-and-forget reclaim of the regions behind deleted SSTables;
    /// completes at send completion so the manifest can sequence after it.
    pub fn initiate_delete_tables(
        &mut self,
        server_id: ServerId,
        tables: Vec<SSTableRTablePair>,
    ) -> Result<u32, CcError> {
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::DeleteTables,
            server_id,
        )));
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::DeleteTables {
                server_id,
                tables,
                ctx,
            },
        )
    }

    /// Queue depth and pending bytes of a StoC; informs placement.
    pub fn initiate_read_dc_stats(&mut self, server_id: ServerId) -> Result<u32, CcError> {
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::ReadDcStats,
            server_id,
        )));
        self.submit(Arc::clone(&ctx), AsyncTask::ReadDcStats { server_id, ctx })
    }

    /// Recovery: the StoC's `log_file → arena offset` map for a database.
    pub fn initiate_query_log_files(
        &mut self,
        server_id: ServerId,
        db_id: u32,
    ) -> Result<u32, CcError> {
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::QueryLogFiles,
            server_id,
        )));
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::QueryLogFiles {
                server_id,
                db_id,
                ctx,
            },
        )
    }

    /// One-sided read of a log arena segment (recovery replay).
    pub fn initiate_read_in_memory_log_file(
        &mut self,
        server_id: ServerId,
        remote_offset: u64,
        size: u64,
    ) -> Result<u32, CcError> {
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::ReadLogFile,
            server_id,
        )));
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::ReadLogFile {
                server_id,
                remote_offset,
                size,
                ctx,
            },
        )
    }

    /// Pushes the `filename → rtable_id` map so the StoC can collect
    /// regions no SSTable references.
    pub fn initiate_filename_rtable_mapping(
        &mut self,
        server_id: ServerId,
        mapping: Vec<(String, u32)>,
    ) -> Result<u32, CcError> {
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::FilenameRtableMapping,
            server_id,
        )));
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::FilenameRtableMapping {
                server_id,
                mapping,
                ctx,
            },
        )
    }

    /// Ships a compaction plan; the completed response carries the output
    /// file metadata with fresh handle lists.
    pub fn initiate_compaction(
        &mut self,
        server_id: ServerId,
        request: CompactionRequest,
    ) -> Result<u32, CcError> {
        let ctx = Arc::new(Mutex::new(RequestContext::new(
            RequestKind::Compaction,
            server_id,
        )));
        self.submit(
            Arc::clone(&ctx),
            AsyncTask::Compaction {
                server_id,
                request,
                ctx,
            },
        )
    }

    /// Polls a pending request.
    ///
    /// Returns `Ok(true)` once the request has completed — the results are
    /// moved into `response` (check [`CcResponse::failed`]) and the slot is
    /// freed. With `timeout: None` this is a single non-blocking check;
    /// otherwise it polls until the deadline and returns `Ok(false)` on
    /// timeout.
    pub fn is_done(
        &mut self,
        req_id: u32,
        response: &mut CcResponse,
        timeout: Option<Duration>,
    ) -> Result<bool, CcError> {
        let ctx = self
            .pending
            .get(&req_id)
            .cloned()
            .ok_or(CcError::UnknownRequest(req_id))?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let mut guard = ctx.lock().unwrap();
                if guard.done {
                    response.take_from(&mut guard);
                    drop(guard);
                    self.pending.remove(&req_id);
                    return Ok(true);
                }
            }
            match deadline {
                None => return Ok(false),
                Some(d) if Instant::now() >= d => return Ok(false),
                Some(_) => thread::yield_now(),
            }
        }
    }

    /// Blocks until the request completes and returns its response.
    pub fn wait(&mut self, req_id: u32) -> Result<CcResponse, CcError> {
        let mut response = CcResponse::default();
        loop {
            if self.is_done(req_id, &mut response, Some(Duration::from_millis(10)))? {
                return Ok(response);
            }
        }
    }

    /// Gives up on a request. The slot stays allocated until its completion
    /// arrives and is then swept lazily.
    pub fn abandon(&mut self, req_id: u32) {
        if let Some(ctx) = self.pending.get(&req_id) {
            ctx.lock().unwrap().abandoned = true;
        }
    }

    /// Number of requests issued and not yet collected.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}
