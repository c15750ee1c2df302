//! The per-worker protocol engine: typed request state machines driven by
//! fabric completions.
//!
//! One `CcProtocol` runs inside each async worker. It owns the in-flight
//! slot table (keyed by `wr_id`), the cached log-buffer leases, and the set
//! of servers whose queue pairs have been torn down. All methods run on the
//! worker thread; the only shared state it touches are the request contexts
//! and replica state arrays, which it mutates under their own locks.

use std::collections::{HashMap, HashSet};

use log::{debug, error, warn};

use dispatch::{Completion, Processor, RdmaStore, ServerId, WcOpcode, WcStatus, WorkRequest};
use wire::{Message, RTableHandle, LOG_ARENA_RTABLE_ID};

use crate::context::{SharedContext, SharedStates, WriteState};
use crate::task::AsyncTask;

/// A reserved slot in a replica's log buffer. `written` is the cursor of
/// bytes already handed to one-sided writes.
struct LogLease {
    offset: u64,
    size: u64,
    written: u64,
}

/// What an in-flight `wr_id` is waiting for.
enum Op {
    /// One-sided block read.
    Read,
    /// One-sided log segment read.
    ReadLogFile,
    /// Waiting for ALLOCATE_SSTABLE_BUFFER_SUCC; the chunk bytes ride along.
    SstAlloc { payload: Vec<u8>, is_meta: bool },
    /// Waiting for the one-sided chunk write to retire.
    SstWrite {
        handle: RTableHandle,
        is_meta: bool,
    },
    /// Waiting for RTABLE_PERSIST_RESPONSE; completion fills the context
    /// with the chunk's allocated handle.
    SstFlush { handle: RTableHandle },
    /// Waiting for ALLOCATE_LOG_BUFFER_SUCC for one replica.
    LogAlloc {
        replica: usize,
        log_file: String,
        batch: Vec<u8>,
        states: SharedStates,
    },
    /// Waiting for one replica's record write to retire.
    LogWrite {
        replica: usize,
        log_file: String,
        states: SharedStates,
    },
    /// Waiting for one replica's DELETE_LOG_FILE_SUCC.
    CloseLog,
    /// Done at send completion.
    DeleteTables,
    DcStats,
    QueryLogFiles,
    FnMapping,
    Compaction,
}

struct InFlight {
    ctx: SharedContext,
    server_id: ServerId,
    op: Op,
}

/// The protocol engine plugged into one async worker.
pub struct CcProtocol {
    worker_id: usize,
    next_wr_id: u64,
    slots: HashMap<u64, InFlight>,
    leases: HashMap<(ServerId, String), LogLease>,
    /// Servers whose queue pair is gone; posts to them fail immediately.
    broken: HashSet<ServerId>,
    /// Default log buffer reservation per (replica, log file).
    log_buf_size: u64,
}

fn set_state(states: &SharedStates, replica: usize, state: WriteState) {
    let mut guard = states.lock().unwrap();
    if let Some(slot) = guard.get_mut(replica) {
        *slot = state;
    }
}

fn mark_failed(ctx: &SharedContext) {
    let mut guard = ctx.lock().unwrap();
    guard.failed = true;
    guard.done = true;
}

impl CcProtocol {
    pub fn new(worker_id: usize, log_buf_size: u64) -> Self {
        Self {
            worker_id,
            next_wr_id: 0,
            slots: HashMap::new(),
            leases: HashMap::new(),
            broken: HashSet::new(),
            log_buf_size: log_buf_size.max(1),
        }
    }

    /// Allocates the next work-request id. Ids stay within `u32` range so
    /// they can travel as immediate data and be matched on the way back.
    fn alloc_wr_id(&mut self) -> u64 {
        self.next_wr_id += 1;
        if self.next_wr_id > u64::from(u32::MAX) {
            self.next_wr_id = 1;
        }
        self.next_wr_id
    }

    /// Posts `wr`, registering the slot. On a post failure the request is
    /// failed on the spot.
    fn post_tracked(
        &mut self,
        store: &dyn RdmaStore,
        server_id: ServerId,
        wr: WorkRequest,
        ctx: SharedContext,
        op: Op,
    ) {
        if self.broken.contains(&server_id) {
            self.fail_op(&ctx, &op);
            return;
        }
        let wr_id = self.alloc_wr_id();
        if let Err(e) = store.post(server_id, wr_id, wr) {
            warn!(
                "worker {}: post to server {server_id} failed: {e}",
                self.worker_id
            );
            self.fail_op(&ctx, &op);
            return;
        }
        self.slots.insert(
            wr_id,
            InFlight {
                ctx,
                server_id,
                op,
            },
        );
    }

    fn post_message(
        &mut self,
        store: &dyn RdmaStore,
        server_id: ServerId,
        msg: &Message,
        ctx: SharedContext,
        op: Op,
    ) {
        if self.broken.contains(&server_id) {
            self.fail_op(&ctx, &op);
            return;
        }
        let wr_id = self.alloc_wr_id();
        let wr = WorkRequest::Send {
            payload: msg.encode(),
            imm: wr_id as u32,
        };
        if let Err(e) = store.post(server_id, wr_id, wr) {
            warn!(
                "worker {}: send to server {server_id} failed: {e}",
                self.worker_id
            );
            self.fail_op(&ctx, &op);
            return;
        }
        self.slots.insert(
            wr_id,
            InFlight {
                ctx,
                server_id,
                op,
            },
        );
    }

    /// Failure policy per operation kind: replicate sub-operations revert
    /// the replica and leave the call incomplete (the caller re-drives only
    /// the failed replicas); everything else completes with the failure
    /// flag set.
    fn fail_op(&mut self, ctx: &SharedContext, op: &Op) {
        match op {
            Op::LogAlloc {
                replica, states, ..
            }
            | Op::LogWrite {
                replica, states, ..
            } => {
                set_state(states, *replica, WriteState::None);
                ctx.lock().unwrap().failed = true;
            }
            _ => mark_failed(ctx),
        }
    }

    /// Queue-pair teardown for `server_id`: every pending request to it
    /// fails, and future posts are rejected locally.
    fn tear_down_server(&mut self, server_id: ServerId) {
        if !self.broken.insert(server_id) {
            return;
        }
        error!(
            "worker {}: tearing down queue pair to server {server_id}",
            self.worker_id
        );
        let dead: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, s)| s.server_id == server_id)
            .map(|(id, _)| *id)
            .collect();
        for wr_id in dead {
            if let Some(slot) = self.slots.remove(&wr_id) {
                mark_failed(&slot.ctx);
            }
        }
        self.leases.retain(|(sid, _), _| *sid != server_id);
    }

    /// Advances one replica of a replicate call: reuse a cached lease when
    /// the batch fits, otherwise allocate a fresh buffer first.
    fn drive_replica(
        &mut self,
        store: &dyn RdmaStore,
        server_id: ServerId,
        replica: usize,
        log_file: &str,
        batch: &[u8],
        states: &SharedStates,
        ctx: &SharedContext,
    ) {
        let need = batch.len() as u64;
        let key = (server_id, log_file.to_string());
        let mut reserved = None;
        let mut exhausted = false;
        if let Some(lease) = self.leases.get_mut(&key) {
            if lease.size - lease.written >= need {
                let at = lease.offset + lease.written;
                lease.written += need;
                reserved = Some(at);
            } else {
                exhausted = true;
            }
        }
        if exhausted {
            // Exhausted lease; allocate a fresh buffer below.
            self.leases.remove(&key);
        }
        if let Some(at) = reserved {
            set_state(states, replica, WriteState::WaitForWrite);
            self.post_tracked(
                store,
                server_id,
                WorkRequest::Write {
                    rtable_id: LOG_ARENA_RTABLE_ID,
                    offset: at,
                    payload: batch.to_vec(),
                },
                SharedContext::clone(ctx),
                Op::LogWrite {
                    replica,
                    log_file: log_file.to_string(),
                    states: SharedStates::clone(states),
                },
            );
            return;
        }
        set_state(states, replica, WriteState::WaitForAlloc);
        let msg = Message::AllocateLogBuffer {
            log_file: log_file.to_string(),
            size: self.log_buf_size.max(need),
        };
        self.post_message(
            store,
            server_id,
            &msg,
            SharedContext::clone(ctx),
            Op::LogAlloc {
                replica,
                log_file: log_file.to_string(),
                batch: batch.to_vec(),
                states: SharedStates::clone(states),
            },
        );
    }

    /// Routes one decoded response into the slot identified by the echoed
    /// immediate data. Returns `true` when the completion was consumed;
    /// `generate_new` asks the store to post a replacement receive.
    pub fn on_recv(
        &mut self,
        store: &dyn RdmaStore,
        server_id: ServerId,
        buf: &[u8],
        imm: Option<u32>,
        generate_new: &mut bool,
    ) -> bool {
        *generate_new = true;
        let msg = match Message::decode(buf) {
            Ok(m) => m,
            Err(e) => {
                error!(
                    "worker {}: protocol violation from server {server_id}: {e}",
                    self.worker_id
                );
                self.tear_down_server(server_id);
                return false;
            }
        };
        let wr_id = match imm {
            Some(imm) => u64::from(imm),
            None => {
                error!(
                    "worker {}: response without immediate data from server {server_id}",
                    self.worker_id
                );
                self.tear_down_server(server_id);
                return false;
            }
        };
        let slot = match self.slots.remove(&wr_id) {
            Some(s) => s,
            None => {
                debug!(
                    "worker {}: completion for abandoned wr_id {wr_id}",
                    self.worker_id
                );
                return false;
            }
        };

        match (msg, slot.op) {
            (
                Message::AllocateSstableBufferSucc { handle },
                Op::SstAlloc { payload, is_meta },
            ) => {
                if handle.is_null() {
                    // The StoC is out of space; retryable for the caller.
                    mark_failed(&slot.ctx);
                } else {
                    self.post_tracked(
                        store,
                        server_id,
                        WorkRequest::Write {
                            rtable_id: handle.rtable_id,
                            offset: handle.offset,
                            payload,
                        },
                        slot.ctx,
                        Op::SstWrite { handle, is_meta },
                    );
                }
            }
            (Message::RtablePersistResponse { .. }, Op::SstFlush { handle }) => {
                // The response covers the whole persisted region; the
                // chunk's own handle came from the allocation.
                let mut ctx = slot.ctx.lock().unwrap();
                ctx.handle = Some(handle);
                ctx.done = true;
            }
            (Message::AllocateLogBufferSucc { offset, size }, Op::LogAlloc {
                replica,
                log_file,
                batch,
                states,
            }) => {
                if size == 0 {
                    // Allocation failure; the replica reverts and the call
                    // stays incomplete for a retry after backoff.
                    set_state(&states, replica, WriteState::None);
                    slot.ctx.lock().unwrap().failed = true;
                } else {
                    set_state(&states, replica, WriteState::AllocSuccess);
                    let need = batch.len() as u64;
                    self.leases.insert(
                        (server_id, log_file.clone()),
                        LogLease {
                            offset,
                            size,
                            written: need,
                        },
                    );
                    set_state(&states, replica, WriteState::WaitForWrite);
                    self.post_tracked(
                        store,
                        server_id,
                        WorkRequest::Write {
                            rtable_id: LOG_ARENA_RTABLE_ID,
                            offset,
                            payload: batch,
                        },
                        slot.ctx,
                        Op::LogWrite {
                            replica,
                            log_file,
                            states,
                        },
                    );
                }
            }
            (Message::DeleteLogFileSucc { .. }, Op::CloseLog) => {
                let mut ctx = slot.ctx.lock().unwrap();
                ctx.pending_acks = ctx.pending_acks.saturating_sub(1);
                if ctx.pending_acks == 0 {
                    ctx.done = true;
                }
            }
            (Message::DcReadStatsResponse { stats }, Op::DcStats) => {
                let mut ctx = slot.ctx.lock().unwrap();
                ctx.stats = Some(stats);
                ctx.done = true;
            }
            (Message::QueryLogFilesResponse { offsets }, Op::QueryLogFiles) => {
                let mut ctx = slot.ctx.lock().unwrap();
                ctx.log_offsets = offsets;
                ctx.done = true;
            }
            (Message::FilenameRtableIdResponse, Op::FnMapping) => {
                slot.ctx.lock().unwrap().done = true;
            }
            (Message::CompactionResponse { outputs }, Op::Compaction) => {
                let mut ctx = slot.ctx.lock().unwrap();
                ctx.outputs = outputs;
                ctx.done = true;
            }
            (other, op) => {
                error!(
                    "worker {}: response {:?} does not match pending request",
                    self.worker_id,
                    other.msg_type()
                );
                self.fail_op(&slot.ctx, &op);
                self.tear_down_server(server_id);
            }
        }
        true
    }
}

impl Processor for CcProtocol {
    type Task = AsyncTask;

    fn on_task(&mut self, task: AsyncTask, store: &dyn RdmaStore) {
        match task {
            AsyncTask::Read {
                handle,
                offset,
                size,
                ctx,
            } => {
                self.post_tracked(
                    store,
                    handle.server_id,
                    WorkRequest::Read {
                        rtable_id: handle.rtable_id,
                        offset: handle.offset + offset,
                        size,
                    },
                    ctx,
                    Op::Read,
                );
            }
            AsyncTask::WriteDataBlocks {
                server_id,
                dbname,
                file_number,
                is_meta_blocks,
                payload,
                ctx,
            } => {
                let msg = Message::AllocateSstableBuffer {
                    dbname,
                    file_number,
                    size: payload.len() as u64,
                    is_meta: is_meta_blocks,
                };
                self.post_message(
                    store,
                    server_id,
                    &msg,
                    ctx,
                    Op::SstAlloc {
                        payload,
                        is_meta: is_meta_blocks,
                    },
                );
            }
            AsyncTask::ReplicateLogRecords {
                log_file,
                replicas,
                records,
                states,
                ctx,
            } => {
                let batch = Message::ReplicateLogRecords {
                    log_file: log_file.clone(),
                    records,
                }
                .encode();
                for (replica, server_id) in replicas.iter().enumerate() {
                    // Replicas already at WRITE_SUCCESS from an earlier
                    // attempt are not re-driven.
                    let already = {
                        let guard = states.lock().unwrap();
                        guard.get(replica) == Some(&WriteState::WriteSuccess)
                    };
                    if already {
                        continue;
                    }
                    self.drive_replica(
                        store, *server_id, replica, &log_file, &batch, &states, &ctx,
                    );
                }
            }
            AsyncTask::CloseLogFile {
                log_file,
                replicas,
                ctx,
            } => {
                for server_id in replicas {
                    self.leases.remove(&(server_id, log_file.clone()));
                    let msg = Message::DeleteLogFile {
                        log_file: log_file.clone(),
                    };
                    self.post_message(
                        store,
                        server_id,
                        &msg,
                        SharedContext::clone(&ctx),
                        Op::CloseLog,
                    );
                }
            }
            AsyncTask::DeleteTables {
                server_id,
                tables,
                ctx,
            } => {
                let msg = Message::DeleteTables { tables };
                self.post_message(store, server_id, &msg, ctx, Op::DeleteTables);
            }
            AsyncTask::ReadDcStats { server_id, ctx } => {
                self.post_message(store, server_id, &Message::DcReadStats, ctx, Op::DcStats);
            }
            AsyncTask::QueryLogFiles {
                server_id,
                db_id,
                ctx,
            } => {
                let msg = Message::QueryLogFiles { db_id };
                self.post_message(store, server_id, &msg, ctx, Op::QueryLogFiles);
            }
            AsyncTask::ReadLogFile {
                server_id,
                remote_offset,
                size,
                ctx,
            } => {
                self.post_tracked(
                    store,
                    server_id,
                    WorkRequest::Read {
                        rtable_id: LOG_ARENA_RTABLE_ID,
                        offset: remote_offset,
                        size,
                    },
                    ctx,
                    Op::ReadLogFile,
                );
            }
            AsyncTask::FilenameRtableMapping {
                server_id,
                mapping,
                ctx,
            } => {
                let msg = Message::FilenameRtableId { mapping };
                self.post_message(store, server_id, &msg, ctx, Op::FnMapping);
            }
            AsyncTask::Compaction {
                server_id,
                request,
                ctx,
            } => {
                let msg = Message::Compaction { request };
                self.post_message(store, server_id, &msg, ctx, Op::Compaction);
            }
        }
    }

    fn on_completion(&mut self, c: Completion, store: &dyn RdmaStore) {
        if c.status == WcStatus::Transport {
            self.tear_down_server(c.server_id);
            if c.opcode != WcOpcode::Recv {
                if let Some(slot) = self.slots.remove(&c.wr_id) {
                    self.fail_op(&slot.ctx, &slot.op);
                }
            }
            return;
        }
        match c.opcode {
            WcOpcode::Send => {
                if !c.status.is_ok() {
                    if let Some(slot) = self.slots.remove(&c.wr_id) {
                        self.fail_op(&slot.ctx, &slot.op);
                    }
                    return;
                }
                // Fire-and-forget kinds complete at send completion; every
                // other slot stays put until its response arrives.
                let finish = matches!(
                    self.slots.get(&c.wr_id),
                    Some(InFlight {
                        op: Op::DeleteTables,
                        ..
                    })
                );
                if finish {
                    if let Some(slot) = self.slots.remove(&c.wr_id) {
                        slot.ctx.lock().unwrap().done = true;
                    }
                }
            }
            WcOpcode::RdmaRead => {
                let slot = match self.slots.remove(&c.wr_id) {
                    Some(s) => s,
                    None => return,
                };
                let mut ctx = slot.ctx.lock().unwrap();
                if c.status.is_ok() {
                    ctx.bytes = Some(c.bytes);
                } else {
                    // RemoteAccess: the region is gone.
                    ctx.failed = true;
                }
                ctx.done = true;
            }
            WcOpcode::RdmaWrite => {
                let slot = match self.slots.remove(&c.wr_id) {
                    Some(s) => s,
                    None => return,
                };
                match slot.op {
                    Op::SstWrite { handle, is_meta } => {
                        if c.status.is_ok() {
                            let msg = Message::FlushSstableBuf {
                                rtable_id: handle.rtable_id,
                                persist: is_meta,
                            };
                            self.post_message(
                                store,
                                slot.server_id,
                                &msg,
                                slot.ctx,
                                Op::SstFlush { handle },
                            );
                        } else {
                            // Return the never-flushed buffer and report
                            // the failure; the caller retries the chunk.
                            let release = Message::ReleaseSstableBuffer {
                                rtable_id: handle.rtable_id,
                            };
                            let wr_id = self.alloc_wr_id();
                            let _ = store.post(
                                slot.server_id,
                                wr_id,
                                WorkRequest::Send {
                                    payload: release.encode(),
                                    imm: wr_id as u32,
                                },
                            );
                            mark_failed(&slot.ctx);
                        }
                    }
                    Op::LogWrite {
                        replica,
                        log_file,
                        states,
                    } => {
                        if c.status.is_ok() {
                            set_state(&states, replica, WriteState::WriteSuccess);
                            let mut ctx = slot.ctx.lock().unwrap();
                            ctx.pending_acks = ctx.pending_acks.saturating_sub(1);
                            if ctx.pending_acks == 0 {
                                ctx.done = true;
                            }
                        } else {
                            set_state(&states, replica, WriteState::None);
                            self.leases.remove(&(slot.server_id, log_file));
                            slot.ctx.lock().unwrap().failed = true;
                        }
                    }
                    other => {
                        error!(
                            "worker {}: unexpected write completion for wr_id {}",
                            self.worker_id, c.wr_id
                        );
                        self.fail_op(&slot.ctx, &other);
                    }
                }
            }
            WcOpcode::Recv => {
                let mut generate_new = false;
                self.on_recv(store, c.server_id, &c.bytes, c.imm, &mut generate_new);
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.slots.len()
    }
}
