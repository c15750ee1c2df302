//! The in-process loopback fabric.
//!
//! Implements the dispatcher's post/poll primitive against a set of
//! registered storage nodes: sends run synchronously through
//! `handle_message` (responses come back as Recv completions echoing the
//! request's immediate data), and one-sided reads/writes go straight into
//! region memory. Posts to one store retire in post order, which satisfies
//! the dispatcher's per-queue-pair ordering contract.
//!
//! Fault hooks let tests model the failure matrix: `fail_next_writes`
//! injects write completions with the remote-access status, `kill_server`
//! tears a queue pair down for good.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::error;

use dispatch::{Completion, PostError, RdmaStore, ServerId, WcOpcode, WcStatus, WorkRequest};

use crate::server::StocServer;

struct FabricInner {
    nodes: Mutex<HashMap<ServerId, Arc<StocServer>>>,
    write_faults: Mutex<HashMap<ServerId, u32>>,
    dead: Mutex<HashSet<ServerId>>,
}

/// A single-process fabric connecting async workers to storage nodes.
#[derive(Clone)]
pub struct MemFabric {
    inner: Arc<FabricInner>,
}

impl MemFabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner {
                nodes: Mutex::new(HashMap::new()),
                write_faults: Mutex::new(HashMap::new()),
                dead: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Attaches a storage node to the fabric.
    pub fn register(&self, node: Arc<StocServer>) {
        self.inner
            .nodes
            .lock()
            .unwrap()
            .insert(node.server_id(), node);
    }

    pub fn node(&self, server_id: ServerId) -> Option<Arc<StocServer>> {
        self.inner.nodes.lock().unwrap().get(&server_id).cloned()
    }

    /// The next `n` one-sided writes to `server_id` complete with the
    /// remote-access error status.
    pub fn fail_next_writes(&self, server_id: ServerId, n: u32) {
        self.inner
            .write_faults
            .lock()
            .unwrap()
            .insert(server_id, n);
    }

    /// Tears down every queue pair to `server_id`; posts to it fail from
    /// now on.
    pub fn kill_server(&self, server_id: ServerId) {
        self.inner.dead.lock().unwrap().insert(server_id);
    }

    /// Revives a previously killed server (restart modeling).
    pub fn revive_server(&self, server_id: ServerId) {
        self.inner.dead.lock().unwrap().remove(&server_id);
    }

    /// One async worker's endpoint set: its own completion queue over the
    /// shared node table.
    pub fn store_for_worker(&self) -> Arc<dyn RdmaStore> {
        Arc::new(FabricStore {
            fabric: Arc::clone(&self.inner),
            cq: Mutex::new(VecDeque::new()),
        })
    }
}

impl Default for MemFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// Backwards-compatible alias used by node wiring.
pub type StocNode = StocServer;

struct FabricStore {
    fabric: Arc<FabricInner>,
    cq: Mutex<VecDeque<Completion>>,
}

impl FabricStore {
    fn complete(&self, c: Completion) {
        self.cq.lock().unwrap().push_back(c);
    }

    fn take_write_fault(&self, server_id: ServerId) -> bool {
        let mut faults = self.fabric.write_faults.lock().unwrap();
        match faults.get_mut(&server_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl RdmaStore for FabricStore {
    fn post(&self, server_id: ServerId, wr_id: u64, wr: WorkRequest) -> Result<(), PostError> {
        if self.fabric.dead.lock().unwrap().contains(&server_id) {
            return Err(PostError::ServerDown(server_id));
        }
        let node = self
            .fabric
            .nodes
            .lock()
            .unwrap()
            .get(&server_id)
            .cloned()
            .ok_or(PostError::UnknownServer(server_id))?;

        match wr {
            WorkRequest::Send { payload, imm } => match node.handle_message(&payload) {
                Ok(reply) => {
                    self.complete(Completion {
                        wr_id,
                        server_id,
                        opcode: WcOpcode::Send,
                        status: WcStatus::Success,
                        bytes: Vec::new(),
                        imm: None,
                    });
                    if let Some(bytes) = reply {
                        self.complete(Completion {
                            wr_id: 0,
                            server_id,
                            opcode: WcOpcode::Recv,
                            status: WcStatus::Success,
                            bytes,
                            imm: Some(imm),
                        });
                    }
                }
                Err(e) => {
                    // Protocol violation on the storage side is fatal for
                    // this server's queue pair.
                    error!("server {server_id} rejected a request: {e:#}");
                    self.fabric.dead.lock().unwrap().insert(server_id);
                    self.complete(Completion {
                        wr_id,
                        server_id,
                        opcode: WcOpcode::Send,
                        status: WcStatus::Transport,
                        bytes: Vec::new(),
                        imm: None,
                    });
                }
            },
            WorkRequest::Write {
                rtable_id,
                offset,
                payload,
            } => {
                let status = if self.take_write_fault(server_id) {
                    WcStatus::RemoteAccess
                } else {
                    match node.write_mem(rtable_id, offset, &payload) {
                        Ok(()) => WcStatus::Success,
                        Err(_) => WcStatus::RemoteAccess,
                    }
                };
                self.complete(Completion {
                    wr_id,
                    server_id,
                    opcode: WcOpcode::RdmaWrite,
                    status,
                    bytes: Vec::new(),
                    imm: None,
                });
            }
            WorkRequest::Read {
                rtable_id,
                offset,
                size,
            } => {
                let (status, bytes) = match node.read_mem(rtable_id, offset, size) {
                    Ok(bytes) => (WcStatus::Success, bytes),
                    Err(_) => (WcStatus::RemoteAccess, Vec::new()),
                };
                self.complete(Completion {
                    wr_id,
                    server_id,
                    opcode: WcOpcode::RdmaRead,
                    status,
                    bytes,
                    imm: None,
                });
            }
        }
        Ok(())
    }

    fn poll(&self, out: &mut Vec<Completion>) -> usize {
        let mut cq = self.cq.lock().unwrap();
        let n = cq.len();
        out.extend(cq.drain(..));
        n
    }
}
