//! The post/poll primitive: work requests, completions, and the store trait.

use thiserror::Error;

/// Identity of a node on the fabric. StoC ids follow the LTC ids in the
/// global server list.
pub type ServerId = u32;

/// One RDMA verb to post.
#[derive(Debug, Clone)]
pub enum WorkRequest {
    /// Two-sided SEND. `imm` is delivered with the remote completion and is
    /// echoed back on the response, carrying the request id.
    Send { payload: Vec<u8>, imm: u32 },
    /// One-sided READ of `[offset, offset + size)` within a remote region.
    Read {
        rtable_id: u32,
        offset: u64,
        size: u64,
    },
    /// One-sided WRITE into a remote region.
    Write {
        rtable_id: u32,
        offset: u64,
        payload: Vec<u8>,
    },
}

/// Opcode of a polled completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// A posted SEND retired.
    Send,
    /// A posted one-sided WRITE retired.
    RdmaWrite,
    /// A posted one-sided READ retired; the bytes are in the completion.
    RdmaRead,
    /// An inbound message arrived; the payload and immediate data are in
    /// the completion.
    Recv,
}

/// Status of a polled completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    #[error("success")]
    Success,
    /// The remote region is gone (deleted or never allocated).
    #[error("remote access error")]
    RemoteAccess,
    /// The transport to the server failed; the queue pair is dead.
    #[error("transport error")]
    Transport,
}

impl WcStatus {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == WcStatus::Success
    }
}

/// A completion queue entry.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Work-request id for Send/Read/Write completions; 0 for Recv.
    pub wr_id: u64,
    /// The remote server this completion concerns.
    pub server_id: ServerId,
    pub opcode: WcOpcode,
    pub status: WcStatus,
    /// Read results or inbound message bytes.
    pub bytes: Vec<u8>,
    /// Immediate data delivered with a Recv.
    pub imm: Option<u32>,
}

/// Errors from posting a work request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PostError {
    #[error("unknown server {0}")]
    UnknownServer(ServerId),
    /// The queue pair to this server has been torn down; every pending
    /// request to it fails and new posts are rejected.
    #[error("queue pair to server {0} is down")]
    ServerDown(ServerId),
    #[error("send queue full")]
    SendQueueFull,
}

/// One worker's set of reliable-connection endpoints.
///
/// Implementations must retire posts to a given server in post order and
/// deliver completions through [`poll`](RdmaStore::poll) on the posting
/// worker's store only.
pub trait RdmaStore: Send + Sync {
    fn post(&self, server_id: ServerId, wr_id: u64, wr: WorkRequest) -> Result<(), PostError>;

    /// Drains available completions into `out`, returning how many were
    /// appended. Never blocks.
    fn poll(&self, out: &mut Vec<Completion>) -> usize;
}
