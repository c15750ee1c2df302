//! # Client — the compute node's typed fabric facade
//!
//! Every remote operation a compute node performs — chunked SSTable writes,
//! random-access block reads, log replication, table deletion, statistics,
//! recovery queries and remote compaction — goes through [`CcClient`]:
//!
//! ```text
//! table writer / reader / log path / compactor
//!        │ initiate_*            ▲ is_done(req_id)
//!        ▼                       │
//!    CcClient ── AsyncTask ──▶ async worker ──▶ CcProtocol state machines
//!                                   │  post/poll
//!                                   ▼
//!                               RdmaStore (fabric)
//! ```
//!
//! `initiate_*` enqueues a typed task on a round-robin async worker and
//! returns a request id; the caller later polls [`CcClient::is_done`], which
//! moves the results out of the shared [`RequestContext`] once the protocol
//! engine marks it done. Between those two points the context is owned by
//! the caller; the engine writes only the done/failed flags and the result
//! fields.

mod context;
mod facade;
mod protocol;
mod task;

pub use context::{
    CcResponse, RequestContext, RequestKind, SharedContext, SharedStates, WriteState,
};
pub use facade::{spawn_async_workers, CcClient};
pub use protocol::CcProtocol;
pub use task::AsyncTask;

use thiserror::Error;

/// Errors surfaced by the facade itself. Failures of the remote operation
/// are reported through [`CcResponse::failed`], not through this type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CcError {
    /// The async workers have been shut down.
    #[error("async workers are shut down")]
    Shutdown,

    /// The request id is not pending on this client (never issued, already
    /// collected, or collected after abandonment).
    #[error("unknown request id {0}")]
    UnknownRequest(u32),

    /// Replica list and state array sizes must match.
    #[error("replica state array has wrong length")]
    BadReplicaStates,
}

#[cfg(test)]
mod tests;
