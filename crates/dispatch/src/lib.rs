//! # Dispatch — async RDMA worker runtime
//!
//! A fixed pool of async workers, each owning one set of queue-pair
//! endpoints (one per remote server), drives all fabric traffic:
//!
//! ```text
//! compute caller ──enqueue──▶ TaskQueue ──▶ AsyncWorker thread
//!                                            │  on_task: post verbs
//!                                            │  poll: completions
//!                                            ▼
//!                                        Processor (protocol engine)
//! ```
//!
//! The fabric itself hides behind [`RdmaStore`] — a byte-granular post/poll
//! primitive with immediate-data support. Production would back it with a
//! reliable-connection verbs binding; tests and the single-process CLI use
//! the in-memory loopback fabric from the `stoc` crate.
//!
//! ## Guarantees
//!
//! - Posts to one store retire in post order; nothing is promised across
//!   servers.
//! - The queue never blocks the caller: at capacity, `enqueue` rejects and
//!   the caller yields and retries.
//! - A completion with an error status is routed to the processor like any
//!   other; the owning request is marked failed there.

mod queue;
mod store;
mod worker;

pub use queue::{PushError, TaskQueue};
pub use store::{Completion, PostError, RdmaStore, ServerId, WcOpcode, WcStatus, WorkRequest};
pub use worker::{spawn_worker, Processor, WorkerHandle};
