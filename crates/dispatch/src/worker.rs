//! The async worker thread: drain tasks, post verbs, route completions.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::queue::{PushError, TaskQueue};
use crate::store::{Completion, RdmaStore};

/// The protocol engine plugged into an async worker.
///
/// `on_task` posts the initial verbs for a typed request; `on_completion`
/// advances the request's state machine. Both run on the worker thread, so
/// implementations need no internal locking for their slot tables.
pub trait Processor: Send + 'static {
    type Task: Send + 'static;

    fn on_task(&mut self, task: Self::Task, store: &dyn RdmaStore);

    fn on_completion(&mut self, completion: Completion, store: &dyn RdmaStore);

    /// Requests posted but not yet retired; the worker polls eagerly while
    /// this is non-zero and parks briefly otherwise.
    fn in_flight(&self) -> usize;
}

/// Handle to a running async worker. Dropping the handle shuts the worker
/// down (close queue, drain, join).
pub struct WorkerHandle<T> {
    id: usize,
    queue: Arc<TaskQueue<T>>,
    join: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Hands a task to the worker. `Err(Full)` is backpressure: yield and
    /// retry.
    pub fn enqueue(&self, task: T) -> Result<(), PushError<T>> {
        self.queue.push(task)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Closes the queue and joins the worker thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.queue.close();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawns one async worker owning `store` and feeding `processor`.
///
/// The loop interleaves queue draining with completion polling: while
/// requests are in flight it spins with a short drain timeout, otherwise it
/// parks on the queue condvar. Shutdown: once the queue is closed, the
/// worker finishes the remaining tasks and in-flight completions, then
/// exits.
pub fn spawn_worker<P: Processor>(
    id: usize,
    mut processor: P,
    store: Arc<dyn RdmaStore>,
    queue_capacity: usize,
) -> WorkerHandle<P::Task> {
    let queue = Arc::new(TaskQueue::new(queue_capacity));
    let worker_queue = Arc::clone(&queue);

    let join = thread::Builder::new()
        .name(format!("drift-async-{id}"))
        .spawn(move || {
            let mut tasks: Vec<P::Task> = Vec::new();
            let mut completions: Vec<Completion> = Vec::new();
            loop {
                let wait = if processor.in_flight() > 0 {
                    Duration::from_micros(100)
                } else {
                    Duration::from_millis(1)
                };
                tasks.clear();
                let drained = worker_queue.drain(&mut tasks, wait);
                for task in tasks.drain(..) {
                    processor.on_task(task, store.as_ref());
                }

                completions.clear();
                let polled = store.poll(&mut completions);
                for c in completions.drain(..) {
                    debug!(
                        "worker {id}: completion wr_id={} opcode={:?} status={:?}",
                        c.wr_id, c.opcode, c.status
                    );
                    processor.on_completion(c, store.as_ref());
                }

                if worker_queue.is_closed()
                    && drained == 0
                    && polled == 0
                    && worker_queue.is_empty()
                    && processor.in_flight() == 0
                {
                    break;
                }
            }
            debug!("worker {id}: shut down");
        })
        .expect("failed to spawn async worker thread");

    WorkerHandle {
        id,
        queue,
        join: Some(join),
    }
}
