//! Bounded MPSC task queue with condvar wakeup.
//!
//! Connection workers hand tasks to an async worker through this queue. The
//! queue applies backpressure by rejecting pushes at capacity — the caller
//! yields and retries rather than blocking inside the dispatcher.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Outcome of a rejected [`TaskQueue::push`]; the task is handed back.
#[derive(Debug)]
pub enum PushError<T> {
    /// The queue is at capacity. Yield and retry.
    Full(T),
    /// The queue was closed for shutdown.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recovers the rejected task.
    pub fn into_task(self) -> T {
        match self {
            PushError::Full(t) | PushError::Closed(t) => t,
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer queue drained by a single async worker.
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues a task, waking the worker. Rejects at capacity or after
    /// close.
    pub fn push(&self, task: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(PushError::Closed(task));
        }
        if inner.items.len() >= self.capacity {
            return Err(PushError::Full(task));
        }
        inner.items.push_back(task);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Moves every queued task into `out`, waiting up to `wait` when the
    /// queue is empty. Returns the number of tasks taken.
    pub fn drain(&self, out: &mut Vec<T>, wait: Duration) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.is_empty() && !inner.closed {
            let (guard, _timeout) = self
                .available
                .wait_timeout(inner, wait)
                .expect("task queue lock poisoned");
            inner = guard;
        }
        let n = inner.items.len();
        out.extend(inner.items.drain(..));
        n
    }

    /// Marks the queue closed; subsequent pushes fail, the worker drains
    /// what remains and exits.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
