use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("work queue disconnected")]
pub struct QueueClosed;

/// Bounded multi-producer/multi-consumer handoff between pipeline stages.
///
/// `push` blocks while the queue is full, `pop` while it is empty; that is the
/// pipeline's backpressure. Termination is by sentinel: exactly one
/// `push_sentinel` per consumer expected to exit, and a consumer that pops
/// `None` must stop popping.
pub struct WorkQueue<T> {
    tx: Sender<Option<T>>,
    rx: Receiver<Option<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send> WorkQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    pub fn push(&self, item: T) -> Result<(), QueueClosed> {
        self.tx.send(Some(item)).map_err(|_| QueueClosed)
    }

    pub fn push_sentinel(&self) -> Result<(), QueueClosed> {
        self.tx.send(None).map_err(|_| QueueClosed)
    }

    /// Blocks for the next entry; `None` is the termination sentinel.
    pub fn pop(&self) -> Result<Option<T>, QueueClosed> {
        self.rx.recv().map_err(|_| QueueClosed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
