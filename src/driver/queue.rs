//! Cross-thread request queues.
//!
//! Two instances exist: the engine queue (guest-facing side into the poll
//! thread) and the receive queue (poll thread into the receive thread).
//! FIFO within a queue, nothing guaranteed across queues. Consumers drain
//! without blocking; producers fail fast once the consumer is shutting
//! down and the queue has been closed.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Mutex;

use crate::error::NatError;

struct Inner<T> {
    jobs: VecDeque<T>,
    closed: bool,
}

pub(crate) struct ReqQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> ReqQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Enqueue a job. Returns the job to the caller when the queue has
    /// been closed, so ownership (and cleanup) stays with the producer.
    pub fn push(&self, job: T) -> Result<(), T> {
        let mut inner = self.inner.lock().expect("request queue mutex poisoned");
        if inner.closed {
            return Err(job);
        }
        inner.jobs.push_back(job);
        Ok(())
    }

    /// Take every currently queued job, without blocking.
    pub fn drain(&self) -> VecDeque<T> {
        let mut inner = self.inner.lock().expect("request queue mutex poisoned");
        std::mem::take(&mut inner.jobs)
    }

    /// Refuse further jobs. Already queued jobs remain drainable.
    pub fn close(&self) {
        self.inner
            .lock()
            .expect("request queue mutex poisoned")
            .closed = true;
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("request queue mutex poisoned")
            .jobs
            .len()
    }
}

/// Completion handle pair for trampolined calls that need a status back.
pub(crate) fn reply_pair() -> (ReplyTx, ReplyRx) {
    let (tx, rx) = mpsc::sync_channel(1);
    (ReplyTx { tx }, ReplyRx { rx })
}

pub(crate) struct ReplyTx {
    tx: mpsc::SyncSender<Result<(), NatError>>,
}

impl ReplyTx {
    pub fn complete(self, status: Result<(), NatError>) {
        let _ = self.tx.send(status);
    }
}

pub(crate) struct ReplyRx {
    rx: mpsc::Receiver<Result<(), NatError>>,
}

impl ReplyRx {
    /// Block until the consumer completes the job. A job dropped during
    /// shutdown reads as an interrupted wait.
    pub fn wait(self) -> Result<(), NatError> {
        self.rx.recv().unwrap_or(Err(NatError::Interrupted))
    }
}
