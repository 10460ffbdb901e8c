use crate::backend::{BackendError, ObjectStore, Transaction, TxnMode};
use crate::replication::Usn;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum WriteQueueError {
    #[error("timed out after {timeout:?} waiting to reach the write queue head (usn {usn:?})")]
    Timeout { usn: Usn, timeout: Duration },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// WriteQueue is the only way to open a write transaction on the object store.
///
/// Every writer is handed the next USN while holding the queue lock, then blocks until it is at the
/// head of the queue before beginning its transaction. Transactions therefore commit in the same
/// order USNs were handed out.
pub struct WriteQueue {
    logger: slog::Logger,
    store: Arc<dyn ObjectStore>,
    pending: Mutex<VecDeque<Usn>>,
    head_changed: Condvar,
    wait_timeout: Duration,
}

impl WriteQueue {
    pub fn new(logger: slog::Logger, store: Arc<dyn ObjectStore>, wait_timeout: Duration) -> Self {
        WriteQueue {
            logger,
            store,
            pending: Mutex::new(VecDeque::new()),
            head_changed: Condvar::new(),
            wait_timeout,
        }
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn read(&self) -> Result<Box<dyn Transaction + '_>, BackendError> {
        self.store.txn_begin(TxnMode::Read)
    }

    /// Take a USN and a place in line. The ticket leaves the queue when dropped.
    pub fn enqueue(&self) -> Result<WriteTicket<'_>, WriteQueueError> {
        let mut pending = self.pending.lock();
        let usn = self.store.next_usn()?;
        pending.push_back(usn);

        Ok(WriteTicket { queue: self, usn })
    }

    /// Enqueue, wait for the head of the queue, then begin the write transaction.
    pub fn begin_write(&self) -> Result<QueuedWrite<'_>, WriteQueueError> {
        self.enqueue()?.begin()
    }

    fn wait_for_head(&self, usn: Usn) -> Result<(), WriteQueueError> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut pending = self.pending.lock();
        while pending.front() != Some(&usn) {
            if self.head_changed.wait_until(&mut pending, deadline).timed_out() && pending.front() != Some(&usn) {
                slog::warn!(
                    self.logger,
                    "Write queue wait timed out for usn {:?}, head is {:?}",
                    usn,
                    pending.front()
                );
                return Err(WriteQueueError::Timeout {
                    usn,
                    timeout: self.wait_timeout,
                });
            }
        }

        Ok(())
    }

    fn remove(&self, usn: Usn) {
        let mut pending = self.pending.lock();
        if let Some(position) = pending.iter().position(|u| *u == usn) {
            pending.remove(position);
        }
        self.head_changed.notify_all();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

pub struct WriteTicket<'a> {
    queue: &'a WriteQueue,
    usn: Usn,
}

impl<'a> WriteTicket<'a> {
    pub fn usn(&self) -> Usn {
        self.usn
    }

    pub fn begin(self) -> Result<QueuedWrite<'a>, WriteQueueError> {
        self.queue.wait_for_head(self.usn)?;
        let txn = self.queue.store.txn_begin(TxnMode::Write)?;

        Ok(QueuedWrite { txn, ticket: self })
    }
}

impl<'a> Drop for WriteTicket<'a> {
    fn drop(&mut self) {
        self.queue.remove(self.usn);
    }
}

/// An open write transaction at the head of the write queue. Dropping it aborts the transaction,
/// then releases the queue head.
pub struct QueuedWrite<'a> {
    // Field order matters: the transaction must be gone before the ticket releases the head.
    txn: Box<dyn Transaction + 'a>,
    ticket: WriteTicket<'a>,
}

impl<'a> QueuedWrite<'a> {
    pub fn usn(&self) -> Usn {
        self.ticket.usn
    }

    pub fn txn(&mut self) -> &mut (dyn Transaction + 'a) {
        self.txn.as_mut()
    }

    pub fn commit(self) -> Result<(), BackendError> {
        self.commit_then(|| ())
    }

    /// Commit, then run `on_commit` while still holding the queue head. Used to publish in-memory
    /// copies of persisted state in commit order.
    pub fn commit_then<F: FnOnce()>(self, on_commit: F) -> Result<(), BackendError> {
        let QueuedWrite { txn, ticket } = self;
        txn.commit()?;
        on_commit();
        drop(ticket);
        Ok(())
    }
}
