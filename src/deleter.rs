use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::error::root_cause;
use crate::stats::CollectorStats;
use crate::stats::StatCounter;
use crate::traits::DurableQueue;
use crate::types::ReceiptHandle;

/// Collects receipt handles of persisted messages and deletes them from the remote queue in batches.
///
/// Handles which fail to delete go back into the batch and are retried up to `max_attempts` times. A handle given up
/// on is not lost data: the message reappears after its visibility timeout and gets persisted again.
pub struct DeletionBatcher {
    queue:        Arc<dyn DurableQueue>,
    stats:        Arc<CollectorStats>,
    batch_size:   usize,
    max_attempts: u32,
    pending:      Mutex<Vec<(ReceiptHandle, u32)>>,
}

impl DeletionBatcher {
    pub fn new(queue: Arc<dyn DurableQueue>, stats: Arc<CollectorStats>, batch_size: usize, max_attempts: u32) -> Self {
        Self {
            queue,
            stats,
            batch_size: batch_size.max(1),
            max_attempts: max_attempts.max(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Schedule a handle for deletion. Sends a batch request once enough handles are collected.
    pub fn add(&self, handle: ReceiptHandle) {
        let batch = {
            let mut pending = self.pending.lock();
            pending.push((handle, 0));
            if pending.len() < self.batch_size {
                return;
            }
            pending.drain(..self.batch_size).collect::<Vec<_>>()
        };
        self.delete(batch);
    }

    /// Delete everything collected so far, including retries, regardless of the batch size.
    pub fn flush(&self) {
        loop {
            let batch = std::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                break;
            }
            debug!("Flushing {} pending remote deletion(s)", batch.len());
            let mut batch = batch.into_iter().peekable();
            while batch.peek().is_some() {
                self.delete(batch.by_ref().take(self.batch_size).collect());
            }
        }
    }

    fn delete(&self, batch: Vec<(ReceiptHandle, u32)>) {
        let handles = batch.iter().map(|(h, _)| h.clone()).collect::<Vec<_>>();
        match self.queue.delete_batch(&handles) {
            Ok(outcome) => {
                self.stats
                    .add(StatCounter::RemoteQueueDeletes, outcome.succeeded.len() as u64);
                if !outcome.failed.is_empty() {
                    warn!("{} remote deletion(s) failed, retrying", outcome.failed.len());
                    for (handle, attempts) in batch {
                        if outcome.failed.contains(&handle) {
                            self.retry(handle, attempts + 1);
                        }
                    }
                }
            }
            Err(err) => {
                warn!(
                    "Batch delete of {} remote message(s) failed: {}",
                    handles.len(),
                    root_cause(&err)
                );
                for (handle, attempts) in batch {
                    self.retry(handle, attempts + 1);
                }
            }
        }
    }

    fn retry(&self, handle: ReceiptHandle, attempts: u32) {
        if attempts >= self.max_attempts {
            error!("Giving up deleting remote message '{handle}' after {attempts} attempt(s)");
            self.stats.incr(StatCounter::RemoteQueueDeleteFailures);
        }
        else {
            self.pending.lock().push((handle, attempts));
        }
    }
}
