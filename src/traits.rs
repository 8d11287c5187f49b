use std::sync::Arc;
use std::time::Duration;

use crate::error::DaoError;
use crate::error::QueueError;
use crate::health::HealthStatus;
use crate::types::BatchOutcome;
use crate::types::CacheStats;
use crate::types::Datum;
use crate::types::DatumKey;
use crate::types::ListenerId;
use crate::types::LocationDatum;
use crate::types::NodeDatum;
use crate::types::QueueAttributes;
use crate::types::QueueMessage;
use crate::types::ReceiptHandle;
use crate::types::StreamDatum;

/// Storage backend the collectors drain into.
///
/// Implementations are called concurrently from several writer threads. Repeated calls for the same logical key must
/// be safe: the overflow path delivers at least once.
pub trait DatumDao: Send + Sync + 'static {
    fn store_stream(&self, datum: &StreamDatum) -> Result<DatumKey, DaoError>;
    fn store_node(&self, datum: &NodeDatum) -> Result<DatumKey, DaoError>;
    fn store_location(&self, datum: &LocationDatum) -> Result<DatumKey, DaoError>;

    /// Run `work` inside a transaction boundary. Backends without transactions just run it.
    fn in_transaction(
        &self,
        work: &mut dyn FnMut() -> Result<DatumKey, DaoError>,
    ) -> Result<DatumKey, DaoError> {
        work()
    }
}

impl Datum {
    /// Dispatch to the DAO store operation matching the variant.
    pub fn store_with(&self, dao: &dyn DatumDao) -> Result<DatumKey, DaoError> {
        match self {
            Datum::Stream(d) => dao.store_stream(d),
            Datum::Node(d) => dao.store_node(d),
            Datum::Location(d) => dao.store_location(d),
        }
    }
}

/// Receives cache mutation events. Called on the mutating thread, never under a cache lock.
pub trait CacheListener: Send + Sync + 'static {
    fn on_created(&self, key: &DatumKey, datum: &Datum);
    fn on_updated(&self, _key: &DatumKey, _datum: &Datum) {}
    fn on_removed(&self, _key: &DatumKey, _datum: &Datum) {}
}

/// A keyed store of pending datum which doubles as a write-ahead buffer.
pub trait DatumCache: Send + Sync + 'static {
    fn get(&self, key: &DatumKey) -> Option<Datum>;
    fn put(&self, datum: Datum) -> Result<(), crate::error::CollectorError>;
    fn remove(&self, key: &DatumKey) -> Result<Option<Datum>, crate::error::CollectorError>;
    /// Remove `key` only if it still holds `expected`. Returns `None` when the entry is gone or was updated since.
    fn remove_if(&self, key: &DatumKey, expected: &Datum) -> Result<Option<Datum>, crate::error::CollectorError>;
    /// Snapshot of the keys currently held.
    fn keys(&self) -> Vec<DatumKey>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn subscribe(&self, listener: Arc<dyn CacheListener>) -> ListenerId;
    fn unsubscribe(&self, id: ListenerId) -> bool;
    /// Internal diagnostics, if the implementation keeps any.
    fn stats(&self) -> Option<CacheStats> {
        None
    }
    fn close(&self) {}
}

/// A remote queue with at-least-once delivery and visibility timeouts.
pub trait DurableQueue: Send + Sync + 'static {
    /// Returns the new message id.
    fn send(&self, body: String) -> Result<String, QueueError>;
    /// Long-poll for up to `max` messages, waiting no longer than `wait` for the first one.
    fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError>;
    fn delete_batch(&self, handles: &[ReceiptHandle]) -> Result<BatchOutcome, QueueError>;
    /// Reset visibility of received messages; zero makes them immediately redeliverable.
    fn change_visibility_batch(
        &self,
        handles: &[ReceiptHandle],
        visibility: Duration,
    ) -> Result<BatchOutcome, QueueError>;
    /// Lightweight reachability probe returning approximate message counts.
    fn attributes(&self, timeout: Duration) -> Result<QueueAttributes, QueueError>;
}

/// Synchronous health probe. Implementations must not block on I/O for longer than about a second.
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> String;
    fn check(&self) -> HealthStatus;
}
