use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use strum::AsRefStr;
use strum::EnumCount;
use strum::EnumIter;
use strum::IntoEnumIterator;
use strum::IntoStaticStr;
use tracing::info;

use crate::types::DatumKind;

/// Named counters kept by the collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, AsRefStr, IntoStaticStr)]
pub enum StatCounter {
    StreamDatumReceived,
    StreamDatumStored,
    StreamDatumFailed,
    NodeDatumReceived,
    NodeDatumStored,
    NodeDatumFailed,
    LocationDatumReceived,
    LocationDatumStored,
    LocationDatumFailed,
    /// New key appeared in the write-ahead cache.
    BufferAdds,
    /// Existing key was overwritten in the write-ahead cache.
    BufferUpdates,
    /// Key left the write-ahead cache.
    BufferRemovals,
    QueueAdds,
    QueueRemovals,
    /// Local queue refused an offer.
    QueueFull,
    /// A work item was already resolved when a writer claimed it.
    WorkItemCancelled,
    WorkItemTimeouts,
    /// A dispatched key was already being persisted by another writer.
    ScratchCollisions,
    RemoteQueueAdds,
    RemoteQueueRemovals,
    RemoteQueueFailures,
    RemoteQueueDeletes,
    RemoteQueueDeleteFailures,
    RemoteQueueRequeued,
    DirectPersists,
}

impl StatCounter {
    pub fn received(kind: DatumKind) -> Self {
        match kind {
            DatumKind::Stream => StatCounter::StreamDatumReceived,
            DatumKind::Node => StatCounter::NodeDatumReceived,
            DatumKind::Location => StatCounter::LocationDatumReceived,
        }
    }

    pub fn stored(kind: DatumKind) -> Self {
        match kind {
            DatumKind::Stream => StatCounter::StreamDatumStored,
            DatumKind::Node => StatCounter::NodeDatumStored,
            DatumKind::Location => StatCounter::LocationDatumStored,
        }
    }

    pub fn failed(kind: DatumKind) -> Self {
        match kind {
            DatumKind::Stream => StatCounter::StreamDatumFailed,
            DatumKind::Node => StatCounter::NodeDatumFailed,
            DatumKind::Location => StatCounter::LocationDatumFailed,
        }
    }
}

/// Process-scoped registry of monotonically increasing counters.
///
/// Counters are never removed or reset. Every `log_frequency` increments a full snapshot is logged at `info` level;
/// zero disables the periodic log.
#[derive(Debug)]
pub struct CollectorStats {
    name:          String,
    log_frequency: u64,
    updates:       AtomicU64,
    counters:      [AtomicU64; StatCounter::COUNT],
}

impl CollectorStats {
    pub fn new<S: Into<String>>(name: S, log_frequency: u64) -> Self {
        Self {
            name: name.into(),
            log_frequency,
            updates: AtomicU64::new(0),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn incr(&self, counter: StatCounter) -> u64 {
        self.add(counter, 1)
    }

    pub fn add(&self, counter: StatCounter, count: u64) -> u64 {
        let value = self.counters[counter as usize].fetch_add(count, Ordering::Relaxed) + count;
        let updates = self.updates.fetch_add(1, Ordering::Relaxed) + 1;
        if self.log_frequency > 0 && updates % self.log_frequency == 0 {
            info!("[{}] stats: {}", self.name, self);
        }
        value
    }

    #[inline]
    pub fn get(&self, counter: StatCounter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn received_total(&self) -> u64 {
        DatumKind::iter().map(|k| self.get(StatCounter::received(k))).sum()
    }

    pub fn stored_total(&self) -> u64 {
        DatumKind::iter().map(|k| self.get(StatCounter::stored(k))).sum()
    }

    pub fn failed_total(&self) -> u64 {
        DatumKind::iter().map(|k| self.get(StatCounter::failed(k))).sum()
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        StatCounter::iter().map(|c| (<&'static str>::from(c), self.get(c))).collect()
    }
}

impl std::fmt::Display for CollectorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for counter in StatCounter::iter() {
            let value = self.get(counter);
            if value == 0 {
                continue;
            }
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}={}", counter.as_ref(), value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent_and_monotonic() {
        let stats = CollectorStats::new("test", 0);
        stats.incr(StatCounter::QueueAdds);
        stats.incr(StatCounter::QueueAdds);
        stats.add(StatCounter::BufferAdds, 5);
        assert_eq!(stats.get(StatCounter::QueueAdds), 2);
        assert_eq!(stats.get(StatCounter::BufferAdds), 5);
        assert_eq!(stats.get(StatCounter::BufferRemovals), 0);
    }

    #[test]
    fn totals_sum_over_kinds() {
        let stats = CollectorStats::new("test", 0);
        stats.incr(StatCounter::received(DatumKind::Stream));
        stats.incr(StatCounter::received(DatumKind::Node));
        stats.incr(StatCounter::received(DatumKind::Location));
        stats.incr(StatCounter::stored(DatumKind::Node));
        assert_eq!(stats.received_total(), 3);
        assert_eq!(stats.stored_total(), 1);
        assert_eq!(stats.failed_total(), 0);
        assert_eq!(stats.snapshot()["NodeDatumStored"], 1);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stats = std::sync::Arc::new(CollectorStats::new("test", 0));
        let handles = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.incr(StatCounter::QueueRemovals);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.get(StatCounter::QueueRemovals), 4000);
    }
}
