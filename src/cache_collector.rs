use crossbeam::channel::bounded;
use crossbeam::channel::select;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use crossbeam::channel::TrySendError;
use fieldx_plus::fx_plus;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::root_cause;
use crate::error::CollectorError;
use crate::error::Result;
use crate::health::HealthStatus;
use crate::stats::CollectorStats;
use crate::stats::StatCounter;
use crate::traits::CacheListener;
use crate::traits::DatumCache;
use crate::traits::DatumDao;
use crate::traits::HealthCheck;
use crate::types::Datum;
use crate::types::DatumKey;
use crate::types::ListenerId;
use crate::worker::current_thread_name;
use crate::worker::dead_threads;
use crate::worker::default_error_hook;
use crate::worker::join_all;
use crate::worker::persist_datum;
use crate::worker::report_error;
use crate::worker::spawn_named;
use crate::worker::ErrorHook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    Queued,
    AlreadyQueued,
    Full,
    Stopped,
}

enum Wakeup {
    Key(DatumKey),
    Idle,
    Stop,
}

struct CacheRuntime {
    key_tx:      Sender<DatumKey>,
    // Dropping it wakes up every writer blocked on the dispatch queue.
    shutdown_tx: Sender<()>,
    writers:     Vec<JoinHandle<()>>,
    listener_id: ListenerId,
}

// Marks a key as being persisted for as long as it lives.
struct ScratchClaim<'a> {
    collector: &'a CacheCollector,
    key:       DatumKey,
}

impl<'a> ScratchClaim<'a> {
    fn acquire(collector: &'a CacheCollector, key: &DatumKey) -> Option<Self> {
        if collector.scratch_mut().insert(key.clone()) {
            Some(Self {
                collector,
                key: key.clone(),
            })
        }
        else {
            None
        }
    }
}

impl Drop for ScratchClaim<'_> {
    fn drop(&mut self) {
        self.collector.scratch_mut().remove(&self.key);
    }
}

// Registered with the cache while the collector runs. Holds a weak reference so that the cache never keeps a
// dropped collector alive.
struct DispatchListener {
    collector: Weak<CacheCollector>,
}

impl CacheListener for DispatchListener {
    fn on_created(&self, key: &DatumKey, _datum: &Datum) {
        if let Some(collector) = self.collector.upgrade() {
            collector.stats().incr(StatCounter::BufferAdds);
            if collector.enabled() {
                collector.offer(key.clone());
            }
        }
    }

    fn on_updated(&self, _key: &DatumKey, _datum: &Datum) {
        if let Some(collector) = self.collector.upgrade() {
            collector.stats().incr(StatCounter::BufferUpdates);
        }
    }

    fn on_removed(&self, _key: &DatumKey, _datum: &Datum) {
        if let Some(collector) = self.collector.upgrade() {
            collector.stats().incr(StatCounter::BufferRemovals);
        }
    }
}

/// Persists datum from a durable buffer cache through a pool of writer threads.
///
/// Producers only ever write into the cache. The collector listens to its creation events and dispatches the new keys
/// to the writers through a bounded queue. A key which doesn't fit into the queue stays in the cache and is picked up
/// later by a refill scan, started whenever the queue runs low. A datum leaves the cache only after the DAO reported
/// it as stored.
///
/// ```ignore
/// let collector = CacheCollector::builder()
///     .dao(dao)
///     .cache(Arc::new(WriteAheadCache::open("buffer", 100_000, "/var/lib/datum/buffer.journal", false)?))
///     .queue_capacity(500)
///     .writer_threads(4)
///     .build()?;
/// collector.startup()?;
/// collector.collect(datum)?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`CacheCollector`].", "", "See [`CacheCollector::builder()`] method."),
        method_doc("Implement builder pattern for [`CacheCollector`]."),
    )
)]
pub struct CacheCollector {
    #[fieldx(get(clone), builder(required))]
    dao: Arc<dyn DatumDao>,

    #[fieldx(get(clone), builder(required))]
    cache: Arc<dyn DatumCache>,

    /// Collector name. Used in logs and as the prefix of worker thread names.
    #[fieldx(get(clone), builder(into), default("datum-cache".to_string()))]
    name: String,

    /// Capacity of the dispatch queue between the cache and the writers.
    #[fieldx(get(copy), default(200))]
    queue_capacity: usize,

    #[fieldx(get(copy), default(2))]
    writer_threads: usize,

    /// A refill scan of the cache starts when the dispatch queue holds fewer than `queue_capacity * refill_ratio`
    /// keys.
    #[fieldx(get(copy), default(0.1))]
    refill_ratio: f64,

    /// A writer with nothing to do rescans the cache this often, picking up keys no event has dispatched.
    #[fieldx(get(copy), default(Duration::from_secs(1)))]
    idle_refill_interval: Duration,

    /// How long [`CacheCollector::shutdown_and_wait`] waits for the writers.
    #[fieldx(get(copy), default(Duration::from_secs(10)))]
    shutdown_wait: Duration,

    /// Health check fails when more than this many datum are waiting in the cache.
    #[fieldx(get(copy), default(500))]
    alert_threshold: u64,

    #[fieldx(get(copy), default(false))]
    close_cache_on_shutdown: bool,

    /// Log a stats snapshot every that many counter updates. Zero disables it.
    #[fieldx(get(copy), default(500))]
    stats_log_frequency: u64,

    #[fieldx(get(clone), default(default_error_hook()))]
    error_hook: ErrorHook,

    #[fieldx(lazy, get(clone), builder(off))]
    stats: Arc<CollectorStats>,

    #[fieldx(lock, get(copy), set(private), builder(off), default(false))]
    enabled: bool,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    runtime: CacheRuntime,

    // Keys sitting in the dispatch queue.
    #[fieldx(lock, private, get, get_mut, builder(off), default(HashSet::new()))]
    queued: HashSet<DatumKey>,

    // Keys being persisted right now.
    #[fieldx(lock, private, get, get_mut, builder(off), default(HashSet::new()))]
    scratch: HashSet<DatumKey>,

    #[fieldx(private, get, builder(off), default(Mutex::new(())))]
    refill_lock: Mutex<()>,
}

impl CacheCollector {
    fn build_stats(&self) -> Arc<CollectorStats> {
        Arc::new(CollectorStats::new(self.name(), self.stats_log_frequency()))
    }

    /// Put a datum into the cache. It gets persisted asynchronously.
    pub fn collect(&self, datum: Datum) -> Result<()> {
        self.cache().put(datum)
    }

    pub fn is_running(&self) -> bool {
        self.enabled() && self.runtime().is_some()
    }

    /// Number of keys waiting in the dispatch queue.
    pub fn queue_len(&self) -> usize {
        self.runtime().as_ref().map_or(0, |rt| rt.key_tx.len())
    }

    /// Number of writer threads which are still alive.
    pub fn live_writers(&self) -> usize {
        self.runtime()
            .as_ref()
            .map_or(0, |rt| rt.writers.len() - dead_threads(&rt.writers))
    }

    /// Start the writers and begin dispatching cache content. A running collector is shut down first.
    ///
    /// Whatever the cache already holds at this point is picked up by an initial refill scan.
    pub fn startup(&self) -> Result<()> {
        self.validate()?;
        if self.runtime().is_some() {
            self.shutdown();
        }

        let myself = self.myself().ok_or(CollectorError::NotRunning)?;
        let name = self.name();
        let (key_tx, key_rx) = bounded::<DatumKey>(self.queue_capacity().max(1));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        self.queued_mut().clear();
        self.set_enabled(true);

        let mut writers = Vec::with_capacity(self.writer_threads());
        for id in 0..self.writer_threads().max(1) {
            let key_rx = key_rx.clone();
            let shutdown_rx = shutdown_rx.clone();
            let writer = myself.clone();
            match spawn_named(format!("{name}-writer-{id}"), move || {
                writer.writer_loop(key_rx, shutdown_rx)
            }) {
                Ok(handle) => writers.push(handle),
                Err(err) => {
                    self.set_enabled(false);
                    drop(shutdown_tx);
                    join_all(&name, writers, self.shutdown_wait());
                    return Err(err);
                }
            }
        }

        let listener_id = self.cache().subscribe(Arc::new(DispatchListener {
            collector: Arc::downgrade(&myself),
        }));

        self.set_runtime(CacheRuntime {
            key_tx,
            shutdown_tx,
            writers,
            listener_id,
        });

        info!(
            "[{name}] Started {} writer(s), dispatch queue capacity {}",
            self.writer_threads().max(1),
            self.queue_capacity().max(1)
        );

        self.refill();
        Ok(())
    }

    /// Signal the writers to stop and return immediately. Datum not persisted yet stay in the cache.
    pub fn shutdown(&self) {
        if let Some(writers) = self.stop() {
            debug!("[{}] Detached {} writer(s)", self.name(), writers.len());
        }
    }

    /// Signal the writers to stop and wait for them for up to `shutdown_wait`. Returns `true` if every writer
    /// finished in time.
    pub fn shutdown_and_wait(&self) -> bool {
        match self.stop() {
            Some(writers) => join_all(&self.name(), writers, self.shutdown_wait()),
            None => true,
        }
    }

    fn stop(&self) -> Option<Vec<JoinHandle<()>>> {
        self.set_enabled(false);
        let CacheRuntime {
            key_tx,
            shutdown_tx,
            writers,
            listener_id,
        } = self.clear_runtime()?;

        drop(shutdown_tx);
        drop(key_tx);
        self.cache().unsubscribe(listener_id);
        self.queued_mut().clear();

        if self.close_cache_on_shutdown() {
            self.cache().close();
        }

        info!("[{}] Shutting down; {} datum left in cache", self.name(), self.cache().len());
        Some(writers)
    }

    fn validate(&self) -> Result<()> {
        let ratio = self.refill_ratio();
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(CollectorError::config(format!("refill_ratio must be within (0, 1], got {ratio}")));
        }
        Ok(())
    }

    fn refill_threshold(&self) -> usize {
        ((self.queue_capacity() as f64 * self.refill_ratio()) as usize).max(1)
    }

    fn offer(&self, key: DatumKey) -> Offer {
        let runtime = self.runtime();
        let Some(rt) = runtime.as_ref()
        else {
            return Offer::Stopped;
        };

        let mut queued = self.queued_mut();
        if queued.contains(&key) {
            return Offer::AlreadyQueued;
        }

        match rt.key_tx.try_send(key.clone()) {
            Ok(()) => {
                queued.insert(key);
                self.stats().incr(StatCounter::QueueAdds);
                Offer::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.stats().incr(StatCounter::QueueFull);
                Offer::Full
            }
            Err(TrySendError::Disconnected(_)) => Offer::Stopped,
        }
    }

    /// Scan the cache for keys nobody is working on and top up the dispatch queue with them. Only one scan runs at a
    /// time; a concurrent request is skipped.
    fn refill(&self) {
        let Some(_guard) = self.refill_lock().try_lock()
        else {
            return;
        };

        let mut added = 0usize;
        for key in self.cache().keys() {
            if !self.enabled() {
                break;
            }
            if self.scratch().contains(&key) {
                continue;
            }
            match self.offer(key) {
                Offer::Queued => added += 1,
                Offer::AlreadyQueued => (),
                Offer::Full | Offer::Stopped => break,
            }
        }

        if added > 0 {
            debug!("[{}] Refill queued {added} key(s)", self.name());
        }
    }

    fn writer_loop(&self, key_rx: Receiver<DatumKey>, shutdown_rx: Receiver<()>) {
        let thread_name = current_thread_name();
        debug!("[{}] Writer {thread_name} started", self.name());

        while self.enabled() {
            let wakeup = select! {
                recv(key_rx) -> msg => msg.map_or(Wakeup::Stop, Wakeup::Key),
                recv(shutdown_rx) -> _ => Wakeup::Stop,
                default(self.idle_refill_interval()) => Wakeup::Idle,
            };

            let key = match wakeup {
                Wakeup::Key(key) => key,
                Wakeup::Idle => {
                    self.refill();
                    continue;
                }
                Wakeup::Stop => break,
            };

            self.queued_mut().remove(&key);
            self.stats().incr(StatCounter::QueueRemovals);

            self.process(&thread_name, &key);
            if key_rx.len() < self.refill_threshold() {
                self.refill();
            }
        }

        debug!("[{}] Writer {thread_name} stopped", self.name());
    }

    fn process(&self, thread_name: &str, key: &DatumKey) {
        let Some(_claim) = ScratchClaim::acquire(self, key)
        else {
            self.stats().incr(StatCounter::ScratchCollisions);
            debug!("[{}] {key} is already being persisted", self.name());
            return;
        };

        // Somebody else stored it already.
        let Some(datum) = self.cache().get(key)
        else {
            return;
        };
        let kind = datum.kind();

        match persist_datum(self.dao().as_ref(), &datum) {
            Ok(_) => {
                self.stats().incr(StatCounter::stored(kind));
                // A newer version put while we were storing stays in the cache for the next round.
                match self.cache().remove_if(key, &datum) {
                    Ok(Some(_)) => (),
                    Ok(None) => debug!("[{}] {key} was updated while being stored", self.name()),
                    Err(err) => error!(
                        "[{}] Stored {key} but could not remove it from the cache: {}",
                        self.name(),
                        root_cause(&err)
                    ),
                }
            }
            Err(err) => {
                self.stats().incr(StatCounter::failed(kind));
                warn!("[{}] Failed to persist {key}: {}", self.name(), root_cause(&err));
                report_error(&self.error_hook(), thread_name, &err);
            }
        }
    }
}

impl HealthCheck for CacheCollector {
    fn name(&self) -> String {
        CacheCollector::name(self)
    }

    fn check(&self) -> HealthStatus {
        let stats = self.stats();
        let added = stats.get(StatCounter::BufferAdds);
        let removed = stats.get(StatCounter::BufferRemovals);
        let lag = added.saturating_sub(removed);
        let threshold = self.alert_threshold();

        let mut status = if lag > threshold {
            HealthStatus::unhealthy(format!("Buffer lag {lag} exceeds {threshold}"))
        }
        else if self.enabled() && self.live_writers() == 0 {
            HealthStatus::unhealthy("No writer thread is alive")
        }
        else {
            HealthStatus::healthy(format!("Buffer lag {lag}"))
        };

        status.set_property("lag", lag as f64);
        status.set_property("alert_threshold", threshold as f64);
        status.set_property("buffer_adds", added as f64);
        status.set_property("buffer_removals", removed as f64);
        status.set_property("stored", stats.stored_total() as f64);
        status.set_property("failed", stats.failed_total() as f64);
        status.set_property("queue_len", self.queue_len() as f64);
        status.set_property("in_progress", self.scratch().len() as f64);
        status.set_property("live_writers", self.live_writers() as f64);

        if let Some(cache_stats) = self.cache().stats() {
            status.set_property("cache_size", cache_stats.size as f64);
            status.set_property("cache_capacity", cache_stats.capacity as f64);
            status.set_property("cache_high_water_mark", cache_stats.high_water_mark as f64);
        }

        status
    }
}
