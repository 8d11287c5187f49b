use crossbeam::channel::bounded;
use crossbeam::channel::select;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use crossbeam::channel::TrySendError;
use fieldx_plus::fx_plus;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::completion::Outcome;
use crate::deleter::DeletionBatcher;
use crate::error::root_cause;
use crate::error::CollectorError;
use crate::error::Result;
use crate::health::HealthStatus;
use crate::message;
use crate::stats::CollectorStats;
use crate::stats::StatCounter;
use crate::throttle::AdaptiveThrottle;
use crate::traits::DatumDao;
use crate::traits::DurableQueue;
use crate::traits::HealthCheck;
use crate::types::Datum;
use crate::types::QueueMessage;
use crate::types::ReceiptHandle;
use crate::work::WorkItem;
use crate::worker::current_thread_name;
use crate::worker::dead_threads;
use crate::worker::default_error_hook;
use crate::worker::interruptible_sleep;
use crate::worker::join_all;
use crate::worker::persist_datum;
use crate::worker::report_error;
use crate::worker::spawn_named;
use crate::worker::ErrorHook;

struct OverflowRuntime {
    work_tx:     Sender<WorkItem>,
    // Dropping it interrupts writers waiting for work and readers sleeping between polls.
    shutdown_tx: Sender<()>,
    writers:     Vec<JoinHandle<()>>,
    readers:     Vec<JoinHandle<()>>,
}

/// Persists datum through a bounded local work queue and spills to a remote durable queue when the local side can't
/// keep up.
///
/// A producer calling [`OverflowCollector::persist`] hands its datum to the local writers and waits up to
/// `work_item_max_wait` for the result. If the local queue is full, the wait times out, or the DAO fails, the datum
/// is sent to the remote queue instead; if that fails too it is stored directly from the calling thread. Reader
/// threads feed remote messages back into the local queue, and a message is deleted from the remote queue only after
/// its datum has been stored.
///
/// Delivery is at-least-once: a datum may be stored more than once, never silently dropped.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`OverflowCollector`].", "", "See [`OverflowCollector::builder()`] method."),
        method_doc("Implement builder pattern for [`OverflowCollector`]."),
    )
)]
pub struct OverflowCollector {
    #[fieldx(get(clone), builder(required))]
    dao: Arc<dyn DatumDao>,

    #[fieldx(get(clone), builder(required))]
    queue: Arc<dyn DurableQueue>,

    /// Collector name. Used in logs and as the prefix of worker thread names.
    #[fieldx(get(clone), builder(into), default("datum-overflow".to_string()))]
    name: String,

    /// Capacity of the local work queue.
    #[fieldx(get(copy), default(200))]
    queue_capacity: usize,

    #[fieldx(get(copy), default(2))]
    writer_threads: usize,

    #[fieldx(get(copy), default(1))]
    reader_threads: usize,

    /// How long a producer waits for a local writer before overflowing. Zero makes `persist` return as soon as the
    /// datum is accepted by the local queue.
    #[fieldx(get(copy), default(Duration::from_secs(5)))]
    work_item_max_wait: Duration,

    #[fieldx(get(copy), default(10))]
    receive_batch_size: usize,

    /// Long-poll duration of a single remote receive call.
    #[fieldx(get(copy), default(Duration::from_secs(20)))]
    receive_wait: Duration,

    #[fieldx(get(copy), default(Duration::from_secs(1)))]
    read_sleep_min: Duration,

    #[fieldx(get(copy), default(Duration::from_secs(15)))]
    read_sleep_max: Duration,

    #[fieldx(get(copy), default(Duration::from_secs(1)))]
    read_sleep_step: Duration,

    #[fieldx(get(copy), default(10))]
    delete_batch_size: usize,

    #[fieldx(get(copy), default(3))]
    delete_max_attempts: u32,

    #[fieldx(get(copy), default(Duration::from_secs(1)))]
    health_check_timeout: Duration,

    /// How long [`OverflowCollector::shutdown_and_wait`] waits for the worker threads. Keep it above `receive_wait`
    /// or a reader in the middle of a long poll gets detached.
    #[fieldx(get(copy), default(Duration::from_secs(30)))]
    shutdown_wait: Duration,

    /// Log a stats snapshot every that many counter updates. Zero disables it.
    #[fieldx(get(copy), default(500))]
    stats_log_frequency: u64,

    #[fieldx(get(clone), default(default_error_hook()))]
    error_hook: ErrorHook,

    #[fieldx(lazy, get(clone), builder(off))]
    stats: Arc<CollectorStats>,

    #[fieldx(lazy, get(clone), builder(off))]
    deleter: Arc<DeletionBatcher>,

    #[fieldx(lock, get(copy), set(private), builder(off), default(false))]
    enabled: bool,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    runtime: OverflowRuntime,
}

impl OverflowCollector {
    fn build_stats(&self) -> Arc<CollectorStats> {
        Arc::new(CollectorStats::new(self.name(), self.stats_log_frequency()))
    }

    fn build_deleter(&self) -> Arc<DeletionBatcher> {
        Arc::new(DeletionBatcher::new(
            self.queue(),
            self.stats(),
            self.delete_batch_size(),
            self.delete_max_attempts(),
        ))
    }

    pub fn is_running(&self) -> bool {
        self.enabled() && self.runtime().is_some()
    }

    /// Free slots in the local work queue.
    pub fn available_capacity(&self) -> usize {
        self.runtime().as_ref().map_or(0, |rt| {
            rt.work_tx
                .capacity()
                .unwrap_or(usize::MAX)
                .saturating_sub(rt.work_tx.len())
        })
    }

    pub fn live_writers(&self) -> usize {
        self.runtime()
            .as_ref()
            .map_or(0, |rt| rt.writers.len() - dead_threads(&rt.writers))
    }

    pub fn live_readers(&self) -> usize {
        self.runtime()
            .as_ref()
            .map_or(0, |rt| rt.readers.len() - dead_threads(&rt.readers))
    }

    /// Start writer and reader threads. A running collector is shut down first.
    pub fn startup(&self) -> Result<()> {
        self.validate()?;
        if self.runtime().is_some() {
            self.shutdown();
        }

        let myself = self.myself().ok_or(CollectorError::NotRunning)?;
        let name = self.name();
        let (work_tx, work_rx) = bounded::<WorkItem>(self.queue_capacity().max(1));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        self.set_enabled(true);

        let mut writers = Vec::new();
        let mut readers = Vec::new();
        let spawned = (|| -> Result<()> {
            for id in 0..self.writer_threads().max(1) {
                let work_rx = work_rx.clone();
                let shutdown_rx = shutdown_rx.clone();
                let writer = myself.clone();
                writers.push(spawn_named(format!("{name}-writer-{id}"), move || {
                    writer.writer_loop(work_rx, shutdown_rx)
                })?);
            }
            for id in 0..self.reader_threads() {
                let work_tx = work_tx.clone();
                let shutdown_rx = shutdown_rx.clone();
                let reader = myself.clone();
                readers.push(spawn_named(format!("{name}-reader-{id}"), move || {
                    reader.reader_loop(work_tx, shutdown_rx)
                })?);
            }
            Ok(())
        })();

        if let Err(err) = spawned {
            self.set_enabled(false);
            drop(shutdown_tx);
            writers.append(&mut readers);
            join_all(&name, writers, self.shutdown_wait());
            return Err(err);
        }

        info!(
            "[{name}] Started {} writer(s) and {} reader(s), local queue capacity {}",
            writers.len(),
            readers.len(),
            self.queue_capacity().max(1)
        );

        self.set_runtime(OverflowRuntime {
            work_tx,
            shutdown_tx,
            writers,
            readers,
        });
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.read_sleep_min() > self.read_sleep_max() {
            return Err(CollectorError::config(format!(
                "read_sleep_min ({:?}) is above read_sleep_max ({:?})",
                self.read_sleep_min(),
                self.read_sleep_max()
            )));
        }
        if self.receive_batch_size() == 0 {
            return Err(CollectorError::config("receive_batch_size must be positive"));
        }
        Ok(())
    }

    /// Signal all threads to stop, flush pending remote deletions and return without waiting for the threads.
    ///
    /// Writers still store whatever is left in the local queue before they exit, and flush the deletions this causes.
    pub fn shutdown(&self) {
        if let Some(threads) = self.stop() {
            debug!("[{}] Detached {} thread(s)", self.name(), threads.len());
        }
        self.deleter().flush();
    }

    /// Signal all threads to stop and wait for them for up to `shutdown_wait`, then flush pending remote deletions.
    /// Returns `true` if every thread finished in time.
    pub fn shutdown_and_wait(&self) -> bool {
        let all_stopped = match self.stop() {
            Some(threads) => join_all(&self.name(), threads, self.shutdown_wait()),
            None => true,
        };
        self.deleter().flush();
        all_stopped
    }

    fn stop(&self) -> Option<Vec<JoinHandle<()>>> {
        self.set_enabled(false);
        let OverflowRuntime {
            work_tx,
            shutdown_tx,
            mut writers,
            readers,
        } = self.clear_runtime()?;

        drop(shutdown_tx);
        drop(work_tx);
        info!("[{}] Shutting down", self.name());

        writers.extend(readers);
        Some(writers)
    }

    /// Persist a datum. Returns once the datum is stored or durably queued remotely.
    ///
    /// An error is returned only when both the remote queue and the direct store failed.
    pub fn persist(&self, datum: Datum) -> Result<()> {
        let kind = datum.kind();
        self.stats().incr(StatCounter::received(kind));

        let item = WorkItem::new(datum.clone());
        let completion = item.completion().clone();
        let wait = self.work_item_max_wait();

        if wait.is_zero() {
            // Nobody is going to wait for the outcome: a failed local store is overflowed by the writer itself.
            if let Some(myself) = self.myself() {
                let datum = datum.clone();
                completion.on_resolve(move |outcome| {
                    if matches!(outcome, Outcome::Failed(_)) {
                        // Errors are logged by `overflow`.
                        let _ = myself.overflow(&datum);
                    }
                });
            }
        }

        if self.offer(item) {
            if wait.is_zero() {
                return Ok(());
            }

            let outcome = match completion.wait_timeout(wait) {
                Some(outcome) => outcome,
                None => {
                    if completion.cancel() {
                        self.stats().incr(StatCounter::WorkItemTimeouts);
                        debug!("[{}] {} timed out in the local queue", self.name(), datum.key());
                        Outcome::Cancelled
                    }
                    else {
                        // A writer got to it between the timeout and the cancellation.
                        completion.wait()
                    }
                }
            };

            match outcome {
                Outcome::Succeeded(_) => return Ok(()),
                Outcome::Failed(err) => {
                    debug!(
                        "[{}] Local store of {} failed, overflowing: {}",
                        self.name(),
                        datum.key(),
                        root_cause(&*err)
                    );
                }
                Outcome::Cancelled => (),
            }
        }

        self.overflow(&datum)
    }

    fn offer(&self, item: WorkItem) -> bool {
        let runtime = self.runtime();
        let Some(rt) = runtime.as_ref()
        else {
            return false;
        };

        match rt.work_tx.try_send(item) {
            Ok(()) => {
                self.stats().incr(StatCounter::QueueAdds);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats().incr(StatCounter::QueueFull);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn overflow(&self, datum: &Datum) -> Result<()> {
        let remote = match message::encode(datum) {
            Ok(body) => match self.queue().send(body) {
                Ok(message_id) => {
                    self.stats().incr(StatCounter::RemoteQueueAdds);
                    debug!("[{}] {} sent to remote queue as {message_id}", self.name(), datum.key());
                    return Ok(());
                }
                Err(err) => {
                    self.stats().incr(StatCounter::RemoteQueueFailures);
                    warn!(
                        "[{}] Remote queue rejected {}, storing directly: {}",
                        self.name(),
                        datum.key(),
                        root_cause(&err)
                    );
                    Some(err)
                }
            },
            Err(err) => {
                warn!(
                    "[{}] {} can't go through the remote queue, storing directly: {}",
                    self.name(),
                    datum.key(),
                    root_cause(&err)
                );
                None
            }
        };

        let kind = datum.kind();
        match persist_datum(self.dao().as_ref(), datum) {
            Ok(_) => {
                self.stats().incr(StatCounter::DirectPersists);
                self.stats().incr(StatCounter::stored(kind));
                Ok(())
            }
            Err(err) => {
                self.stats().incr(StatCounter::failed(kind));
                error!(
                    "[{}] Lost the chance to persist {}: {}",
                    self.name(),
                    datum.key(),
                    root_cause(&err)
                );
                Err(match (remote, err) {
                    (Some(remote), CollectorError::Dao(fallback)) => CollectorError::Overflow { remote, fallback },
                    (_, other) => other,
                })
            }
        }
    }

    fn writer_loop(&self, work_rx: Receiver<WorkItem>, shutdown_rx: Receiver<()>) {
        let thread_name = current_thread_name();
        debug!("[{}] Writer {thread_name} started", self.name());

        // Stop only on the shutdown signal: it comes after the last producer offer went through.
        loop {
            let item = select! {
                recv(work_rx) -> msg => msg.ok(),
                recv(shutdown_rx) -> _ => None,
            };
            let Some(item) = item
            else {
                break;
            };

            self.stats().incr(StatCounter::QueueRemovals);
            self.process(&thread_name, item);
        }

        // Producers which didn't wait were already told their datum is taken care of.
        let mut drained = 0usize;
        while let Ok(item) = work_rx.try_recv() {
            self.stats().incr(StatCounter::QueueRemovals);
            self.process(&thread_name, item);
            drained += 1;
        }
        if drained > 0 {
            debug!("[{}] Writer {thread_name} drained {drained} item(s) on stop", self.name());
        }
        self.deleter().flush();

        debug!("[{}] Writer {thread_name} stopped", self.name());
    }

    fn process(&self, thread_name: &str, item: WorkItem) {
        let completion = item.completion();
        if completion.is_done() {
            self.stats().incr(StatCounter::WorkItemCancelled);
            debug!("[{}] Skipping cancelled {}", self.name(), item.datum().key());
            return;
        }

        let kind = item.datum().kind();
        match persist_datum(self.dao().as_ref(), item.datum()) {
            Ok(key) => {
                self.stats().incr(StatCounter::stored(kind));
                if !completion.complete(key) {
                    debug!("[{}] {} was stored after being given up on", self.name(), item.datum().key());
                }
            }
            Err(err) => {
                self.stats().incr(StatCounter::failed(kind));
                warn!(
                    "[{}] Failed to persist {}: {}",
                    self.name(),
                    item.datum().key(),
                    root_cause(&err)
                );
                report_error(&self.error_hook(), thread_name, &err);
                completion.fail(err);
            }
        }
    }

    fn reader_loop(&self, work_tx: Sender<WorkItem>, shutdown_rx: Receiver<()>) {
        let thread_name = current_thread_name();
        debug!("[{}] Reader {thread_name} started", self.name());

        let mut throttle = AdaptiveThrottle::new(self.read_sleep_min(), self.read_sleep_max(), self.read_sleep_step());

        while self.enabled() {
            let delay = match self.queue().receive(self.receive_batch_size(), self.receive_wait()) {
                Ok(messages) => {
                    let rejected = self.accept(messages, &work_tx);
                    throttle.record_batch(rejected)
                }
                Err(err) if err.is_fatal() => {
                    error!("[{}] Reader {thread_name} giving up: {}", self.name(), root_cause(&err));
                    break;
                }
                Err(err) => {
                    warn!("[{}] Remote receive failed: {}", self.name(), root_cause(&err));
                    throttle.record_failure()
                }
            };

            if interruptible_sleep(&shutdown_rx, delay) {
                break;
            }
        }

        debug!("[{}] Reader {thread_name} stopped", self.name());
    }

    // Hand received messages to the local writers. Returns the number of messages put back for lack of local
    // capacity.
    fn accept(&self, messages: Vec<QueueMessage>, work_tx: &Sender<WorkItem>) -> usize {
        let mut rejected: Vec<ReceiptHandle> = Vec::new();

        for message in messages {
            self.stats().incr(StatCounter::RemoteQueueRemovals);

            let datum = match message::decode(&message.body) {
                Ok(datum) => datum,
                Err(err) => {
                    self.stats().incr(StatCounter::RemoteQueueFailures);
                    error!(
                        "[{}] Discarding undecodable message {}: {}",
                        self.name(),
                        message.message_id,
                        root_cause(&err)
                    );
                    self.deleter().add(message.receipt_handle);
                    continue;
                }
            };

            if !self.enabled() {
                rejected.push(message.receipt_handle);
                continue;
            }

            let item = WorkItem::new(datum);
            let deleter = self.deleter();
            let handle = message.receipt_handle.clone();
            item.completion().on_resolve(move |outcome| {
                if outcome.is_success() {
                    deleter.add(handle);
                }
            });

            match work_tx.try_send(item) {
                Ok(()) => {
                    self.stats().incr(StatCounter::QueueAdds);
                }
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.stats().incr(StatCounter::QueueFull);
                    rejected.push(message.receipt_handle);
                }
            }
        }

        if !rejected.is_empty() {
            match self.queue().change_visibility_batch(&rejected, Duration::ZERO) {
                Ok(outcome) => {
                    self.stats()
                        .add(StatCounter::RemoteQueueRequeued, outcome.succeeded.len() as u64);
                    if !outcome.failed.is_empty() {
                        debug!(
                            "[{}] {} message(s) will reappear after their visibility timeout",
                            self.name(),
                            outcome.failed.len()
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        "[{}] Could not put back {} message(s): {}",
                        self.name(),
                        rejected.len(),
                        root_cause(&err)
                    );
                }
            }
        }

        rejected.len()
    }
}

impl HealthCheck for OverflowCollector {
    fn name(&self) -> String {
        OverflowCollector::name(self)
    }

    fn check(&self) -> HealthStatus {
        let stats = self.stats();
        let received = stats.received_total();
        let stored = stats.stored_total();
        let duplicate_percent = if received > 0 {
            (100.0_f64 * (stored as f64 - received as f64) / received as f64).max(0.0)
        }
        else {
            0.0
        };

        let mut problems = Vec::new();
        let mut properties = vec![
            ("received", received as f64),
            ("stored", stored as f64),
            ("failed", stats.failed_total() as f64),
            ("duplicate_percent", duplicate_percent),
            ("available_capacity", self.available_capacity() as f64),
            ("live_writers", self.live_writers() as f64),
            ("live_readers", self.live_readers() as f64),
            ("remote_adds", stats.get(StatCounter::RemoteQueueAdds) as f64),
            ("remote_removals", stats.get(StatCounter::RemoteQueueRemovals) as f64),
            ("remote_failures", stats.get(StatCounter::RemoteQueueFailures) as f64),
            ("direct_persists", stats.get(StatCounter::DirectPersists) as f64),
        ];

        match self.queue().attributes(self.health_check_timeout()) {
            Ok(attributes) => {
                properties.push(("remote_visible", attributes.visible as f64));
                properties.push(("remote_in_flight", attributes.in_flight as f64));
            }
            Err(err) => problems.push(format!("remote queue unreachable: {}", root_cause(&err))),
        }

        if let Some(rt) = self.runtime().as_ref() {
            let dead_writers = dead_threads(&rt.writers);
            let dead_readers = dead_threads(&rt.readers);
            if dead_writers > 0 {
                problems.push(format!("{dead_writers} writer thread(s) died"));
            }
            if dead_readers > 0 {
                problems.push(format!("{dead_readers} reader thread(s) died"));
            }
        }

        let mut status = if problems.is_empty() {
            HealthStatus::healthy(format!("Duplicates {duplicate_percent:.1}%"))
        }
        else {
            HealthStatus::unhealthy(problems.join("; "))
        };
        for (name, value) in properties {
            status.set_property(name, value);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_queue::MemoryQueue;
    use crate::test::mixed_datum;
    use crate::test::RecordingDao;

    #[test]
    fn cancelled_item_is_skipped_by_writer() {
        let dao = Arc::new(RecordingDao::new());
        let collector = OverflowCollector::builder()
            .dao(dao.clone())
            .queue(Arc::new(MemoryQueue::new("remote")))
            .stats_log_frequency(0)
            .build()
            .unwrap();

        let item = WorkItem::new(mixed_datum(1));
        assert!(item.completion().cancel());
        collector.process("test-writer", item);

        assert_eq!(dao.calls(), 0);
        assert_eq!(collector.stats().get(StatCounter::WorkItemCancelled), 1);
        assert_eq!(collector.stats().stored_total(), 0);
    }

    #[test]
    fn stored_item_completes_its_signal() {
        let dao = Arc::new(RecordingDao::new());
        let collector = OverflowCollector::builder()
            .dao(dao.clone())
            .queue(Arc::new(MemoryQueue::new("remote")))
            .stats_log_frequency(0)
            .build()
            .unwrap();

        let item = WorkItem::new(mixed_datum(2));
        let completion = item.completion().clone();
        collector.process("test-writer", item);

        assert!(completion.wait().is_success());
        assert_eq!(dao.calls(), 1);
        assert_eq!(collector.stats().get(StatCounter::WorkItemCancelled), 0);
    }
}
