use datum_collector::prelude::*;
use datum_collector::test::mixed_datum;
use datum_collector::test::stream_datum;
use datum_collector::test::wait_until;
use datum_collector::test::RecordingDao;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(10);

fn collector(dao: &Arc<RecordingDao>, cache: &Arc<WriteAheadCache>) -> Arc<CacheCollector> {
    CacheCollector::builder()
        .dao(dao.clone())
        .cache(cache.clone())
        .name("tc")
        .queue_capacity(4)
        .writer_threads(2)
        .idle_refill_interval(Duration::from_millis(20))
        .shutdown_wait(Duration::from_secs(5))
        .stats_log_frequency(0)
        .build()
        .unwrap()
}

#[test]
fn drains_everything_put_into_the_cache() {
    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));
    let collector = collector(&dao, &cache);
    collector.startup().unwrap();

    for i in 0..100 {
        collector.collect(mixed_datum(i)).unwrap();
    }

    assert!(wait_until(PATIENCE, || cache.is_empty() && dao.distinct_stored() == 100));
    assert!(collector.shutdown_and_wait());

    let stats = collector.stats();
    assert_eq!(stats.stored_total(), 100);
    assert_eq!(stats.failed_total(), 0);
    assert_eq!(stats.get(StatCounter::BufferAdds), 100);
    assert_eq!(stats.get(StatCounter::BufferRemovals), 100);
    assert_eq!(dao.total_stored(), 100, "nothing is stored twice");
    assert_eq!(dao.overlaps(), 0);
    assert_eq!(dao.transactions(), dao.calls());
}

#[test]
fn backlog_beyond_queue_capacity_is_picked_up_by_refill() {
    let dao = Arc::new(RecordingDao::with_latency(Duration::from_millis(5)));
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));

    // Present before the collector starts.
    for i in 0..30 {
        cache.put(stream_datum("early", i)).unwrap();
    }

    let collector = CacheCollector::builder()
        .dao(dao.clone())
        .cache(cache.clone())
        .queue_capacity(2)
        .writer_threads(1)
        .stats_log_frequency(0)
        .build()
        .unwrap();
    collector.startup().unwrap();

    for i in 0..20 {
        collector.collect(stream_datum("late", i)).unwrap();
    }

    assert!(wait_until(PATIENCE, || cache.is_empty()));
    assert_eq!(dao.distinct_stored(), 50);
    assert!(collector.stats().get(StatCounter::QueueFull) > 0);
    assert!(collector.shutdown_and_wait());
}

#[test]
fn failed_datum_stays_in_cache_until_stored() {
    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));
    let reported = Arc::new(Mutex::new(Vec::<String>::new()));
    let hook_reported = reported.clone();

    let collector = CacheCollector::builder()
        .dao(dao.clone())
        .cache(cache.clone())
        .name("retry")
        .idle_refill_interval(Duration::from_millis(20))
        .error_hook(Arc::new(move |thread: &str, _err: &CollectorError| {
            hook_reported.lock().push(thread.to_string());
        }))
        .stats_log_frequency(0)
        .build()
        .unwrap();

    let datum = stream_datum("flaky", 1);
    let key = datum.key();
    dao.fail_key(key.clone());
    collector.startup().unwrap();
    collector.collect(datum).unwrap();

    assert!(wait_until(PATIENCE, || collector.stats().failed_total() >= 2));
    assert!(cache.get(&key).is_some());
    assert_eq!(dao.store_count(&key), 0);

    dao.heal();
    assert!(wait_until(PATIENCE, || cache.is_empty()));
    assert_eq!(dao.store_count(&key), 1);

    let reported = reported.lock();
    assert!(!reported.is_empty());
    assert!(reported.iter().all(|name| name.starts_with("retry-writer-")));
    drop(reported);
    assert!(collector.shutdown_and_wait());
}

#[test]
fn panicking_dao_and_hook_do_not_kill_writers() {
    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));
    let collector = CacheCollector::builder()
        .dao(dao.clone())
        .cache(cache.clone())
        .writer_threads(2)
        .idle_refill_interval(Duration::from_millis(20))
        .error_hook(Arc::new(|_thread: &str, _err: &CollectorError| panic!("hook blew up")))
        .stats_log_frequency(0)
        .build()
        .unwrap();
    collector.startup().unwrap();

    dao.panic_next(3);
    for i in 0..10 {
        collector.collect(mixed_datum(i)).unwrap();
    }

    assert!(wait_until(PATIENCE, || cache.is_empty()));
    assert_eq!(dao.distinct_stored(), 10);
    assert_eq!(collector.stats().failed_total(), 3);
    assert_eq!(collector.live_writers(), 2);
    assert!(collector.shutdown_and_wait());
}

#[test]
fn update_during_store_is_stored_as_well() {
    let dao = Arc::new(RecordingDao::with_latency(Duration::from_millis(200)));
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));
    let collector = collector(&dao, &cache);
    collector.startup().unwrap();

    let first = stream_datum("meter", 1);
    let key = first.key();
    let mut second = first.clone();
    if let Datum::Stream(ref mut s) = second {
        s.samples.instantaneous.insert("watts".to_string(), 2.0);
    }

    collector.collect(first.clone()).unwrap();
    assert!(wait_until(PATIENCE, || dao.is_storing(&key)));
    collector.collect(second.clone()).unwrap();

    assert!(wait_until(PATIENCE, || dao.store_count(&key) == 2 && cache.is_empty()));
    assert_eq!(dao.stored_versions(&key), vec![first, second]);
    assert!(collector.shutdown_and_wait());
}

#[test]
fn update_events_are_counted_separately() {
    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));
    let collector = collector(&dao, &cache);

    let datum = stream_datum("sticky", 7);
    dao.fail_key(datum.key());
    collector.startup().unwrap();

    collector.collect(datum.clone()).unwrap();
    collector.collect(datum).unwrap();

    let stats = collector.stats();
    assert_eq!(stats.get(StatCounter::BufferAdds), 1);
    assert_eq!(stats.get(StatCounter::BufferUpdates), 1);
    assert_eq!(stats.get(StatCounter::BufferRemovals), 0);
    assert!(collector.shutdown_and_wait());
}

#[test]
fn health_check_compares_lag_with_threshold() {
    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));
    let collector = CacheCollector::builder()
        .dao(dao)
        .cache(cache)
        .alert_threshold(500)
        .stats_log_frequency(0)
        .build()
        .unwrap();

    collector.stats().add(StatCounter::BufferAdds, 1_000);
    collector.stats().add(StatCounter::BufferRemovals, 400);
    let status = collector.check();
    assert!(!status.is_healthy());
    assert_eq!(status.property("lag"), Some(600.0));
    assert_eq!(status.property("cache_capacity"), Some(1_000.0));

    collector.stats().add(StatCounter::BufferRemovals, 200);
    let status = collector.check();
    assert!(status.is_healthy(), "{status}");
    assert_eq!(status.property("lag"), Some(400.0));
}

#[test]
fn startup_is_idempotent_and_restartable() {
    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));
    let collector = collector(&dao, &cache);

    collector.startup().unwrap();
    collector.startup().unwrap();
    assert!(collector.is_running());
    assert!(wait_until(PATIENCE, || collector.live_writers() == 2));

    assert!(collector.shutdown_and_wait());
    assert!(!collector.is_running());
    assert_eq!(collector.live_writers(), 0);

    // Not closed on shutdown: accepted and kept until the collector is back.
    collector.collect(stream_datum("offline", 1)).unwrap();
    assert_eq!(cache.len(), 1);

    collector.startup().unwrap();
    assert!(wait_until(PATIENCE, || cache.is_empty()));
    assert!(collector.shutdown_and_wait());
}

#[test]
fn closing_the_cache_on_shutdown_rejects_new_datum() {
    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::new("buffer", 1_000));
    let collector = CacheCollector::builder()
        .dao(dao)
        .cache(cache.clone())
        .close_cache_on_shutdown(true)
        .stats_log_frequency(0)
        .build()
        .unwrap();

    collector.startup().unwrap();
    assert!(collector.shutdown_and_wait());
    assert!(matches!(
        collector.collect(stream_datum("late", 1)),
        Err(CollectorError::NotRunning)
    ));
}

#[test]
fn journal_backlog_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buffer.journal");

    {
        let cache = WriteAheadCache::open("buffer", 1_000, &path, true).unwrap();
        for i in 0..25 {
            cache.put(mixed_datum(i)).unwrap();
        }
        cache.close();
    }

    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::open("buffer", 1_000, &path, true).unwrap());
    assert_eq!(cache.len(), 25);

    let collector = collector(&dao, &cache);
    collector.startup().unwrap();
    assert!(wait_until(PATIENCE, || cache.is_empty()));
    assert_eq!(dao.distinct_stored(), 25);
    assert!(collector.shutdown_and_wait());

    drop(collector);
    drop(cache);
    let reopened = WriteAheadCache::open("buffer", 1_000, &path, false).unwrap();
    assert!(reopened.is_empty());
}

#[test]
fn invalid_refill_ratio_is_rejected() {
    let dao = Arc::new(RecordingDao::new());
    let cache = Arc::new(WriteAheadCache::new("buffer", 10));
    let collector = CacheCollector::builder()
        .dao(dao)
        .cache(cache)
        .refill_ratio(0.0)
        .build()
        .unwrap();

    assert!(matches!(collector.startup(), Err(CollectorError::Config(_))));
    assert!(!collector.is_running());
}
