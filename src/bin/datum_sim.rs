//! Load simulation for [`OverflowCollector`].
//!
//! Producer threads submit random datum to an overflow collector wired to an in-memory remote queue and a DAO with
//! configurable latency and failure rate. When all producers are done the simulation waits for the remote queue to
//! drain, prints health and statistics and verifies that every submitted datum was stored at least once.

use anyhow::bail;
use anyhow::Result;
use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use datum_collector::prelude::*;
use datum_collector::test::mixed_datum;
use datum_collector::test::wait_until;
use datum_collector::test::RecordingDao;
use fieldx::fxstruct;
use garde::Validate;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tracing::info;
use tracing::warn;

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "datum-sim")]
struct Cli {
    /// Number of producer threads.
    #[clap(long, default_value_t = 4, env = "DATUM_SIM_PRODUCERS")]
    #[garde(range(min = 1))]
    producers: usize,

    /// Datum submitted by every producer.
    #[clap(long, default_value_t = 1_000)]
    #[garde(range(min = 1))]
    datum_per_producer: usize,

    /// Capacity of the collector's local work queue.
    #[clap(long, default_value_t = 200)]
    #[garde(range(min = 1))]
    queue_capacity: usize,

    #[clap(long, default_value_t = 2)]
    #[garde(range(min = 1))]
    writers: usize,

    #[clap(long, default_value_t = 1)]
    #[garde(range(min = 1))]
    readers: usize,

    /// How long a producer waits for a local writer, in milliseconds.
    #[clap(long, default_value_t = 50)]
    #[garde(skip)]
    max_wait_ms: u64,

    /// Simulated DAO latency per store, in milliseconds.
    #[clap(long, default_value_t = 2)]
    #[garde(skip)]
    dao_latency_ms: u64,

    /// Probability of a DAO store failing.
    #[clap(long, default_value_t = 0.01)]
    #[garde(range(min = 0.0, max = 1.0))]
    failure_rate: f64,

    /// Visibility timeout of the in-memory remote queue, in milliseconds.
    #[clap(long, default_value_t = 500)]
    #[garde(range(min = 1))]
    visibility_ms: u64,

    /// How long to wait for the pipeline to drain after the producers finish, in seconds.
    #[clap(long, default_value_t = 60)]
    #[garde(range(min = 1))]
    drain_timeout: u64,
}

// Fails stores at random, delegating the rest to the recording DAO.
struct FlakyDao {
    inner:        Arc<RecordingDao>,
    failure_rate: f64,
    injected:     AtomicU64,
}

impl FlakyDao {
    fn maybe_fail(&self, key: &DatumKey) -> Result<(), DaoError> {
        if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(DaoError::Storage(format!("simulated failure storing {key}")));
        }
        Ok(())
    }
}

impl DatumDao for FlakyDao {
    fn store_stream(&self, datum: &StreamDatum) -> Result<DatumKey, DaoError> {
        self.maybe_fail(&Datum::Stream(datum.clone()).key())?;
        self.inner.store_stream(datum)
    }

    fn store_node(&self, datum: &NodeDatum) -> Result<DatumKey, DaoError> {
        self.maybe_fail(&Datum::Node(datum.clone()).key())?;
        self.inner.store_node(datum)
    }

    fn store_location(&self, datum: &LocationDatum) -> Result<DatumKey, DaoError> {
        self.maybe_fail(&Datum::Location(datum.clone()).key())?;
        self.inner.store_location(datum)
    }
}

fn setup_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = cli.validate() {
        let mut cmd = Cli::command();
        cmd.error(ErrorKind::InvalidValue, err).exit();
    }

    setup_tracing()?;

    let recording = Arc::new(RecordingDao::with_latency(Duration::from_millis(cli.dao_latency_ms())));
    let dao = Arc::new(FlakyDao {
        inner:        recording.clone(),
        failure_rate: cli.failure_rate(),
        injected:     AtomicU64::new(0),
    });
    let queue = Arc::new(MemoryQueue::with_visibility_timeout(
        "sim-remote",
        Duration::from_millis(cli.visibility_ms()),
    ));

    let collector = OverflowCollector::builder()
        .dao(dao.clone())
        .queue(queue.clone())
        .name("sim")
        .queue_capacity(cli.queue_capacity())
        .writer_threads(cli.writers())
        .reader_threads(cli.readers())
        .work_item_max_wait(Duration::from_millis(cli.max_wait_ms()))
        .receive_wait(Duration::from_millis(100))
        .read_sleep_min(Duration::from_millis(10))
        .read_sleep_max(Duration::from_millis(500))
        .read_sleep_step(Duration::from_millis(10))
        .shutdown_wait(Duration::from_secs(5))
        .build()?;
    collector.startup()?;

    let started = Instant::now();
    let next_index = Arc::new(AtomicI64::new(0));
    let mut producers = Vec::with_capacity(cli.producers());
    for id in 0..cli.producers() {
        let collector = collector.clone();
        let next_index = next_index.clone();
        let count = cli.datum_per_producer();
        producers.push(
            thread::Builder::new()
                .name(format!("producer-{id}"))
                .spawn(move || {
                    let mut submitted = Vec::with_capacity(count);
                    let mut rejected = 0usize;
                    for _ in 0..count {
                        let datum = mixed_datum(next_index.fetch_add(1, Ordering::Relaxed));
                        let key = datum.key();
                        match collector.persist(datum) {
                            Ok(()) => submitted.push(key),
                            Err(err) => {
                                warn!("Producer {id} lost {key}: {err}");
                                rejected += 1;
                            }
                        }
                    }
                    (submitted, rejected)
                })?,
        );
    }

    let mut submitted = HashSet::new();
    let mut rejected = 0;
    for producer in producers {
        match producer.join() {
            Ok((keys, lost)) => {
                submitted.extend(keys);
                rejected += lost;
            }
            Err(_) => bail!("a producer thread panicked"),
        }
    }
    info!("Producers finished in {:?}", started.elapsed());

    let drained = wait_until(Duration::from_secs(cli.drain_timeout()), || {
        queue.is_empty() && submitted.iter().all(|key| recording.store_count(key) > 0)
    });

    let health = collector.check();
    collector.shutdown_and_wait();

    let missing = submitted
        .iter()
        .filter(|key| recording.store_count(key) == 0)
        .count();
    let stats = collector.stats();

    println!("Elapsed:           {:?}", started.elapsed());
    println!("Submitted:         {}", submitted.len());
    println!("Rejected:          {rejected}");
    println!("Stored (distinct): {}", recording.distinct_stored());
    println!("Stored (total):    {}", recording.total_stored());
    println!("Injected failures: {}", dao.injected.load(Ordering::Relaxed));
    println!("Health:            {health}");
    println!("Statistics:");
    for (name, value) in stats.snapshot() {
        println!("  {name:<28} {value}");
    }

    if !drained || missing > 0 || rejected > 0 {
        bail!("{missing} submitted datum never stored, {rejected} rejected");
    }
    Ok(())
}
