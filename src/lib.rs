//! # datum-collector
//!
//! Backpressure-aware persistence pipeline for telemetry datum.
//!
//! Producers hand over datum at whatever rate they arrive; the pipeline stores them through a [`DatumDao`] using a
//! bounded pool of writer threads and makes sure that nothing is lost when the storage can't keep up. Two collectors
//! are provided, each with its own strategy for absorbing load spikes.
//!
//! # Cache-Backed Collector
//!
//! [`CacheCollector`] sits behind a durable buffer cache. Producers put datum into the cache; the collector reacts to
//! creation events and dispatches keys to its writers through a bounded queue. Keys which don't fit into the queue are
//! simply left in the cache and picked up by a refill scan once the queue drains. A datum is removed from the cache
//! only after it was stored, so a crash loses nothing if the cache survives it. [`WriteAheadCache`] is such a cache:
//! a [moka](https://crates.io/crates/moka) cache backed by an append-only journal.
//!
//! # Durable-Queue Overflow Collector
//!
//! [`OverflowCollector`] keeps a bounded local work queue and a remote [`DurableQueue`]. A producer calling
//! [`OverflowCollector::persist`] waits a bounded time for a local writer. If the local side is saturated, the datum is
//! sent to the remote queue, and if the remote queue is down too, it is stored directly from the producer thread.
//! Reader threads pull remote messages back into the local queue when there is capacity, and delete them remotely only
//! once stored.
//!
//! Both collectors guarantee at-least-once delivery: the DAO must tolerate storing the same datum twice.
//!
//! # Threads
//!
//! Workers are named OS threads (`<collector>-writer-N`, `<collector>-reader-N`). Nothing here needs an async
//! runtime; a DAO is free to block.
//!
//! ```ignore
//! let collector = OverflowCollector::builder()
//!     .dao(dao)
//!     .queue(queue)
//!     .writer_threads(4)
//!     .work_item_max_wait(Duration::from_secs(2))
//!     .build()?;
//! collector.startup()?;
//!
//! collector.persist(datum)?;
//!
//! collector.shutdown_and_wait();
//! ```

pub mod cache;
pub mod cache_collector;
pub mod completion;
pub mod deleter;
pub mod error;
pub mod health;
pub(crate) mod journal;
pub mod memory_queue;
pub mod message;
pub mod overflow_collector;
pub mod stats;
pub mod throttle;
pub mod traits;
pub mod types;
pub mod work;
pub mod worker;

#[doc(inline)]
pub use cache::WriteAheadCache;
#[doc(inline)]
pub use cache_collector::CacheCollector;
#[doc(inline)]
pub use error::CollectorError;
#[doc(inline)]
pub use overflow_collector::OverflowCollector;
#[doc(inline)]
pub use traits::DatumCache;
#[doc(inline)]
pub use traits::DatumDao;
#[doc(inline)]
pub use traits::DurableQueue;

pub mod prelude {
    pub use crate::cache::WriteAheadCache;
    pub use crate::cache_collector::CacheCollector;
    pub use crate::completion::Completion;
    pub use crate::completion::Outcome;
    pub use crate::error::CollectorError;
    pub use crate::error::DaoError;
    pub use crate::error::QueueError;
    pub use crate::health::HealthStatus;
    pub use crate::memory_queue::MemoryQueue;
    pub use crate::overflow_collector::OverflowCollector;
    pub use crate::stats::CollectorStats;
    pub use crate::stats::StatCounter;
    pub use crate::traits::*;
    pub use crate::types::*;
    pub use crate::worker::ErrorHook;
}
