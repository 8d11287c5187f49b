use moka::ops::compute::CompResult;
use moka::ops::compute::Op;
use moka::sync::Cache;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::error::CollectorError;
use crate::error::Result;
use crate::journal::Journal;
use crate::traits::CacheListener;
use crate::traits::DatumCache;
use crate::types::CacheStats;
use crate::types::Datum;
use crate::types::DatumKey;
use crate::types::ListenerId;

const DEFAULT_COMPACT_THRESHOLD: u64 = 10_000;

enum CacheEvent {
    Created,
    Updated,
    Removed,
}

/// Keyed buffer of datum pending persistence.
///
/// An in-memory `moka` cache which never evicts; entries leave it only through [`DatumCache::remove`]. With a journal
/// attached every mutation is appended to disk before it becomes visible, and the content survives a restart.
///
/// ```ignore
/// let cache = Arc::new(WriteAheadCache::open("datum", 10_000, "/var/lib/datum/buffer.journal", false)?);
/// cache.put(datum)?;
/// ```
pub struct WriteAheadCache {
    name:              String,
    cache:             Cache<DatumKey, Datum>,
    capacity:          u64,
    size:              AtomicU64,
    high_water_mark:   AtomicU64,
    listeners:         RwLock<Vec<(ListenerId, Arc<dyn CacheListener>)>>,
    next_listener_id:  AtomicU64,
    // Serializes journal appends with the matching cache mutation so that replay order equals mutation order.
    journal:           Option<Mutex<Journal>>,
    compact_threshold: u64,
    closed:            AtomicBool,
}

impl WriteAheadCache {
    /// In-memory only cache. `capacity` is a soft limit reported in diagnostics; nothing is ever evicted.
    pub fn new<S: Into<String>>(name: S, capacity: u64) -> Self {
        let name = name.into();
        Self {
            cache: Self::build_cache(&name),
            name,
            capacity,
            size: AtomicU64::new(0),
            high_water_mark: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            journal: None,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            closed: AtomicBool::new(false),
        }
    }

    /// Cache backed by the journal at `path`. Whatever the journal holds is loaded back as pending entries.
    pub fn open<S: Into<String>, P: AsRef<Path>>(name: S, capacity: u64, path: P, sync_writes: bool) -> Result<Self> {
        let mut cache = Self::new(name, capacity);
        let (journal, live) = Journal::open(path, sync_writes)?;

        let restored = live.len() as u64;
        for (key, datum) in live {
            cache.cache.insert(key, datum);
        }
        cache.size.store(restored, Ordering::Relaxed);
        cache.high_water_mark.store(restored, Ordering::Relaxed);
        cache.journal = Some(Mutex::new(journal));

        if restored > 0 {
            info!("[{}] Restored {restored} pending datum from journal", cache.name);
        }
        Ok(cache)
    }

    /// Compact the journal once it holds more than this many frames and dead frames outnumber live entries.
    pub fn with_compact_threshold(mut self, threshold: u64) -> Self {
        self.compact_threshold = threshold;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn build_cache(name: &str) -> Cache<DatumKey, Datum> {
        Cache::builder().name(name).build()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CollectorError::NotRunning)
        }
        else {
            Ok(())
        }
    }

    fn note_inserted(&self) {
        let size = self.size.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water_mark.fetch_max(size, Ordering::AcqRel);
    }

    // The entry is already gone from memory at this point; a journal failure only means it may be replayed and stored
    // once more after a restart.
    fn journal_removal(&self, journal: &mut Journal, key: &DatumKey) {
        if let Err(err) = journal.append_remove(key) {
            error!(
                "[{}] Failed to journal removal of '{key}' in {}: {err}",
                self.name,
                journal.path().display()
            );
        }
        else if let Err(err) = self.maybe_compact(journal) {
            error!(
                "[{}] Failed to compact journal {}: {err}",
                self.name,
                journal.path().display()
            );
        }
    }

    fn remove_matching(&self, key: &DatumKey, expected: Option<&Datum>) -> Option<Datum> {
        let removed = {
            let mut journal = self.journal.as_ref().map(|j| j.lock());
            let result = self.cache.entry(key.clone()).and_compute_with(|existing| match existing {
                Some(entry) if expected.is_none_or(|e| entry.value().same_version(e)) => {
                    self.size.fetch_sub(1, Ordering::AcqRel);
                    Op::Remove
                }
                _ => Op::Nop,
            });

            match result {
                CompResult::Removed(entry) => {
                    if let Some(journal) = journal.as_mut() {
                        self.journal_removal(journal, key);
                    }
                    Some(entry.into_value())
                }
                _ => None,
            }
        };

        if let Some(ref datum) = removed {
            self.notify(CacheEvent::Removed, key, datum);
        }
        removed
    }

    fn maybe_compact(&self, journal: &mut Journal) -> Result<()> {
        let frames = journal.frames();
        let live = self.size.load(Ordering::Acquire);
        if frames > self.compact_threshold && frames - live > live {
            let entries = self.cache.iter().map(|(_, datum)| datum).collect::<Vec<_>>();
            journal.compact(entries.iter())?;
        }
        Ok(())
    }

    fn notify(&self, event: CacheEvent, key: &DatumKey, datum: &Datum) {
        let listeners = self.listeners.read().iter().map(|(_, l)| l.clone()).collect::<Vec<_>>();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| match event {
                CacheEvent::Created => listener.on_created(key, datum),
                CacheEvent::Updated => listener.on_updated(key, datum),
                CacheEvent::Removed => listener.on_removed(key, datum),
            }));
            if outcome.is_err() {
                error!("[{}] Cache listener panicked while handling '{key}'", self.name);
            }
        }
    }
}

impl DatumCache for WriteAheadCache {
    fn get(&self, key: &DatumKey) -> Option<Datum> {
        self.cache.get(key)
    }

    fn put(&self, datum: Datum) -> Result<()> {
        self.check_open()?;
        let key = datum.key();

        let result = {
            let mut journal = self.journal.as_ref().map(|j| j.lock());
            if let Some(journal) = journal.as_mut() {
                journal.append_put(&datum)?;
            }
            let value = datum.clone();
            self.cache.entry(key.clone()).and_compute_with(|existing| {
                // Count under the key lock so a concurrent remove of the same key can't be accounted first.
                if existing.is_none() {
                    self.note_inserted();
                }
                Op::Put(value)
            })
        };

        match result {
            CompResult::Inserted(_) => self.notify(CacheEvent::Created, &key, &datum),
            CompResult::ReplacedWith(_) => self.notify(CacheEvent::Updated, &key, &datum),
            _ => (),
        }
        Ok(())
    }

    fn remove(&self, key: &DatumKey) -> Result<Option<Datum>> {
        Ok(self.remove_matching(key, None))
    }

    fn remove_if(&self, key: &DatumKey, expected: &Datum) -> Result<Option<Datum>> {
        Ok(self.remove_matching(key, Some(expected)))
    }

    fn keys(&self) -> Vec<DatumKey> {
        self.cache.iter().map(|(key, _)| (*key).clone()).collect()
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Acquire) as usize
    }

    fn subscribe(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        debug!("[{}] Listener {id:?} subscribed", self.name);
        id
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        before != listeners.len()
    }

    fn stats(&self) -> Option<CacheStats> {
        Some(CacheStats {
            size:            self.size.load(Ordering::Acquire),
            capacity:        self.capacity,
            high_water_mark: self.high_water_mark.load(Ordering::Acquire),
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(journal) = self.journal.as_ref() {
            let journal = journal.lock();
            if let Err(err) = journal.sync() {
                error!(
                    "[{}] Failed to sync journal {} on close: {err}",
                    self.name,
                    journal.path().display()
                );
            }
        }
        info!("[{}] Cache closed with {} pending datum", self.name, self.len());
    }
}
