use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::error::root_cause;
use crate::error::CollectorError;
use crate::error::Result;
use crate::traits::DatumDao;
use crate::types::Datum;
use crate::types::DatumKey;

/// Observer for errors raised while persisting a datum. Receives the name of the worker thread and the error.
pub type ErrorHook = Arc<dyn Fn(&str, &CollectorError) + Send + Sync + 'static>;

pub fn default_error_hook() -> ErrorHook {
    Arc::new(|thread_name, err| {
        debug!("Unhandled persistence error in {thread_name}: {err}");
    })
}

/// Invoke the hook, swallowing anything it might throw back at the worker.
pub(crate) fn report_error(hook: &ErrorHook, thread_name: &str, err: &CollectorError) {
    if catch_unwind(AssertUnwindSafe(|| hook(thread_name, err))).is_err() {
        error!("Error hook panicked in {thread_name} while reporting: {}", root_cause(err));
    }
}

/// Store a datum through the DAO inside its transaction boundary. A panicking DAO is reported as
/// [`CollectorError::Panicked`] instead of tearing down the calling thread.
pub(crate) fn persist_datum(dao: &dyn DatumDao, datum: &Datum) -> Result<DatumKey> {
    match catch_unwind(AssertUnwindSafe(|| dao.in_transaction(&mut || datum.store_with(dao)))) {
        Ok(result) => Ok(result?),
        Err(payload) => Err(CollectorError::from_panic(payload)),
    }
}

pub(crate) fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(CollectorError::Spawn)
}

pub(crate) fn current_thread_name() -> String {
    thread::current().name().unwrap_or("unnamed").to_string()
}

/// Sleep for `delay` unless shutdown is signalled first. Returns `true` when interrupted.
pub(crate) fn interruptible_sleep(shutdown: &Receiver<()>, delay: Duration) -> bool {
    !matches!(shutdown.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
}

pub(crate) fn dead_threads(handles: &[JoinHandle<()>]) -> usize {
    handles.iter().filter(|h| h.is_finished()).count()
}

/// Join every handle, waiting no longer than `wait` in total. Threads still running past the deadline are detached
/// and reported. Returns `true` if all of them finished.
pub(crate) fn join_all(owner: &str, handles: Vec<JoinHandle<()>>, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    let mut pending = handles;

    while !pending.is_empty() && Instant::now() < deadline {
        let (finished, running): (Vec<_>, Vec<_>) = pending.into_iter().partition(|h| h.is_finished());
        for handle in finished {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!("[{owner}] Thread {name} terminated with a panic");
            }
        }
        pending = running;
        if !pending.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
    }

    for straggler in pending.iter() {
        warn!(
            "[{owner}] Thread {} did not stop within {wait:?}; detaching it",
            straggler.thread().name().unwrap_or("unnamed")
        );
    }
    pending.is_empty()
}
