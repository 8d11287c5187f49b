//! Single-assignment completion signal.
//!
//! A [`Completion`] starts pending and is resolved exactly once: succeeded, failed or cancelled. Clones share the same
//! state, so the submitting side can wait on it while a writer thread resolves it. Callbacks registered with
//! [`Completion::on_resolve`] run on the thread which resolves the signal, outside of the internal lock.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crate::error::CollectorError;

#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Succeeded(T),
    Failed(Arc<CollectorError>),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }
}

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

struct State<T> {
    outcome:   Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
}

struct Inner<T> {
    state:    Mutex<State<T>>,
    resolved: Condvar,
}

pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Completion<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state:    Mutex::new(State {
                    outcome:   None,
                    callbacks: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Resolve with success. Returns `false` if the signal was already resolved.
    pub fn complete(&self, value: T) -> bool {
        self.resolve(Outcome::Succeeded(value))
    }

    /// Resolve with failure. Returns `false` if the signal was already resolved.
    pub fn fail(&self, err: CollectorError) -> bool {
        self.resolve(Outcome::Failed(Arc::new(err)))
    }

    /// Cancel a pending signal. Returns `false` if the signal was already resolved.
    pub fn cancel(&self) -> bool {
        self.resolve(Outcome::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Outcome::Cancelled))
    }

    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Block until resolved or until `timeout` elapses. `None` means the wait timed out.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.outcome.is_none() {
            if self.inner.resolved.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.outcome.clone()
    }

    pub fn wait(&self) -> Outcome<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = state.outcome.as_ref() {
                return outcome.clone();
            }
            self.inner.resolved.wait(&mut state);
        }
    }

    /// Register a callback for the resolution. If the signal is already resolved the callback runs immediately on the
    /// calling thread.
    pub fn on_resolve<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if let Some(outcome) = state.outcome.clone() {
            drop(state);
            callback(&outcome);
        }
        else {
            state.callbacks.push(Box::new(callback));
        }
    }

    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.inner.resolved.notify_all();
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }
}

impl<T> Debug for Completion<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Completion").field("outcome", &state.outcome).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[test]
    fn resolves_only_once() {
        let c = Completion::<u32>::new();
        assert!(c.complete(1));
        assert!(!c.complete(2));
        assert!(!c.cancel());
        assert!(matches!(c.outcome(), Some(Outcome::Succeeded(1))));
    }

    #[test]
    fn cancel_wins_over_late_completion() {
        let c = Completion::<u32>::new();
        assert!(c.cancel());
        assert!(c.is_cancelled());
        assert!(!c.complete(7));
    }

    #[test]
    fn wait_timeout_expires_on_pending() {
        let c = Completion::<u32>::new();
        let started = Instant::now();
        assert!(c.wait_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_sees_resolution_from_other_thread() {
        let c = Completion::<u32>::new();
        let other = c.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            other.complete(42);
        });
        assert!(matches!(c.wait_timeout(Duration::from_secs(5)), Some(Outcome::Succeeded(42))));
        handle.join().unwrap();
    }

    #[test]
    fn callbacks_run_once_on_resolution() {
        let c = Completion::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        c.on_resolve(move |outcome| {
            assert!(outcome.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        c.complete(3);
        c.complete(4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Late registration runs immediately.
        let counter = calls.clone();
        c.on_resolve(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
