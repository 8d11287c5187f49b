use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;

use crate::error::QueueError;
use crate::traits::DurableQueue;
use crate::types::BatchOutcome;
use crate::types::QueueAttributes;
use crate::types::QueueMessage;
use crate::types::ReceiptHandle;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct StoredMessage {
    id:            String,
    body:          String,
    visible_at:    Instant,
    // Only the handle of the latest delivery is valid.
    receipt:       Option<ReceiptHandle>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    messages:     Vec<StoredMessage>,
    next_id:      u64,
    next_receipt: u64,
}

/// In-process queue with at-least-once delivery semantics.
///
/// Received messages stay in the queue, invisible, until deleted by their current receipt handle or until the
/// visibility timeout expires and they are delivered again.
#[derive(Debug)]
pub struct MemoryQueue {
    name:               String,
    state:              Mutex<QueueState>,
    available:          Condvar,
    visibility_timeout: Duration,
    closed:             AtomicBool,
}

impl MemoryQueue {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self::with_visibility_timeout(name, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout<S: Into<String>>(name: S, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            visibility_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of messages held, visible or not.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every following call fail with [`QueueError::Closed`] and wake up pending receivers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_all();
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        }
        else {
            Ok(())
        }
    }
}

impl DurableQueue for MemoryQueue {
    fn send(&self, body: String) -> Result<String, QueueError> {
        self.check_open()?;
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = format!("{}-{}", self.name, state.next_id);
            state.messages.push(StoredMessage {
                id: id.clone(),
                body,
                visible_at: Instant::now(),
                receipt: None,
                receive_count: 0,
            });
            id
        };
        self.available.notify_one();
        Ok(id)
    }

    fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        loop {
            self.check_open()?;

            let now = Instant::now();
            let mut received = Vec::new();
            let QueueState {
                messages, next_receipt, ..
            } = &mut *state;
            for message in messages.iter_mut().filter(|m| m.visible_at <= now).take(max) {
                *next_receipt += 1;
                let receipt = format!("{}#{}", message.id, next_receipt);
                message.receipt = Some(receipt.clone());
                message.visible_at = now + self.visibility_timeout;
                message.receive_count += 1;
                received.push(QueueMessage {
                    message_id:     message.id.clone(),
                    receipt_handle: receipt,
                    body:           message.body.clone(),
                    receive_count:  message.receive_count,
                });
            }

            if !received.is_empty() || now >= deadline {
                return Ok(received);
            }

            // Wake up either at the deadline or when the earliest in-flight message becomes visible again.
            let wake_at = messages
                .iter()
                .map(|m| m.visible_at)
                .filter(|at| *at > now)
                .min()
                .map_or(deadline, |at| at.min(deadline));
            self.available.wait_until(&mut state, wake_at);
        }
    }

    fn delete_batch(&self, handles: &[ReceiptHandle]) -> Result<BatchOutcome, QueueError> {
        self.check_open()?;
        let mut outcome = BatchOutcome::default();
        let mut state = self.state.lock();
        for handle in handles {
            let position = state
                .messages
                .iter()
                .position(|m| m.receipt.as_deref() == Some(handle.as_str()));
            if let Some(position) = position {
                state.messages.remove(position);
                outcome.succeeded.push(handle.clone());
            }
            else {
                outcome.failed.push(handle.clone());
            }
        }
        debug!(
            "[{}] Deleted {} message(s), {} failed",
            self.name,
            outcome.succeeded.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    fn change_visibility_batch(
        &self,
        handles: &[ReceiptHandle],
        visibility: Duration,
    ) -> Result<BatchOutcome, QueueError> {
        self.check_open()?;
        let mut outcome = BatchOutcome::default();
        {
            let mut state = self.state.lock();
            let visible_at = Instant::now() + visibility;
            for handle in handles {
                match state
                    .messages
                    .iter_mut()
                    .find(|m| m.receipt.as_deref() == Some(handle.as_str()))
                {
                    Some(message) => {
                        message.visible_at = visible_at;
                        outcome.succeeded.push(handle.clone());
                    }
                    None => outcome.failed.push(handle.clone()),
                }
            }
        }
        self.available.notify_all();
        Ok(outcome)
    }

    fn attributes(&self, _timeout: Duration) -> Result<QueueAttributes, QueueError> {
        self.check_open()?;
        let now = Instant::now();
        let state = self.state.lock();
        let visible = state.messages.iter().filter(|m| m.visible_at <= now).count() as u64;
        Ok(QueueAttributes {
            visible,
            in_flight: state.messages.len() as u64 - visible,
        })
    }
}
