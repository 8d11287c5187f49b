use std::error::Error as StdError;
use thiserror::Error;

pub type Result<T, E = CollectorError> = std::result::Result<T, E>;

/// Failures reported by a storage DAO.
#[derive(Debug, Error)]
pub enum DaoError {
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

/// Failures reported by a remote durable queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("queue not found: {0}")]
    NotFound(String),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue request timed out")]
    Timeout,
    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    /// Errors which retrying cannot fix. A reader thread hitting one of these stops for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::AccessDenied(_) | QueueError::NotFound(_) | QueueError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("DAO error: {0}")]
    Dao(#[from] DaoError),
    #[error("remote queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("journal I/O error: {0}")]
    Journal(#[from] std::io::Error),
    #[error("journal encoding error: {0}")]
    JournalEncoding(#[from] postcard::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("persistence attempt panicked: {0}")]
    Panicked(String),
    #[error("collector is not running")]
    NotRunning,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("overflow failed: remote queue error '{remote}', direct persist error '{fallback}'")]
    Overflow { remote: QueueError, fallback: DaoError },
}

impl CollectorError {
    pub(crate) fn config<E: std::fmt::Display>(err: E) -> Self {
        CollectorError::Config(err.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        }
        else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        }
        else {
            "non-string panic payload".to_string()
        };
        CollectorError::Panicked(message)
    }
}

/// Walk the `source()` chain down to the innermost error.
pub fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut cause = err;
    while let Some(next) = cause.source() {
        cause = next;
    }
    cause
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_nested_sources() {
        let err = CollectorError::Dao(DaoError::Other(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "peer went away",
        ))));
        assert_eq!(root_cause(&err).to_string(), "peer went away");
    }

    #[test]
    fn fatal_queue_errors() {
        assert!(QueueError::AccessDenied("nope".into()).is_fatal());
        assert!(QueueError::Closed.is_fatal());
        assert!(!QueueError::Timeout.is_fatal());
        assert!(!QueueError::Unavailable("503".into()).is_fatal());
    }
}
