use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the queue collection.
///
/// Everything else (shutdown, missing queues, full queues) is reported
/// through return values: `Ok(false)` from adds, `None` from reads.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue path {0:?} is not a writable directory")]
    InaccessibleQueuePath(PathBuf),

    #[error("illegal queue name: {0:?}")]
    IllegalName(String),

    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
}
