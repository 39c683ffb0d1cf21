//! Queue item type shared by the journal, the queue engine and the facade.

use bytes::Bytes;

/// A single enqueued payload.
///
/// `xid` is zero until the item is handed out by a transactional remove;
/// from then on it identifies the open reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Enqueue time, UNIX milliseconds.
    pub add_time: u64,
    /// Absolute expiration time, UNIX milliseconds. `None` = never.
    pub expiry: Option<u64>,
    pub data: Bytes,
    pub xid: u64,
}

impl QueueItem {
    pub fn new(data: impl Into<Bytes>, expiry: Option<u64>, add_time: u64) -> Self {
        Self {
            add_time,
            expiry,
            data: data.into(),
            xid: 0,
        }
    }

    /// Whether the item is expired as of `now` (UNIX milliseconds).
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expiry, Some(e) if e <= now)
    }
}

/// Returns the current system time as a UNIX timestamp in milliseconds.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before Unix epoch")
        .as_millis() as u64
}
