//! The per-queue storage engine: a single durable FIFO with reservation
//! semantics, backed by an on-disk journal.
//!
//! All mutable state sits behind one `parking_lot::Mutex`; blocking reads
//! wait on a `tokio::sync::Notify` so the lock is never held across an
//! await point.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::QueueSettings;
use crate::core::error::BrokerError;
use crate::core::item::{current_timestamp, QueueItem};
use crate::core::journal::{Journal, JournalRecord, Replay};

/// Per-queue counters, dumped by `dump_stats` and zeroed by `reset_stats`.
#[derive(Debug, Default)]
struct QueueCounters {
    total_items: AtomicU64,
    expired_items: AtomicU64,
    discarded_items: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    waiters: AtomicU64,
}

#[derive(Debug)]
struct QueueState {
    settings: QueueSettings,
    items: VecDeque<QueueItem>,
    bytes: u64,
    /// Items handed to transactional readers, keyed by xid.
    open_reads: BTreeMap<u64, QueueItem>,
    next_xid: u64,
    journal: Option<Journal>,
    closed: bool,
    /// Bumped by `flush` so parked readers resolve with `None`.
    flush_epoch: u64,
    create_time: u64,
    last_add_time: u64,
    /// Expired items awaiting rerouting; drained by the collection when the
    /// queue's `expire_to` is set. The queue never calls back out itself.
    expired_handoff: Vec<QueueItem>,
}

/// A single durable FIFO queue.
#[derive(Debug)]
pub struct PersistentQueue {
    name: String,
    journal_path: PathBuf,
    state: Mutex<QueueState>,
    notify: Notify,
    counters: QueueCounters,
}

impl PersistentQueue {
    pub fn new(name: &str, root: &std::path::Path, settings: QueueSettings) -> Self {
        Self {
            name: name.to_string(),
            journal_path: root.join(name),
            state: Mutex::new(QueueState {
                settings,
                items: VecDeque::new(),
                bytes: 0,
                open_reads: BTreeMap::new(),
                next_xid: 0,
                journal: None,
                closed: false,
                flush_epoch: 0,
                create_time: current_timestamp(),
                last_add_time: 0,
                expired_handoff: Vec::new(),
            }),
            notify: Notify::new(),
            counters: QueueCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens and replays the journal. Must complete before the queue is
    /// published to clients. Outstanding reservations found in the journal
    /// are returned to the head, oldest first.
    pub fn setup(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if !state.settings.keep_journal {
            return Ok(());
        }

        let (mut journal, replay) = Journal::open(&self.journal_path)?;
        let Replay {
            items,
            open_reads,
            max_xid,
        } = replay;

        state.items = items;
        state.next_xid = max_xid;

        let recovered = open_reads.len();
        for (xid, mut item) in open_reads.into_iter().rev() {
            journal.append(&JournalRecord::Unremove(xid))?;
            item.xid = 0;
            state.items.push_front(item);
        }
        if recovered > 0 {
            journal.sync()?;
        }

        state.bytes = state.items.iter().map(|i| i.data.len() as u64).sum();
        if !state.items.is_empty() || recovered > 0 {
            info!(
                "queue {}: replayed {} items ({} recovered reservations)",
                self.name,
                state.items.len(),
                recovered
            );
        }
        state.journal = Some(journal);
        Ok(())
    }

    /// Enqueues one item, durably. Returns `Ok(false)` when the queue is
    /// closed, the item oversized, or the queue full with
    /// `discard_old_when_full` unset. The journal is fsynced before
    /// returning when `sync_journal` is on.
    pub fn add(
        &self,
        data: Bytes,
        expiry: Option<u64>,
        add_time: u64,
    ) -> Result<bool, BrokerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(false);
        }
        if data.len() > state.settings.max_item_size {
            debug!(
                "queue {}: refusing {}-byte item (max_item_size {})",
                self.name,
                data.len(),
                state.settings.max_item_size
            );
            return Ok(false);
        }

        while state.items.len() >= state.settings.max_items
            || state.bytes + data.len() as u64 > state.settings.max_size_bytes
        {
            if !state.settings.discard_old_when_full {
                return Ok(false);
            }
            let Some(dropped) = state.items.pop_front() else {
                // A single item can exceed max_size_bytes on an empty queue.
                return Ok(false);
            };
            state.bytes -= dropped.data.len() as u64;
            self.counters.discarded_items.fetch_add(1, Ordering::Relaxed);
            if let Some(journal) = &mut state.journal {
                journal.append(&JournalRecord::Remove)?;
            }
        }

        // max_age caps the effective expiry of every item.
        let capped = state.settings.max_age_ms.map(|age| add_time + age);
        let expiry = match (expiry, capped) {
            (Some(e), Some(c)) => Some(e.min(c)),
            (e, c) => e.or(c),
        };

        let item = QueueItem::new(data, expiry, add_time);
        let sync_journal = state.settings.sync_journal;
        if let Some(journal) = &mut state.journal {
            journal.append(&JournalRecord::Add {
                add_time,
                expiry,
                data: item.data.clone(),
            })?;
            if sync_journal {
                journal.sync()?;
            }
        }

        state.bytes += item.data.len() as u64;
        state.items.push_back(item);
        state.last_add_time = add_time;
        self.counters.total_items.fetch_add(1, Ordering::Relaxed);
        drop(state);

        self.notify.notify_waiters();
        Ok(true)
    }

    /// Dequeues the head item. With `deadline = None` the call returns
    /// immediately; otherwise it parks until an item arrives, the deadline
    /// elapses, the queue is flushed, or the queue is closed.
    ///
    /// A transactional remove leaves the item invisible under its xid until
    /// `confirm_remove` or `unremove`.
    pub async fn remove(
        &self,
        deadline: Option<Instant>,
        transactional: bool,
    ) -> Option<QueueItem> {
        self.wait_for(deadline, |counters, state| {
            Self::take_head(&self.name, counters, state, transactional)
        })
        .await
    }

    /// Like `remove`, but leaves the queue untouched (expired head items
    /// are still discarded).
    pub async fn peek(&self, deadline: Option<Instant>) -> Option<QueueItem> {
        self.wait_for(deadline, |counters, state| {
            Self::discard_expired_head(counters, state, None);
            state.items.front().cloned()
        })
        .await
    }

    /// Returns a reserved item to the head of the queue. Unknown xids are
    /// ignored.
    pub fn unremove(&self, xid: u64) {
        let mut state = self.state.lock();
        let Some(mut item) = state.open_reads.remove(&xid) else {
            return;
        };
        Self::journal_log(&mut state, &JournalRecord::Unremove(xid));
        item.xid = 0;
        state.bytes += item.data.len() as u64;
        state.items.push_front(item);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Discards a reserved item for good. Unknown xids are ignored.
    pub fn confirm_remove(&self, xid: u64) {
        let mut state = self.state.lock();
        if state.open_reads.remove(&xid).is_some() {
            Self::journal_log(&mut state, &JournalRecord::ConfirmRemove(xid));
            Self::maybe_rewrite(&self.name, &mut state);
        }
    }

    /// Drops every queued item (reservations survive). Parked readers
    /// resolve with `None`.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.items.len();
        if count > 0 {
            Self::journal_log(&mut state, &JournalRecord::Flush);
            state.items.clear();
            state.bytes = 0;
            self.counters
                .discarded_items
                .fetch_add(count as u64, Ordering::Relaxed);
            Self::maybe_rewrite(&self.name, &mut state);
        }
        state.flush_epoch += 1;
        drop(state);
        self.notify.notify_waiters();
        count
    }

    /// Discards expired items from the head, up to `limit`.
    pub fn discard_expired(&self, limit: Option<usize>) -> usize {
        let mut state = self.state.lock();
        let count = Self::discard_expired_head(&self.counters, &mut state, limit);
        if count > 0 {
            Self::maybe_rewrite(&self.name, &mut state);
        }
        count
    }

    /// Marks the queue closed, syncs and releases the journal, and wakes
    /// every parked reader. On-disk state is kept.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(mut journal) = state.journal.take() {
            if let Err(e) = journal.sync() {
                error!("queue {}: sync on close failed: {}", self.name, e);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Removes the on-disk journal (and any rewrite temp file). Call after
    /// `close`.
    pub fn destroy_journal(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(mut journal) = state.journal.take() {
            journal.erase()?;
            return Ok(());
        }
        drop(state);

        let mut temp = self.journal_path.clone().into_os_string();
        temp.push("~");
        for path in [self.journal_path.clone(), PathBuf::from(temp)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether the expiration sweep may delete this queue: a configured
    /// `max_queue_age_ms`, nothing queued or reserved, and no add since the
    /// age window opened.
    pub fn is_ready_for_expiration(&self) -> bool {
        let state = self.state.lock();
        let Some(age) = state.settings.max_queue_age_ms else {
            return false;
        };
        if !state.items.is_empty() || !state.open_reads.is_empty() {
            return false;
        }
        let reference = if state.last_add_time > 0 {
            state.last_add_time
        } else {
            state.create_time
        };
        current_timestamp() >= reference + age
    }

    /// Swaps the queue's settings in place (hot reload).
    pub fn update_settings(&self, settings: QueueSettings) {
        self.state.lock().settings = settings;
    }

    pub fn expire_to(&self) -> Option<String> {
        self.state.lock().settings.expire_to.clone()
    }

    /// Takes the expired items collected for rerouting since the last call.
    pub fn drain_expired(&self) -> Vec<QueueItem> {
        std::mem::take(&mut self.state.lock().expired_handoff)
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn open_reservations(&self) -> usize {
        self.state.lock().open_reads.len()
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.state.lock().settings.max_memory_bytes
    }

    pub fn dump_stats(&self) -> Vec<(String, String)> {
        let state = self.state.lock();
        let age = state
            .items
            .front()
            .map(|item| current_timestamp().saturating_sub(item.add_time))
            .unwrap_or(0);
        let logsize = state.journal.as_ref().map(|j| j.size()).unwrap_or(0);
        let counter = |c: &AtomicU64| c.load(Ordering::Relaxed).to_string();
        vec![
            ("items".into(), state.items.len().to_string()),
            ("bytes".into(), state.bytes.to_string()),
            ("total_items".into(), counter(&self.counters.total_items)),
            ("logsize".into(), logsize.to_string()),
            ("expired_items".into(), counter(&self.counters.expired_items)),
            ("discarded".into(), counter(&self.counters.discarded_items)),
            ("get_hits".into(), counter(&self.counters.get_hits)),
            ("get_misses".into(), counter(&self.counters.get_misses)),
            ("waiters".into(), counter(&self.counters.waiters)),
            (
                "open_transactions".into(),
                state.open_reads.len().to_string(),
            ),
            ("age_msec".into(), age.to_string()),
        ]
    }

    pub fn reset_stats(&self) {
        self.counters.total_items.store(0, Ordering::Relaxed);
        self.counters.expired_items.store(0, Ordering::Relaxed);
        self.counters.discarded_items.store(0, Ordering::Relaxed);
        self.counters.get_hits.store(0, Ordering::Relaxed);
        self.counters.get_misses.store(0, Ordering::Relaxed);
    }

    /// The shared wait discipline behind `remove` and `peek`: register for
    /// notification, try, then park until notified, flushed, closed, or
    /// timed out. `attempt` runs with the state lock held.
    async fn wait_for<F>(&self, deadline: Option<Instant>, mut attempt: F) -> Option<QueueItem>
    where
        F: FnMut(&QueueCounters, &mut QueueState) -> Option<QueueItem>,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the check so a notify between the
            // check and the await is not lost.
            notified.as_mut().enable();

            let epoch = {
                let mut state = self.state.lock();
                if state.closed {
                    self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                if let Some(item) = attempt(&self.counters, &mut state) {
                    self.counters.get_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(item);
                }
                state.flush_epoch
            };

            let Some(deadline) = deadline else {
                self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };

            self.counters.waiters.fetch_add(1, Ordering::Relaxed);
            let timed_out = tokio::select! {
                _ = &mut notified => false,
                _ = tokio::time::sleep_until(deadline) => true,
            };
            self.counters.waiters.fetch_sub(1, Ordering::Relaxed);

            let mut state = self.state.lock();
            if state.closed {
                self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            if timed_out || state.flush_epoch != epoch {
                // One last try so an item racing the deadline is not lost.
                let result = attempt(&self.counters, &mut state);
                match &result {
                    Some(_) => self.counters.get_hits.fetch_add(1, Ordering::Relaxed),
                    None => self.counters.get_misses.fetch_add(1, Ordering::Relaxed),
                };
                return result;
            }
        }
    }

    /// Pops the head item (after discarding expired ones) and journals the
    /// removal. Runs with the state lock held.
    fn take_head(
        name: &str,
        counters: &QueueCounters,
        state: &mut QueueState,
        transactional: bool,
    ) -> Option<QueueItem> {
        Self::discard_expired_head(counters, state, None);
        let mut item = state.items.pop_front()?;
        state.bytes -= item.data.len() as u64;

        if transactional {
            state.next_xid += 1;
            let xid = state.next_xid;
            item.xid = xid;
            Self::journal_log(state, &JournalRecord::RemoveTentative(xid));
            state.open_reads.insert(xid, item.clone());
        } else {
            Self::journal_log(state, &JournalRecord::Remove);
        }
        Self::maybe_rewrite(name, state);
        Some(item)
    }

    /// Discards expired items from the head, journaling each removal and
    /// collecting them for rerouting when `expire_to` is set.
    fn discard_expired_head(
        counters: &QueueCounters,
        state: &mut QueueState,
        limit: Option<usize>,
    ) -> usize {
        let now = current_timestamp();
        let mut count = 0;
        while limit.map_or(true, |l| count < l) {
            match state.items.front() {
                Some(item) if item.is_expired(now) => {
                    let item = state.items.pop_front().unwrap();
                    state.bytes -= item.data.len() as u64;
                    Self::journal_log(state, &JournalRecord::Remove);
                    counters.expired_items.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::inc_expired_items(1);
                    if state.settings.expire_to.is_some() {
                        state.expired_handoff.push(item);
                    }
                    count += 1;
                }
                _ => break,
            }
        }
        count
    }

    /// Journals one record with the configured sync policy. Read-path
    /// journal trouble is logged, not propagated; the in-memory queue stays
    /// authoritative.
    fn journal_log(state: &mut QueueState, record: &JournalRecord) {
        let sync = state.settings.sync_journal;
        if let Some(journal) = &mut state.journal {
            let result = journal
                .append(record)
                .and_then(|()| if sync { journal.sync() } else { Ok(()) });
            if let Err(e) = result {
                error!("journal {:?}: write failed: {}", journal.path(), e);
            }
        }
    }

    /// Rewrites the journal down to live state once it outgrows
    /// `max_journal_size`.
    fn maybe_rewrite(name: &str, state: &mut QueueState) {
        let QueueState {
            settings,
            journal,
            items,
            open_reads,
            ..
        } = state;
        let Some(journal) = journal else { return };
        if journal.size() <= settings.max_journal_size {
            return;
        }
        match journal.rewrite(open_reads, items) {
            Ok(()) => info!(
                "queue {}: journal rewritten, now {} bytes",
                name,
                journal.size()
            ),
            Err(e) => error!("queue {}: journal rewrite failed: {}", name, e),
        }
    }
}
