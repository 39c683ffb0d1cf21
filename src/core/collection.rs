//! The queue collection registry: the authoritative mapping from name to
//! live queue, fanout broadcast, alias indirection, hot reload, and the
//! shutdown barrier.
//!
//! All registry state (queue map, fanout index, alias map, config maps,
//! shutting-down flag) lives behind a single mutex. The lock is held only
//! to look up or publish handles; per-queue operations run with the lock
//! released, so journal I/O never serializes the registry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{AliasSettings, Config, QueueOverrides, QueueSettings};
use crate::core::alias::AliasedQueue;
use crate::core::error::BrokerError;
use crate::core::item::{current_timestamp, QueueItem};
use crate::core::name::{self, QueueName};
use crate::core::queue::PersistentQueue;
use crate::metrics;

#[derive(Debug)]
struct Registry {
    queues: HashMap<String, Arc<PersistentQueue>>,
    /// Names whose queue is mid-creation: the registry lock is released
    /// while the journal replays, and this marker keeps a second caller
    /// from opening the same journal.
    creating: HashSet<String>,
    /// master name → names of its live fanout children.
    fanout: HashMap<String, BTreeSet<String>>,
    aliases: HashMap<String, Arc<AliasedQueue>>,
    default_settings: QueueSettings,
    overrides: HashMap<String, QueueOverrides>,
    alias_settings: HashMap<String, AliasSettings>,
    shutting_down: bool,
}

impl Registry {
    /// Effective settings for a queue: exact override, then the master's
    /// override (fanout children inherit), then the default.
    fn effective_settings(&self, name: &QueueName<'_>) -> QueueSettings {
        self.overrides
            .get(name.as_str())
            .or_else(|| self.overrides.get(name.master()))
            .map(|over| over.resolve(&self.default_settings))
            .unwrap_or_else(|| self.default_settings.clone())
    }
}

/// A set of named, journaled queues under one directory.
#[derive(Debug)]
pub struct QueueCollection {
    path: PathBuf,
    registry: Mutex<Registry>,
    /// Signalled whenever a pending creation settles (published, failed,
    /// or lost to shutdown) so callers parked on the same name re-check.
    creation_done: Condvar,
}

impl QueueCollection {
    /// Creates a collection rooted at `path`, creating the directory when
    /// missing. Fails with `InaccessibleQueuePath` when the path is not a
    /// writable directory.
    pub fn new(
        path: impl Into<PathBuf>,
        default_settings: QueueSettings,
        overrides: HashMap<String, QueueOverrides>,
        alias_settings: HashMap<String, AliasSettings>,
    ) -> Result<Self, BrokerError> {
        let path = path.into();
        verify_writable_dir(&path)?;
        Ok(Self {
            path,
            registry: Mutex::new(Registry {
                queues: HashMap::new(),
                creating: HashSet::new(),
                fanout: HashMap::new(),
                aliases: HashMap::new(),
                default_settings,
                overrides,
                alias_settings,
                shutting_down: false,
            }),
            creation_done: Condvar::new(),
        })
    }

    /// Boots a collection from a parsed config file: creates it, loads
    /// every queue found on disk, and reconciles aliases.
    pub fn from_config(config: &Config) -> Result<Self, BrokerError> {
        let collection = Self::new(
            &config.broker.data_dir,
            config.default_settings(),
            config.queues.overrides.clone(),
            config.aliases.clone(),
        )?;
        collection.load_queues()?;
        Ok(collection)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scans the root directory and materializes every queue with
    /// recoverable on-disk state, then reconciles aliases. Rewrite temp
    /// files and foreign filenames are skipped; a queue whose journal fails
    /// to replay is logged and left for a later lazy create.
    pub fn load_queues(&self) -> Result<(), BrokerError> {
        let mut names: Vec<String> = fs::read_dir(&self.path)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|file_name| name::is_loadable(file_name))
            .collect();
        names.sort();

        info!("loading {} queues from {:?}", names.len(), self.path);
        for queue_name in &names {
            match name::resolve(queue_name).and_then(|n| self.get_or_create(&n)) {
                Ok(_) => {}
                Err(e) => warn!("queue {}: failed to load: {}", queue_name, e),
            }
        }
        self.reconcile_aliases();
        Ok(())
    }

    /// Returns the live handle for `name`, creating (and replaying) the
    /// queue when absent. Returns `Ok(None)` while shutting down. Creation
    /// is serialized per name: one caller claims the name, opens and
    /// replays the journal with the registry lock released, and publishes
    /// the handle afterwards; everyone else parks until the creation
    /// settles and then picks up the published handle.
    pub fn get_or_create(
        &self,
        queue_name: &QueueName<'_>,
    ) -> Result<Option<Arc<PersistentQueue>>, BrokerError> {
        let settings = {
            let mut registry = self.registry.lock();
            loop {
                if registry.shutting_down {
                    return Ok(None);
                }
                if let Some(queue) = registry.queues.get(queue_name.as_str()) {
                    return Ok(Some(Arc::clone(queue)));
                }
                if registry.creating.insert(queue_name.as_str().to_string()) {
                    break registry.effective_settings(queue_name);
                }
                // Another caller is already building this queue.
                self.creation_done.wait(&mut registry);
            }
        };

        // Journal replay runs without the registry lock so a long recovery
        // cannot stall operations on other queues.
        let queue = Arc::new(PersistentQueue::new(
            queue_name.as_str(),
            &self.path,
            settings,
        ));
        let result = queue.setup();

        let published = {
            let mut registry = self.registry.lock();
            registry.creating.remove(queue_name.as_str());
            if result.is_ok() && !registry.shutting_down {
                if queue_name.is_fanout_child() {
                    registry
                        .fanout
                        .entry(queue_name.master().to_string())
                        .or_default()
                        .insert(queue_name.as_str().to_string());
                }
                registry
                    .queues
                    .insert(queue_name.as_str().to_string(), Arc::clone(&queue));
                true
            } else {
                false
            }
        };
        self.creation_done.notify_all();

        result?;
        if !published {
            // Lost the race with shutdown: release the journal again.
            queue.close();
            return Ok(None);
        }
        metrics::inc_queue_creates(1);
        info!("queue created: {}", queue_name.as_str());
        Ok(Some(queue))
    }

    /// Returns the live handle for `name` without creating one.
    pub fn lookup(&self, queue_name: &str) -> Option<Arc<PersistentQueue>> {
        self.registry.lock().queues.get(queue_name).cloned()
    }

    /// Returns the live alias bound to `name`, if any.
    pub fn lookup_alias(&self, alias_name: &str) -> Option<Arc<AliasedQueue>> {
        self.registry.lock().aliases.get(alias_name).cloned()
    }

    /// Enqueues `data` on `name`, durably. Resolution order:
    /// 1. An alias delivers to every destination through this same path.
    /// 2. A master with fanout children broadcasts to every child first.
    /// 3. The named queue itself receives a copy (created on demand; this
    ///    materializes a master written to before any plain use).
    ///
    /// Returns `Ok(false)` while shutting down or when the queue refuses
    /// the item. Journal errors on the named queue propagate; a failure on
    /// a fanout child or alias destination is logged and the remaining
    /// siblings are still written.
    pub fn add(
        &self,
        queue_name: &str,
        data: impl Into<Bytes>,
        expiry: Option<u64>,
        add_time: u64,
    ) -> Result<bool, BrokerError> {
        let resolved = name::resolve(queue_name)?;
        let data = data.into();

        if let Some(alias) = self.lookup_alias(queue_name) {
            alias.record_write();
            // Destinations are committed independently; one failure does
            // not abort the others.
            let mut all_ok = true;
            for destination in alias.destinations() {
                match self.add(&destination, data.clone(), expiry, add_time) {
                    Ok(added) => all_ok &= added,
                    Err(e) => {
                        error!(
                            "alias {}: write to destination {} failed: {}",
                            queue_name, destination, e
                        );
                        all_ok = false;
                    }
                }
            }
            return Ok(all_ok);
        }

        let children: Vec<String> = {
            let registry = self.registry.lock();
            registry
                .fanout
                .get(queue_name)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        // Children are committed independently; one failure does not abort
        // the remaining siblings or the master's own copy.
        for child in children {
            if let Err(e) = self.add(&child, data.clone(), expiry, add_time) {
                error!("fanout {}: write to child {} failed: {}", queue_name, child, e);
            }
        }

        let Some(queue) = self.get_or_create(&resolved)? else {
            return Ok(false);
        };
        let added = queue.add(data, expiry, add_time)?;
        if added {
            metrics::inc_total_items(1);
        }
        self.reroute_expired(&queue);
        Ok(added)
    }

    /// Dequeues from `name`. Aliases and absent queues read empty; the
    /// queue is never created by a read. With a deadline the call parks
    /// until an item arrives, the deadline elapses, the queue is flushed,
    /// or shutdown. A transactional remove must be settled later with
    /// `confirm_remove` or `unremove`.
    pub async fn remove(
        &self,
        queue_name: &str,
        deadline: Option<Instant>,
        transactional: bool,
    ) -> Result<Option<QueueItem>, BrokerError> {
        name::resolve(queue_name)?;
        if self.lookup_alias(queue_name).is_some() {
            metrics::inc_get_misses(1);
            return Ok(None);
        }
        let Some(queue) = self.lookup(queue_name) else {
            metrics::inc_get_misses(1);
            return Ok(None);
        };
        let item = queue.remove(deadline, transactional).await;
        match &item {
            Some(_) => metrics::inc_get_hits(1),
            None => metrics::inc_get_misses(1),
        }
        self.reroute_expired(&queue);
        Ok(item)
    }

    /// Like `remove` but never consumes the item.
    pub async fn peek(
        &self,
        queue_name: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<QueueItem>, BrokerError> {
        name::resolve(queue_name)?;
        if self.lookup_alias(queue_name).is_some() {
            metrics::inc_get_misses(1);
            return Ok(None);
        }
        let Some(queue) = self.lookup(queue_name) else {
            metrics::inc_get_misses(1);
            return Ok(None);
        };
        let item = queue.peek(deadline).await;
        match &item {
            Some(_) => metrics::inc_get_hits(1),
            None => metrics::inc_get_misses(1),
        }
        self.reroute_expired(&queue);
        Ok(item)
    }

    /// Returns a reserved item to the head of its queue. No-op when the
    /// queue or the xid is unknown.
    pub fn unremove(&self, queue_name: &str, xid: u64) {
        if let Some(queue) = self.lookup(queue_name) {
            queue.unremove(xid);
        }
    }

    /// Permanently discards a reserved item. No-op when the queue or the
    /// xid is unknown.
    pub fn confirm_remove(&self, queue_name: &str, xid: u64) {
        if let Some(queue) = self.lookup(queue_name) {
            queue.confirm_remove(xid);
        }
    }

    /// Drops every queued item on `name`. Returns the number discarded.
    pub fn flush(&self, queue_name: &str) -> usize {
        self.lookup(queue_name).map_or(0, |queue| queue.flush())
    }

    /// Closes `name`, destroys its journal, and forgets it. A fanout child
    /// also leaves its master's child set. No-op after shutdown.
    pub fn delete(&self, queue_name: &str) -> Result<bool, BrokerError> {
        let queue = {
            let mut registry = self.registry.lock();
            if registry.shutting_down {
                return Ok(false);
            }
            let Some(queue) = registry.queues.remove(queue_name) else {
                return Ok(false);
            };
            if let Some((master, _)) = queue_name.split_once('+') {
                if let Some(children) = registry.fanout.get_mut(master) {
                    children.remove(queue_name);
                }
            }
            queue
        };

        queue.close();
        queue.destroy_journal()?;
        metrics::inc_queue_deletes(1);
        info!("queue deleted: {}", queue_name);
        Ok(true)
    }

    /// Discards expired items from the head of `name`.
    pub fn flush_expired(&self, queue_name: &str) -> usize {
        let Some(queue) = self.lookup(queue_name) else {
            return 0;
        };
        let count = queue.discard_expired(None);
        self.reroute_expired(&queue);
        count
    }

    /// Discards expired items across every live queue.
    pub fn flush_all_expired(&self) -> usize {
        let queues: Vec<Arc<PersistentQueue>> =
            self.registry.lock().queues.values().cloned().collect();
        queues
            .iter()
            .map(|queue| {
                let count = queue.discard_expired(None);
                self.reroute_expired(queue);
                count
            })
            .sum()
    }

    /// Deletes `name` if the queue reports itself ready for expiration
    /// (configured max age, empty, idle).
    pub fn expire_queue(&self, queue_name: &str) -> Result<bool, BrokerError> {
        let Some(queue) = self.lookup(queue_name) else {
            return Ok(false);
        };
        if !queue.is_ready_for_expiration() {
            return Ok(false);
        }
        let deleted = self.delete(queue_name)?;
        if deleted {
            metrics::inc_queue_expires(1);
            info!("queue expired: {}", queue_name);
        }
        Ok(deleted)
    }

    /// Sweeps every live queue through `expire_queue`. Returns the number
    /// deleted.
    pub fn delete_expired_queues(&self) -> usize {
        let names = self.queue_names();
        names
            .iter()
            .filter(|queue_name| matches!(self.expire_queue(queue_name), Ok(true)))
            .count()
    }

    /// Idempotent shutdown barrier: marks the collection closed, then
    /// closes every queue one at a time (each journal fully synced before
    /// the next close begins). Later adds return `false`; later reads
    /// resolve empty.
    pub fn shutdown(&self) {
        let queues: Vec<Arc<PersistentQueue>> = {
            let mut registry = self.registry.lock();
            if registry.shutting_down {
                return;
            }
            registry.shutting_down = true;
            registry.aliases.clear();
            registry.queues.drain().map(|(_, queue)| queue).collect()
        };
        self.creation_done.notify_all();

        let count = queues.len();
        for queue in queues {
            queue.close();
        }
        info!("queue collection shut down ({} queues closed)", count);
    }

    /// Replaces the config maps and re-applies the effective settings to
    /// every live queue (handles keep their identity), then reconciles
    /// aliases. Never creates or destroys queues.
    pub fn reload(
        &self,
        default_settings: QueueSettings,
        overrides: HashMap<String, QueueOverrides>,
        alias_settings: HashMap<String, AliasSettings>,
    ) {
        let updates: Vec<(Arc<PersistentQueue>, QueueSettings)> = {
            let mut registry = self.registry.lock();
            registry.default_settings = default_settings;
            registry.overrides = overrides;
            registry.alias_settings = alias_settings;
            registry
                .queues
                .iter()
                .filter_map(|(queue_name, queue)| {
                    // Names in the registry were validated at creation.
                    let resolved = name::resolve(queue_name).ok()?;
                    Some((Arc::clone(queue), registry.effective_settings(&resolved)))
                })
                .collect()
        };

        for (queue, settings) in updates {
            queue.update_settings(settings);
        }
        self.reconcile_aliases();
        info!("configuration reloaded");
    }

    /// Creates or updates an alias for every configured one. Aliases no
    /// longer configured are left alive (deletion is out of band). Logs a
    /// warning for every name bound to both a queue and an alias.
    pub fn reconcile_aliases(&self) {
        let mut registry = self.registry.lock();
        if registry.shutting_down {
            return;
        }
        let alias_settings = registry.alias_settings.clone();
        for (alias_name, settings) in alias_settings {
            if registry.overrides.contains_key(&alias_name)
                || registry.queues.contains_key(&alias_name)
            {
                warn!(
                    "name {:?} is configured as both a queue and an alias; writes go to the alias",
                    alias_name
                );
            }
            match registry.aliases.get(&alias_name) {
                Some(alias) => alias.update_settings(settings),
                None => {
                    info!("alias created: {}", alias_name);
                    registry
                        .aliases
                        .insert(alias_name.clone(), Arc::new(AliasedQueue::new(&alias_name, settings)));
                }
            }
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn alias_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.lock().aliases.keys().cloned().collect();
        names.sort();
        names
    }

    /// Total queued items across live queues. A snapshot; not consistent
    /// across queues.
    pub fn current_items(&self) -> u64 {
        self.for_each_queue(|queue| queue.len() as u64)
    }

    pub fn current_bytes(&self) -> u64 {
        self.for_each_queue(|queue| queue.bytes())
    }

    pub fn current_open_reservations(&self) -> u64 {
        self.for_each_queue(|queue| queue.open_reservations() as u64)
    }

    /// Sum of every live queue's configured memory budget.
    pub fn reserved_memory_bytes(&self) -> u64 {
        self.for_each_queue(|queue| queue.max_memory_bytes())
    }

    /// Stats for one name: the queue's, or the alias's when the name is
    /// bound to an alias.
    pub fn dump_stats(&self, queue_name: &str) -> Option<Vec<(String, String)>> {
        if let Some(alias) = self.lookup_alias(queue_name) {
            return Some(alias.dump_stats());
        }
        self.lookup(queue_name).map(|queue| queue.dump_stats())
    }

    /// Zeroes the named queue's counters. No-op when absent or aliased.
    pub fn reset_stats(&self, queue_name: &str) {
        if let Some(queue) = self.lookup(queue_name) {
            queue.reset_stats();
        }
    }

    fn for_each_queue(&self, f: impl Fn(&PersistentQueue) -> u64) -> u64 {
        let queues: Vec<Arc<PersistentQueue>> =
            self.registry.lock().queues.values().cloned().collect();
        queues.iter().map(|queue| f(queue)).sum()
    }

    /// Drains items that expired with `expire_to` configured and re-adds
    /// them to the target queue. Runs after facade calls, never under the
    /// registry lock or the queue's own lock.
    fn reroute_expired(&self, queue: &Arc<PersistentQueue>) {
        let items = queue.drain_expired();
        if items.is_empty() {
            return;
        }
        let Some(target) = queue.expire_to() else {
            return;
        };
        let count = items.len();
        for item in items {
            // Rerouted items get a fresh lifetime on the target queue.
            if let Err(e) = self.add(&target, item.data, None, current_timestamp()) {
                error!(
                    "failed to reroute expired item from {} to {}: {}",
                    queue.name(),
                    target,
                    e
                );
            }
        }
        debug!(
            "rerouted {} expired items from {} to {}",
            count,
            queue.name(),
            target
        );
    }
}

/// Ensures `path` exists, is a directory, and is writable (checked with a
/// probe file; `.` is a forbidden name character so the probe can never
/// collide with a queue).
fn verify_writable_dir(path: &Path) -> Result<(), BrokerError> {
    if !path.is_dir() {
        fs::create_dir_all(path)
            .map_err(|_| BrokerError::InaccessibleQueuePath(path.to_path_buf()))?;
    }
    let probe = path.join(".writable");
    match fs::File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            Ok(())
        }
        Err(_) => Err(BrokerError::InaccessibleQueuePath(path.to_path_buf())),
    }
}
