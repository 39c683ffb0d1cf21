//! Aliases: named write-only targets that forward each incoming item to
//! one or more destination queues. Reads from an alias return nothing.
//!
//! The forwarding itself is driven by the collection's `add` path; an
//! alias holds no reference back into the collection.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::AliasSettings;
use crate::core::item::current_timestamp;

#[derive(Debug)]
pub struct AliasedQueue {
    name: String,
    settings: Mutex<AliasSettings>,
    total_items: AtomicU64,
    create_time: u64,
}

impl AliasedQueue {
    pub fn new(name: &str, settings: AliasSettings) -> Self {
        Self {
            name: name.to_string(),
            settings: Mutex::new(settings),
            total_items: AtomicU64::new(0),
            create_time: current_timestamp(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destinations(&self) -> Vec<String> {
        self.settings.lock().destinations.clone()
    }

    /// Swaps the alias config in place (reconcile / hot reload).
    pub fn update_settings(&self, settings: AliasSettings) {
        *self.settings.lock() = settings;
    }

    /// Counts one incoming write (before fanning out to destinations).
    pub fn record_write(&self) {
        self.total_items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dump_stats(&self) -> Vec<(String, String)> {
        let destinations = self.settings.lock().destinations.join(",");
        vec![
            (
                "total_items".into(),
                self.total_items.load(Ordering::Relaxed).to_string(),
            ),
            ("destinations".into(), destinations),
            (
                "age_msec".into(),
                current_timestamp()
                    .saturating_sub(self.create_time)
                    .to_string(),
            ),
        ]
    }
}
