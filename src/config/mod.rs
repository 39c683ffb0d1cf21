//! Configuration module for driftmq.
//!
//! Loads a structured TOML file into strongly‐typed structs (`Config`,
//! `QueueSettings`, etc.) using `serde` + `toml`.
//!
//! # Example `driftmq.toml`
//! ```toml
//! [broker]
//! data_dir = "./data/queues"
//!
//! [queues]
//! max_items           = 1_000_000
//! max_journal_size    = 16_777_216   # 16 MiB
//! sync_journal        = true
//!
//! [queues.overrides.weather_updates]
//! max_age_ms       = 60_000
//! expire_to        = "weather_stale"
//!
//! [queues.overrides.scratch]
//! keep_journal     = false
//!
//! [aliases.events]
//! destinations = ["clicks", "views"]
//! ```
//! # Usage
//! ```rust,no_run
//! let cfg = driftmq::config::load_config("./driftmq.toml").unwrap();
//! println!("Serving queues from {:?}", cfg.broker.data_dir);
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::{fs, path::Path};

/// Effective per-queue tunables after override resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Maximum queued items before the queue counts as full.
    pub max_items: usize,
    /// Maximum queued payload bytes before the queue counts as full.
    pub max_size_bytes: u64,
    /// Items larger than this are refused outright.
    pub max_item_size: usize,
    /// Memory budget reported for this queue (stats only; items are never
    /// paged out).
    pub max_memory_bytes: u64,
    /// Journal size that triggers a compacting rewrite.
    pub max_journal_size: u64,
    /// Cap on every item's lifetime: effective expiry is at most
    /// `add_time + max_age_ms`.
    pub max_age_ms: Option<u64>,
    /// Queue lifetime: an empty queue idle this long is eligible for
    /// deletion by the expiration sweep.
    pub max_queue_age_ms: Option<u64>,
    /// When full, drop from the head instead of refusing the add.
    pub discard_old_when_full: bool,
    /// Fsync the journal on every durable operation.
    pub sync_journal: bool,
    /// `false` = memory-only queue: no journal, not rediscovered at boot.
    pub keep_journal: bool,
    /// Route expired items to this queue instead of dropping them.
    pub expire_to: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_items: usize::MAX,
            max_size_bytes: u64::MAX,
            max_item_size: 16 * 1024 * 1024,
            max_memory_bytes: 128 * 1024 * 1024,
            max_journal_size: 16 * 1024 * 1024,
            max_age_ms: None,
            max_queue_age_ms: None,
            discard_old_when_full: false,
            sync_journal: true,
            keep_journal: true,
            expire_to: None,
        }
    }
}

/// Partial queue settings as they appear in the config file. Unset fields
/// fall through to the base they are resolved against.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueueOverrides {
    pub max_items: Option<usize>,
    pub max_size_bytes: Option<u64>,
    pub max_item_size: Option<usize>,
    pub max_memory_bytes: Option<u64>,
    pub max_journal_size: Option<u64>,
    pub max_age_ms: Option<u64>,
    pub max_queue_age_ms: Option<u64>,
    pub discard_old_when_full: Option<bool>,
    pub sync_journal: Option<bool>,
    pub keep_journal: Option<bool>,
    pub expire_to: Option<String>,
}

impl QueueOverrides {
    /// Applies this override on top of `base`.
    pub fn resolve(&self, base: &QueueSettings) -> QueueSettings {
        QueueSettings {
            max_items: self.max_items.unwrap_or(base.max_items),
            max_size_bytes: self.max_size_bytes.unwrap_or(base.max_size_bytes),
            max_item_size: self.max_item_size.unwrap_or(base.max_item_size),
            max_memory_bytes: self.max_memory_bytes.unwrap_or(base.max_memory_bytes),
            max_journal_size: self.max_journal_size.unwrap_or(base.max_journal_size),
            max_age_ms: self.max_age_ms.or(base.max_age_ms),
            max_queue_age_ms: self.max_queue_age_ms.or(base.max_queue_age_ms),
            discard_old_when_full: self
                .discard_old_when_full
                .unwrap_or(base.discard_old_when_full),
            sync_journal: self.sync_journal.unwrap_or(base.sync_journal),
            keep_journal: self.keep_journal.unwrap_or(base.keep_journal),
            expire_to: self.expire_to.clone().or_else(|| base.expire_to.clone()),
        }
    }
}

/// Write target that forwards each incoming item to every destination.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AliasSettings {
    pub destinations: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSection {
    /// Directory holding every queue journal.
    pub data_dir: PathBuf,
}

/// The `[queues]` table: default tunables plus per-queue overrides.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct QueuesSection {
    #[serde(flatten)]
    pub defaults: QueueOverrides,
    #[serde(default)]
    pub overrides: HashMap<String, QueueOverrides>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub broker: BrokerSection,
    #[serde(default)]
    pub queues: QueuesSection,
    #[serde(default)]
    pub aliases: HashMap<String, AliasSettings>,
}

impl Config {
    /// The effective default settings: built-in defaults patched by the
    /// `[queues]` table.
    pub fn default_settings(&self) -> QueueSettings {
        self.queues.defaults.resolve(&QueueSettings::default())
    }
}

/// Load configuration from a TOML file into `Config`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(&path)?;
    let cfg: Config = toml::from_str(&raw)?;
    Ok(cfg)
}
