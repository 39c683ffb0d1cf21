#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

use driftmq::config::QueueSettings;
use driftmq::QueueCollection;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // The guard must outlive the test process.
        let _ = Box::leak(Box::new(driftmq::logging::init_logging()));
    });
}

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A fresh directory under the system temp dir, unique per call so tests
/// can run in parallel.
pub fn data_dir(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "driftmq_test_{}_{}_{}",
        std::process::id(),
        name,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&path);
    path
}

/// A collection with default settings and no configured aliases.
pub fn collection(dir: &PathBuf) -> QueueCollection {
    QueueCollection::new(
        dir.clone(),
        QueueSettings::default(),
        HashMap::new(),
        HashMap::new(),
    )
    .expect("failed to create collection")
}
