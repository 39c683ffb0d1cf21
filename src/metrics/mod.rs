use std::sync::atomic::{AtomicU64, Ordering};

// Global counters (low overhead). These are coarse-grained and process-wide.
static TOTAL_ITEMS: AtomicU64 = AtomicU64::new(0);
static EXPIRED_ITEMS: AtomicU64 = AtomicU64::new(0);
static GET_HITS: AtomicU64 = AtomicU64::new(0);
static GET_MISSES: AtomicU64 = AtomicU64::new(0);
static QUEUE_CREATES: AtomicU64 = AtomicU64::new(0);
static QUEUE_DELETES: AtomicU64 = AtomicU64::new(0);
static QUEUE_EXPIRES: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn inc_total_items(n: u64) {
    TOTAL_ITEMS.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_expired_items(n: u64) {
    EXPIRED_ITEMS.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_get_hits(n: u64) {
    GET_HITS.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_get_misses(n: u64) {
    GET_MISSES.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_queue_creates(n: u64) {
    QUEUE_CREATES.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_queue_deletes(n: u64) {
    QUEUE_DELETES.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_queue_expires(n: u64) {
    QUEUE_EXPIRES.fetch_add(n, Ordering::Relaxed);
}

pub fn snapshot() -> String {
    // Simple text format (Prometheus-style without HELP/TYPE lines for brevity)
    format!(
        "driftmq_total_items {}\ndriftmq_expired_items {}\ndriftmq_get_hits {}\ndriftmq_get_misses {}\ndriftmq_queue_creates {}\ndriftmq_queue_deletes {}\ndriftmq_queue_expires {}\n",
        TOTAL_ITEMS.load(Ordering::Relaxed),
        EXPIRED_ITEMS.load(Ordering::Relaxed),
        GET_HITS.load(Ordering::Relaxed),
        GET_MISSES.load(Ordering::Relaxed),
        QUEUE_CREATES.load(Ordering::Relaxed),
        QUEUE_DELETES.load(Ordering::Relaxed),
        QUEUE_EXPIRES.load(Ordering::Relaxed),
    )
}
