#[path = "common.rs"]
mod common;

use std::collections::HashMap;

use bytes::Bytes;
use driftmq::config::{QueueOverrides, QueueSettings};
use driftmq::core::item::current_timestamp;
use driftmq::QueueCollection;
use tokio::time::{Duration, Instant};

#[tokio::test]
async fn items_come_back_in_fifo_order() {
    common::init_logging();
    let c = common::collection(&common::data_dir("fifo"));

    for payload in ["one", "two", "three"] {
        assert!(c.add("work", payload, None, current_timestamp()).unwrap());
    }

    for expected in ["one", "two", "three"] {
        let item = c.remove("work", None, false).await.unwrap().unwrap();
        assert_eq!(item.data, Bytes::from(expected));
    }
    assert!(c.remove("work", None, false).await.unwrap().is_none());
}

#[tokio::test]
async fn peek_does_not_consume() {
    common::init_logging();
    let c = common::collection(&common::data_dir("peek"));

    c.add("q", "x", None, current_timestamp()).unwrap();
    let peeked = c.peek("q", None).await.unwrap().unwrap();
    assert_eq!(peeked.data, Bytes::from("x"));

    let removed = c.remove("q", None, false).await.unwrap().unwrap();
    assert_eq!(removed.data, Bytes::from("x"));
}

#[tokio::test]
async fn remove_on_missing_queue_is_a_miss() {
    common::init_logging();
    let c = common::collection(&common::data_dir("missing"));

    assert!(c.remove("nothing_here", None, false).await.unwrap().is_none());
    assert!(c.queue_names().is_empty(), "reads must not create queues");
}

#[tokio::test]
async fn deadline_remove_picks_up_a_late_add() {
    common::init_logging();
    let c = std::sync::Arc::new(common::collection(&common::data_dir("late_add")));

    c.add("q", "seed", None, current_timestamp()).unwrap();
    c.remove("q", None, false).await.unwrap().unwrap();

    let reader = {
        let c = c.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(5);
            c.remove("q", Some(deadline), false).await.unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    c.add("q", "late", None, current_timestamp()).unwrap();

    let item = reader.await.unwrap().unwrap();
    assert_eq!(item.data, Bytes::from("late"));
}

#[tokio::test]
async fn deadline_remove_times_out_empty() {
    common::init_logging();
    let c = common::collection(&common::data_dir("timeout"));

    c.add("q", "seed", None, current_timestamp()).unwrap();
    c.remove("q", None, false).await.unwrap().unwrap();

    let start = Instant::now();
    let deadline = start + Duration::from_millis(50);
    assert!(c.remove("q", Some(deadline), false).await.unwrap().is_none());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn flush_empties_the_queue_and_releases_waiters() {
    common::init_logging();
    let c = std::sync::Arc::new(common::collection(&common::data_dir("flush")));

    c.add("q", "a", None, current_timestamp()).unwrap();
    c.add("q", "b", None, current_timestamp()).unwrap();
    assert_eq!(c.flush("q"), 2);
    assert!(c.remove("q", None, false).await.unwrap().is_none());

    let waiter = {
        let c = c.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(5);
            c.remove("q", Some(deadline), false).await.unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    c.flush("q");
    assert!(waiter.await.unwrap().is_none(), "flush should release waiters");
}

#[tokio::test]
async fn full_queue_refuses_adds_by_default() {
    common::init_logging();
    let dir = common::data_dir("full_reject");
    let overrides = HashMap::from([(
        "bounded".to_string(),
        QueueOverrides {
            max_items: Some(2),
            ..Default::default()
        },
    )]);
    let c = QueueCollection::new(dir, QueueSettings::default(), overrides, HashMap::new()).unwrap();

    assert!(c.add("bounded", "a", None, current_timestamp()).unwrap());
    assert!(c.add("bounded", "b", None, current_timestamp()).unwrap());
    assert!(!c.add("bounded", "c", None, current_timestamp()).unwrap());

    let item = c.remove("bounded", None, false).await.unwrap().unwrap();
    assert_eq!(item.data, Bytes::from("a"));
}

#[tokio::test]
async fn full_queue_discards_oldest_when_configured() {
    common::init_logging();
    let dir = common::data_dir("full_discard");
    let overrides = HashMap::from([(
        "bounded".to_string(),
        QueueOverrides {
            max_items: Some(2),
            discard_old_when_full: Some(true),
            ..Default::default()
        },
    )]);
    let c = QueueCollection::new(dir, QueueSettings::default(), overrides, HashMap::new()).unwrap();

    for payload in ["a", "b", "c"] {
        assert!(c.add("bounded", payload, None, current_timestamp()).unwrap());
    }

    let item = c.remove("bounded", None, false).await.unwrap().unwrap();
    assert_eq!(item.data, Bytes::from("b"), "oldest item should be gone");
}

#[tokio::test]
async fn oversized_item_is_refused() {
    common::init_logging();
    let dir = common::data_dir("oversize");
    let overrides = HashMap::from([(
        "small".to_string(),
        QueueOverrides {
            max_item_size: Some(4),
            ..Default::default()
        },
    )]);
    let c = QueueCollection::new(dir, QueueSettings::default(), overrides, HashMap::new()).unwrap();

    assert!(!c.add("small", "way too big", None, current_timestamp()).unwrap());
    assert!(c.add("small", "ok", None, current_timestamp()).unwrap());
}
