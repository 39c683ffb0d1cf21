#[path = "common.rs"]
mod common;

use bytes::Bytes;
use driftmq::core::item::current_timestamp;

#[tokio::test]
async fn writes_to_master_reach_every_child() {
    common::init_logging();
    let c = common::collection(&common::data_dir("fanout_basic"));
    let now = current_timestamp();

    assert!(c.add("feed+a", "x", None, now).unwrap());
    assert!(c.add("feed+b", "y", None, now).unwrap());
    assert!(c.add("feed", "z", None, now).unwrap());

    let a1 = c.remove("feed+a", None, false).await.unwrap().unwrap();
    let a2 = c.remove("feed+a", None, false).await.unwrap().unwrap();
    assert_eq!((a1.data, a2.data), (Bytes::from("x"), Bytes::from("z")));

    let b1 = c.remove("feed+b", None, false).await.unwrap().unwrap();
    let b2 = c.remove("feed+b", None, false).await.unwrap().unwrap();
    assert_eq!((b1.data, b2.data), (Bytes::from("y"), Bytes::from("z")));

    // The add path materializes the master itself, so it holds a copy too.
    let m = c.remove("feed", None, false).await.unwrap().unwrap();
    assert_eq!(m.data, Bytes::from("z"));
}

#[tokio::test]
async fn children_receive_independent_copies() {
    common::init_logging();
    let c = common::collection(&common::data_dir("fanout_copies"));
    let now = current_timestamp();

    c.add("events+audit", "", None, now).unwrap();
    c.add("events+billing", "", None, now).unwrap();
    c.flush("events+audit");
    c.flush("events+billing");

    c.add("events", "v", None, now).unwrap();

    let audit = c.remove("events+audit", None, false).await.unwrap().unwrap();
    let billing = c
        .remove("events+billing", None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(audit.data, Bytes::from("v"));
    assert_eq!(billing.data, Bytes::from("v"));

    // Consuming one child's copy leaves the other's untouched.
    c.add("events", "w", None, now).unwrap();
    c.remove("events+audit", None, false).await.unwrap().unwrap();
    let still_there = c
        .remove("events+billing", None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_there.data, Bytes::from("w"));
}

#[tokio::test]
async fn empty_tag_denotes_the_masters_own_reader() {
    common::init_logging();
    let c = common::collection(&common::data_dir("fanout_empty_tag"));
    let now = current_timestamp();

    assert!(c.add("feed+", "x", None, now).unwrap());
    c.add("feed", "y", None, now).unwrap();

    let first = c.remove("feed+", None, false).await.unwrap().unwrap();
    let second = c.remove("feed+", None, false).await.unwrap().unwrap();
    assert_eq!((first.data, second.data), (Bytes::from("x"), Bytes::from("y")));
}

#[tokio::test]
async fn fanout_index_is_rebuilt_from_disk() {
    common::init_logging();
    let dir = common::data_dir("fanout_reload");
    let now = current_timestamp();

    {
        let c = common::collection(&dir);
        c.add("feed+a", "seed", None, now).unwrap();
        c.shutdown();
    }

    let c = common::collection(&dir);
    c.load_queues().unwrap();
    c.add("feed", "z", None, now).unwrap();

    let seed = c.remove("feed+a", None, false).await.unwrap().unwrap();
    let broadcast = c.remove("feed+a", None, false).await.unwrap().unwrap();
    assert_eq!(seed.data, Bytes::from("seed"));
    assert_eq!(broadcast.data, Bytes::from("z"));
}

#[tokio::test]
async fn deleting_a_child_stops_its_broadcasts() {
    common::init_logging();
    let c = common::collection(&common::data_dir("fanout_delete"));
    let now = current_timestamp();

    c.add("feed+a", "", None, now).unwrap();
    c.flush("feed+a");
    assert!(c.delete("feed+a").unwrap());

    c.add("feed", "z", None, now).unwrap();
    assert!(
        c.remove("feed+a", None, false).await.unwrap().is_none(),
        "deleted child must not be recreated by a master write"
    );
}
