use super::{MemoryStore, MessageStore, SledStore};
use crate::broker::message::{Message, Mode};
use serde_json::json;
use tempfile::tempdir;

fn queued(topic: &str, n: u32) -> Message {
    Message::new(topic, Mode::Queue, json!({ "n": n }))
}

#[tokio::test]
async fn test_sled_load_all_preserves_enqueue_order() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap(), true).unwrap();

    let messages: Vec<_> = (0..5).map(|n| queued("orders", n)).collect();
    for message in &messages {
        store.persist(message).await.unwrap();
    }

    let loaded = store.load_all("orders").await.unwrap();
    assert_eq!(loaded, messages);
}

#[tokio::test]
async fn test_sled_remove_deletes_only_that_record() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap(), true).unwrap();
    let first = queued("orders", 1);
    let second = queued("orders", 2);
    store.persist(&first).await.unwrap();
    store.persist(&second).await.unwrap();

    store.remove("orders", &first.id).await.unwrap();
    // second removal of the same id is a no-op
    store.remove("orders", &first.id).await.unwrap();

    let loaded = store.load_all("orders").await.unwrap();
    assert_eq!(loaded, vec![second]);
}

#[tokio::test]
async fn test_sled_records_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let kept = queued("jobs", 1);
    let acked = queued("jobs", 2);

    {
        let store = SledStore::open(&path, true).unwrap();
        store.persist(&kept).await.unwrap();
        store.persist(&acked).await.unwrap();
        store.remove("jobs", &acked.id).await.unwrap();
    }

    let reopened = SledStore::open(&path, true).unwrap();
    assert_eq!(reopened.load_all("jobs").await.unwrap(), vec![kept]);
    assert_eq!(reopened.topics().await.unwrap(), vec!["jobs".to_string()]);
}

#[tokio::test]
async fn test_sled_topics_skips_drained_queues() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap(), false).unwrap();
    let drained = queued("drained", 1);
    store.persist(&drained).await.unwrap();
    store.persist(&queued("busy", 1)).await.unwrap();
    store.remove("drained", &drained.id).await.unwrap();

    assert_eq!(store.topics().await.unwrap(), vec!["busy".to_string()]);
}

#[tokio::test]
async fn test_sled_drops_trees_of_drained_queue() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    {
        let store = SledStore::open(&path, true).unwrap();
        let messages: Vec<_> = (0..3).map(|n| queued("jobs", n)).collect();
        for message in &messages {
            store.persist(message).await.unwrap();
        }
        for message in &messages {
            store.remove("jobs", &message.id).await.unwrap();
        }

        // the queue comes back after being drained
        let again = queued("jobs", 9);
        store.persist(&again).await.unwrap();
        assert_eq!(store.load_all("jobs").await.unwrap(), vec![again.clone()]);
        store.remove("jobs", &again.id).await.unwrap();
    }

    let db = sled::open(&path).unwrap();
    let names: Vec<_> = db.tree_names();
    assert!(!names.iter().any(|n| n.as_ref() == b"queue:jobs"));
    assert!(!names.iter().any(|n| n.as_ref() == b"index:jobs"));
}

#[tokio::test]
async fn test_sled_empty_topic_returns_empty_vec() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap(), true).unwrap();
    assert!(store.load_all("nonexistent").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_memory_store_contract() {
    let store = MemoryStore::new();
    let a = queued("q", 1);
    let b = queued("q", 2);
    store.persist(&a).await.unwrap();
    store.persist(&b).await.unwrap();
    assert_eq!(store.record_count("q"), 2);
    assert!(store.contains("q", &a.id));

    store.remove("q", &a.id).await.unwrap();
    assert!(!store.contains("q", &a.id));
    assert_eq!(store.load_all("q").await.unwrap(), vec![b.clone()]);

    store.remove("q", &b.id).await.unwrap();
    assert_eq!(store.record_count("q"), 0);
    assert!(store.topics().await.unwrap().is_empty());
}
