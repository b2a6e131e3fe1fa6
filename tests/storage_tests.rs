// Store tests: column families, batches, prefix scans, sequences.

mod common;

use escrow_oracle::storage::{Store, CF_META, CF_SIGNED_TX, CF_TASK_GROUP, CF_USED_INPUT};
use rocksdb::WriteBatch;
use std::sync::Arc;

#[tokio::test]
async fn test_storage_roundtrip_and_unknown_cf() {
    println!("🧪 Testing basic reads and writes...");
    let (_dir, store) = common::open_store();

    store.put(CF_META, b"k", &"value".to_string()).expect("Failed to store data");
    let back: Option<String> = store.get(CF_META, b"k").expect("Failed to retrieve data");
    assert_eq!(back.as_deref(), Some("value"));
    assert_eq!(store.get::<String>(CF_META, b"missing").unwrap(), None);

    assert!(store.put("no_such_cf", b"k", &1u64).is_err(), "unknown column families are errors");
    store.health_check().expect("health check");
    println!("✅ Round trip ok");
}

#[tokio::test]
async fn test_batch_is_all_or_nothing() {
    println!("🧪 Testing batched writes...");
    let (_dir, store) = common::open_store();

    let mut batch = WriteBatch::default();
    store.batch_put(&mut batch, CF_USED_INPUT, b"in-1", &"h".to_string()).unwrap();
    store.batch_put(&mut batch, CF_SIGNED_TX, b"s-1", &"tx".to_string()).unwrap();
    assert_eq!(store.count(CF_USED_INPUT).unwrap(), 0, "nothing visible before the write");
    store.write_batch(batch).unwrap();
    assert_eq!(store.count(CF_USED_INPUT).unwrap(), 1);
    assert_eq!(store.count(CF_SIGNED_TX).unwrap(), 1);

    let mut batch = WriteBatch::default();
    store.batch_delete(&mut batch, CF_USED_INPUT, b"in-1").unwrap();
    store.write_batch(batch).unwrap();
    assert_eq!(store.count(CF_USED_INPUT).unwrap(), 0);
    println!("✅ Batches applied atomically");
}

#[tokio::test]
async fn test_prefix_scan_stays_inside_prefix() {
    println!("🧪 Testing prefix scans...");
    let (_dir, store) = common::open_store();
    let mut batch = WriteBatch::default();
    for key in [&b"aa\x00\x01"[..], b"aa\x00\x02", b"aab\x00\x01", b"b\x00\x01"] {
        store.batch_put_raw(&mut batch, CF_TASK_GROUP, key, &[]).unwrap();
    }
    store.write_batch(batch).unwrap();

    let keys: Vec<Vec<u8>> = store.scan_prefix(CF_TASK_GROUP, b"aa\x00").unwrap().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"aa\x00\x01".to_vec(), b"aa\x00\x02".to_vec()]);
    println!("✅ Prefix respected");
}

#[tokio::test]
async fn test_sequences_are_unique_under_concurrency() {
    println!("🧪 Testing concurrent sequence allocation...");
    let (_dir, store) = common::open_store();

    let mut handles = vec![];
    for _ in 0..8 {
        let store: Arc<Store> = store.clone();
        handles.push(tokio::spawn(async move {
            (0..50).map(|_| store.next_sequence("task").unwrap()).collect::<Vec<u64>>()
        }));
    }
    let mut all = vec![];
    for h in handles {
        all.extend(h.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 400);
    assert_eq!(all.first(), Some(&1));
    assert_eq!(all.last(), Some(&400));
    println!("✅ No duplicate ids");
}

#[tokio::test]
async fn test_stats_report_table_sizes() {
    println!("🧪 Testing database stats...");
    let (_dir, store) = common::open_store();
    store.put(CF_USED_INPUT, b"a", &1u8).unwrap();
    store.put(CF_USED_INPUT, b"b", &1u8).unwrap();
    let stats = store.get_stats().unwrap();
    assert_eq!(stats.used_input_count, 2);
    assert_eq!(stats.task_count, 0);
    println!("✅ Stats ok");
}
