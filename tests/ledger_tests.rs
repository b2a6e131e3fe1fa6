// Persistent record tests: input claims, signature ratchet, task queue.

mod common;

use escrow_oracle::{
    ledger::{ClaimOutcome, UsedInputLedger},
    protocol::Operation,
    scheduler::{NewTask, TaskScheduler},
    storage::Store,
    tracker::HandledTransactionTracker,
};

fn new_task(group: &str, next_check: u64, body: &str) -> NewTask {
    NewTask {
        operation: Operation::ConditionedTransaction,
        json_data: body.to_string(),
        filter_field: group.to_string(),
        next_check,
    }
}

#[tokio::test]
async fn test_claim_is_idempotent_for_the_same_request() {
    println!("🧪 Testing idempotent input claims...");
    let (_dir, store) = common::open_store();
    let ledger = UsedInputLedger::new(store.clone());

    assert_eq!(ledger.claim("in-1", "hash-a").unwrap(), ClaimOutcome::Accepted);
    assert_eq!(ledger.claim("in-1", "hash-a").unwrap(), ClaimOutcome::Accepted);
    assert_eq!(ledger.len().unwrap(), 1, "re-claim must not add a record");
    assert_eq!(ledger.owner("in-1").unwrap().as_deref(), Some("hash-a"));

    println!("✅ Idempotent claims");
}

#[tokio::test]
async fn test_conflicting_claim_writes_nothing() {
    println!("🧪 Testing all-or-nothing claims...");
    let (_dir, store) = common::open_store();
    let ledger = UsedInputLedger::new(store.clone());

    ledger.claim("in-2", "hash-a").unwrap();
    let inputs = vec!["in-1".to_string(), "in-2".to_string(), "in-3".to_string()];
    let outcome = ledger.claim_all(&inputs, "hash-b").unwrap();
    assert_eq!(
        outcome,
        ClaimOutcome::Conflict { input_fingerprint: "in-2".into(), owner: "hash-a".into() }
    );
    assert_eq!(ledger.owner("in-1").unwrap(), None, "no partial claim survives");
    assert_eq!(ledger.owner("in-3").unwrap(), None);
    assert_eq!(ledger.len().unwrap(), 1);

    // the rightful owner can still claim the rest
    assert_eq!(ledger.claim_all(&inputs, "hash-a").unwrap(), ClaimOutcome::Accepted);
    assert_eq!(ledger.len().unwrap(), 3);
    println!("✅ Conflicts are atomic");
}

#[tokio::test]
async fn test_tracker_never_decreases() {
    println!("🧪 Testing the signature ratchet...");
    let (_dir, store) = common::open_store();
    let tracker = HandledTransactionTracker::new(store.clone());

    assert_eq!(tracker.get("rqhs:g").unwrap(), 0);
    let mut last = 0;
    for seen in [2, 5, 3, 0, 5, 7, 1] {
        let now = tracker.ratchet("rqhs:g", seen).unwrap();
        assert!(now >= last, "ratchet went from {last} to {now}");
        assert_eq!(now, tracker.get("rqhs:g").unwrap());
        last = now;
    }
    assert_eq!(last, 7);
    assert_eq!(tracker.get("rqhs:other").unwrap(), 0);
    println!("✅ Ratchet is monotonic");
}

#[tokio::test]
async fn test_ready_tasks_respect_next_check() {
    println!("🧪 Testing task readiness ordering...");
    let (_dir, store) = common::open_store();
    let scheduler = TaskScheduler::new(store.clone());

    let late = scheduler.save(new_task("rqhs:a", 300, "late")).unwrap();
    let early = scheduler.save(new_task("rqhs:b", 100, "early")).unwrap();
    let mid = scheduler.save(new_task("rqhs:a", 200, "mid")).unwrap();

    assert!(scheduler.ready_tasks(99).unwrap().is_empty());
    let ready: Vec<u64> = scheduler.ready_tasks(250).unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ready, vec![early.id, mid.id]);
    assert_eq!(scheduler.get_oldest_task(1_000).unwrap().map(|t| t.id), Some(early.id));

    // group lookup ignores readiness
    let group: Vec<u64> = scheduler.get_similar("rqhs:a").unwrap().iter().map(|t| t.id).collect();
    assert_eq!(group, vec![late.id, mid.id]);
    println!("✅ Readiness ordering");
}

#[tokio::test]
async fn test_done_is_terminal_and_idempotent() {
    println!("🧪 Testing done marking...");
    let (_dir, store) = common::open_store();
    let scheduler = TaskScheduler::new(store.clone());

    let a = scheduler.save(new_task("rqhs:a", 10, "a")).unwrap();
    let b = scheduler.save(new_task("rqhs:a", 10, "b")).unwrap();
    assert_eq!(scheduler.pending_count().unwrap(), 2);

    assert_eq!(scheduler.done_all(&[a.id, a.id, 999]).unwrap(), 1);
    assert!(!scheduler.done(a.id).unwrap(), "second completion is a no-op");
    assert!(scheduler.get(a.id).unwrap().unwrap().done);

    let ready: Vec<u64> = scheduler.ready_tasks(10).unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ready, vec![b.id]);
    assert_eq!(scheduler.get_similar("rqhs:a").unwrap().len(), 1);
    assert_eq!(scheduler.get_group("rqhs:a").unwrap().len(), 2, "done tasks are kept");
    assert_eq!(scheduler.get_all_tasks().unwrap().len(), 2);
    assert_eq!(scheduler.pending_count().unwrap(), 1);
    println!("✅ Done is terminal");
}

#[tokio::test]
async fn test_tasks_survive_reopen() {
    println!("🧪 Testing persistence across restarts...");
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("reopen_db");
    let id = {
        let store = std::sync::Arc::new(Store::open(path.to_str().unwrap()).unwrap());
        let scheduler = TaskScheduler::new(store.clone());
        let task = scheduler.save(new_task("rqhs:a", 10, "a")).unwrap();
        store.close().unwrap();
        task.id
    };

    let store = std::sync::Arc::new(Store::open(path.to_str().unwrap()).unwrap());
    let scheduler = TaskScheduler::new(store.clone());
    assert_eq!(scheduler.get(id).unwrap().map(|t| t.json_data), Some("a".to_string()));
    let next = scheduler.save(new_task("rqhs:a", 10, "b")).unwrap();
    assert!(next.id > id, "ids keep increasing after a restart");
    println!("✅ Tasks persisted");
}
