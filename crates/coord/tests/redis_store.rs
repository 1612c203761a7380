//! Behavior of the Lua scripts against a live Redis server.
//!
//! Every test is `#[ignore]`d because it needs Redis 6.2 or newer.
//!
//! Run with: `cargo test -p coper-coord --test redis_store -- --ignored`
//!
//! `REDIS_URL` selects the server (default `redis://127.0.0.1:6379`). Each
//! test works in its own randomly named task and purges it afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use coper_coord::{Begin, CoordError, CoordinationStore, ExecId, NodeState, ReadyJob, RedisStore, TailLink};
use rand::seq::SliceRandom;
use rand::Rng;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

async fn store() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisStore::connect(&url)
        .await
        .expect("Failed to connect to Redis - is REDIS_URL reachable?")
}

fn task_name(prefix: &str) -> String {
    format!("{prefix}-{:016x}", rand::random::<u64>())
}

async fn node(store: &RedisStore, task: &str, job: &[u8], deps: &[ExecId]) -> ExecId {
    let id = store.next_exec_id(task).await.unwrap();
    store.register_node(task, id, job, deps).await.unwrap();
    id
}

#[tokio::test]
#[ignore]
async fn registration_and_cascade() {
    let store = store().await;
    let task = task_name("register");

    let a = node(&store, &task, b"a", &[]).await;
    let b = node(&store, &task, b"b", &[]).await;
    let c = node(&store, &task, b"job-c", &[a, b]).await;
    assert_eq!(store.dependency_count(&task, c).await.unwrap(), Some(2));
    assert_eq!(store.waiters(&task, a).await.unwrap(), vec![c]);
    assert_eq!(store.node_state(&task, c).await.unwrap(), Some(NodeState::Pending));

    let err = store.register_node(&task, 99, b"x", &[42]).await.unwrap_err();
    assert!(matches!(err, CoordError::UnknownNode { exec_id: 42, .. }));
    assert_eq!(store.node_state(&task, 99).await.unwrap(), None);

    assert_eq!(store.begin_node(&task, a).await.unwrap(), Begin::Started(Some(NodeState::Pending)));
    assert!(store.finish_node(&task, a, b"ra").await.unwrap().ready.is_empty());
    assert_eq!(store.dependency_count(&task, c).await.unwrap(), Some(1));

    let released = store.finish_node(&task, b, b"rb").await.unwrap();
    assert_eq!(released.finished, vec![b]);
    assert_eq!(released.ready, vec![ReadyJob { exec_id: c, job: b"job-c".to_vec() }]);

    // redelivered completion is a no-op and the counter stays at zero
    assert!(store.finish_node(&task, b, b"rb").await.unwrap().is_noop());
    assert_eq!(store.dependency_count(&task, c).await.unwrap(), Some(0));
    assert_eq!(store.begin_node(&task, b).await.unwrap(), Begin::AlreadyTerminal(NodeState::Finished));

    // a late dependent on finished nodes starts at zero
    let d = node(&store, &task, b"d", &[a, b]).await;
    assert_eq!(store.dependency_count(&task, d).await.unwrap(), Some(0));

    store.purge_task(&task).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn tail_links_forward_completion() {
    let store = store().await;
    let task = task_name("tail");

    let outer = node(&store, &task, b"outer", &[]).await;
    let middle = node(&store, &task, b"middle", &[]).await;
    let inner = node(&store, &task, b"inner", &[]).await;
    let waiter = node(&store, &task, b"job-waiter", &[outer]).await;

    assert_eq!(store.link_tail(&task, outer, middle).await.unwrap(), TailLink::Linked);
    assert_eq!(store.link_tail(&task, middle, inner).await.unwrap(), TailLink::Linked);
    assert_eq!(store.finish_pointer(&task, inner).await.unwrap(), Some(middle));

    let completion = store.finish_node(&task, inner, b"deep").await.unwrap();
    assert_eq!(completion.finished, vec![inner, middle, outer]);
    assert_eq!(completion.ready, vec![ReadyJob { exec_id: waiter, job: b"job-waiter".to_vec() }]);
    for id in [inner, middle, outer] {
        assert_eq!(store.peek_result(&task, id).await.unwrap(), Some(b"deep".to_vec()));
    }

    // linking onto an already finished target runs the cascade at once
    let late = node(&store, &task, b"late", &[]).await;
    match store.link_tail(&task, late, inner).await.unwrap() {
        TailLink::Completed(completion) => assert_eq!(completion.finished, vec![late]),
        other => panic!("expected immediate completion, got {other:?}"),
    }
    assert_eq!(store.peek_result(&task, late).await.unwrap(), Some(b"deep".to_vec()));

    store.purge_task(&task).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn failure_is_terminal_and_not_forwarded() {
    let store = store().await;
    let task = task_name("fail");

    let target = node(&store, &task, b"target", &[]).await;
    let forwarder = node(&store, &task, b"forwarder", &[]).await;
    let dependent = node(&store, &task, b"dependent", &[target]).await;
    assert_eq!(store.link_tail(&task, forwarder, target).await.unwrap(), TailLink::Linked);

    assert!(store.fail_node(&task, target, b"boom").await.unwrap());
    assert!(!store.fail_node(&task, target, b"again").await.unwrap());
    assert_eq!(store.node_state(&task, target).await.unwrap(), Some(NodeState::Error));
    assert_eq!(store.peek_result(&task, target).await.unwrap(), Some(b"boom".to_vec()));

    assert_eq!(store.node_state(&task, forwarder).await.unwrap(), Some(NodeState::Pending));
    assert_eq!(store.dependency_count(&task, dependent).await.unwrap(), Some(1));
    assert!(store.finish_node(&task, target, b"late").await.unwrap().is_noop());

    store.purge_task(&task).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn result_reads_leave_the_slot_intact() {
    let store = Arc::new(store().await);
    let task = task_name("result");
    let a = node(&store, &task, b"a", &[]).await;

    // a reader abandoned mid-wait must not take the result with it
    let abandoned = tokio::time::timeout(Duration::from_millis(200), store.wait_result(&task, a, None)).await;
    assert!(abandoned.is_err());
    assert_eq!(store.wait_result(&task, a, Some(Duration::from_millis(100))).await.unwrap(), None);

    let waiter = {
        let (store, task) = (store.clone(), task.clone());
        tokio::spawn(async move { store.wait_result(&task, a, None).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.finish_node(&task, a, b"value").await.unwrap();

    let woken = tokio::time::timeout(TEST_TIMEOUT, waiter).await.unwrap().unwrap();
    assert_eq!(woken, Some(b"value".to_vec()));
    for _ in 0..3 {
        assert_eq!(store.wait_result(&task, a, None).await.unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.peek_result(&task, a).await.unwrap(), Some(b"value".to_vec()));
    }

    store.purge_task(&task).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn purge_removes_every_key() {
    let store = store().await;
    let task = task_name("purge");
    let a = node(&store, &task, b"a", &[]).await;
    let b = node(&store, &task, b"b", &[a]).await;
    store.finish_node(&task, a, b"r").await.unwrap();

    // counter, hash, waiter set of a, result list of a
    assert_eq!(store.purge_task(&task).await.unwrap(), 4);
    assert_eq!(store.node_state(&task, b).await.unwrap(), None);
    assert_eq!(store.peek_result(&task, a).await.unwrap(), None);
    assert_eq!(store.next_exec_id(&task).await.unwrap(), 1);
    store.purge_task(&task).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn fan_in_releases_each_dependent_once() {
    let store = Arc::new(store().await);
    tokio::time::timeout(TEST_TIMEOUT, async {
        for round in 0..10 {
            let task = task_name("fan-in");
            let mut rng = rand::thread_rng();

            let width = rng.gen_range(2..12);
            let mut leaves = Vec::new();
            for _ in 0..width {
                leaves.push(node(&store, &task, b"leaf", &[]).await);
            }
            let all = node(&store, &task, b"all", &leaves).await;
            let half = node(&store, &task, b"half", &leaves[..width / 2 + 1]).await;

            let mut order = leaves.clone();
            order.shuffle(&mut rng);
            // every leaf is completed twice to mimic redelivery
            order.extend(leaves.iter().copied());

            let mut handles = Vec::new();
            for leaf in order {
                let (store, task) = (store.clone(), task.clone());
                handles.push(tokio::spawn(async move {
                    store.finish_node(&task, leaf, b"1").await.unwrap()
                }));
            }

            let mut released: HashMap<ExecId, usize> = HashMap::new();
            for handle in handles {
                for ready in handle.await.unwrap().ready {
                    *released.entry(ready.exec_id).or_default() += 1;
                }
            }

            assert_eq!(released.get(&all), Some(&1), "round {round}");
            assert_eq!(released.get(&half), Some(&1), "round {round}");
            assert_eq!(released.len(), 2, "round {round}");
            assert_eq!(store.dependency_count(&task, all).await.unwrap(), Some(0));
            store.purge_task(&task).await.unwrap();
        }
    })
    .await
    .expect("test timed out");
}
