//! In-process coordination store.
//!
//! Mirrors the Redis key layout on plain collections behind one mutex, so
//! every operation is atomic the same way the Lua scripts are.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::CoordError;
use crate::keys::{self, TaskKeys};
use crate::state::{Begin, Completion, ExecId, NodeState, ReadyJob, TailLink};
use crate::store::CoordinationStore;

#[derive(Default)]
struct Keyspace {
    counters: HashMap<String, u64>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    sets: HashMap<String, BTreeSet<ExecId>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
}

impl Keyspace {
    fn hget(&self, key: &str, field: &str) -> Option<&[u8]> {
        self.hashes.get(key)?.get(field).map(Vec::as_slice)
    }

    fn hset(&mut self, key: &str, field: String, value: impl Into<Vec<u8>>) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field, value.into());
    }

    fn hget_str(&self, key: &str, field: &str) -> Option<String> {
        self.hget(key, field)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    fn state(&self, keys: &TaskKeys, exec_id: ExecId) -> Result<Option<NodeState>, CoordError> {
        self.hget_str(&keys.hash(), &keys::state_field(exec_id))
            .map(|s| s.parse())
            .transpose()
    }

    fn set_state(&mut self, keys: &TaskKeys, exec_id: ExecId, state: NodeState) {
        self.hset(&keys.hash(), keys::state_field(exec_id), state.as_str());
    }

    fn finish_pointer(&self, keys: &TaskKeys, exec_id: ExecId) -> Option<ExecId> {
        self.hget_str(&keys.hash(), &keys::finish_pointer_field(exec_id))
            .and_then(|s| s.parse().ok())
    }

    fn store_result(&mut self, keys: &TaskKeys, exec_id: ExecId, payload: &[u8]) {
        let slot = self.lists.entry(keys.result(exec_id)).or_default();
        slot.clear();
        slot.push_back(payload.to_vec());
    }

    /// Completion cascade starting at `start`, same steps as the finish script.
    fn cascade(&mut self, keys: &TaskKeys, start: ExecId, payload: &[u8]) -> Result<Completion, CoordError> {
        let mut completion = Completion::default();
        if self.state(keys, start)?.is_some_and(|s| s.is_terminal()) {
            return Ok(completion);
        }

        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                break;
            }
            if !self.state(keys, id)?.is_some_and(|s| s.is_terminal()) {
                chain.push(id);
            }
            cursor = self.finish_pointer(keys, id);
        }

        let hash = keys.hash();
        for id in chain {
            self.set_state(keys, id, NodeState::Finished);
            self.store_result(keys, id, payload);
            completion.finished.push(id);

            let waiters: Vec<ExecId> = self
                .sets
                .get(&keys.waiters(id))
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for waiter in waiters {
                let field = keys::dep_cnt_field(waiter);
                let count: i64 = self
                    .hget_str(&hash, &field)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                if count <= 0 {
                    continue;
                }
                let count = count - 1;
                self.hset(&hash, field, count.to_string());
                if count == 0 {
                    let job = self
                        .hget(&hash, &keys::job_field(waiter))
                        .map(<[u8]>::to_vec)
                        .unwrap_or_default();
                    completion.ready.push(ReadyJob { exec_id: waiter, job });
                }
            }
        }
        Ok(completion)
    }
}

/// Memory-backed coordination store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Keyspace>,
    results: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Keyspace> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn next_exec_id(&self, task: &str) -> Result<ExecId, CoordError> {
        let keys = TaskKeys::new(task);
        let mut ks = self.lock();
        let counter = ks.counters.entry(keys.counter()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn register_node(
        &self,
        task: &str,
        exec_id: ExecId,
        job: &[u8],
        deps: &[ExecId],
    ) -> Result<u64, CoordError> {
        let keys = TaskKeys::new(task);
        let mut ks = self.lock();

        let mut states = Vec::with_capacity(deps.len());
        for &dep in deps {
            match ks.state(&keys, dep)? {
                Some(state) => states.push((dep, state)),
                None => {
                    return Err(CoordError::UnknownNode {
                        task: task.to_string(),
                        exec_id: dep,
                    })
                }
            }
        }

        let hash = keys.hash();
        ks.set_state(&keys, exec_id, NodeState::Pending);
        ks.hset(&hash, keys::job_field(exec_id), job);
        ks.hset(&hash, keys::dep_field(exec_id), keys::join_deps(deps));

        let mut count = 0u64;
        for (dep, state) in states {
            if !state.is_terminal() {
                count += 1;
                ks.sets.entry(keys.waiters(dep)).or_default().insert(exec_id);
            }
        }
        ks.hset(&hash, keys::dep_cnt_field(exec_id), count.to_string());
        debug!(task, exec_id, dep_count = count, "registered node");
        Ok(count)
    }

    async fn begin_node(&self, task: &str, exec_id: ExecId) -> Result<Begin, CoordError> {
        let keys = TaskKeys::new(task);
        let mut ks = self.lock();
        match ks.state(&keys, exec_id)? {
            Some(state) if state.is_terminal() => Ok(Begin::AlreadyTerminal(state)),
            previous => {
                ks.set_state(&keys, exec_id, NodeState::Running);
                Ok(Begin::Started(previous))
            }
        }
    }

    async fn node_state(&self, task: &str, exec_id: ExecId) -> Result<Option<NodeState>, CoordError> {
        self.lock().state(&TaskKeys::new(task), exec_id)
    }

    async fn dependency_count(&self, task: &str, exec_id: ExecId) -> Result<Option<i64>, CoordError> {
        let keys = TaskKeys::new(task);
        Ok(self
            .lock()
            .hget_str(&keys.hash(), &keys::dep_cnt_field(exec_id))
            .and_then(|s| s.parse().ok()))
    }

    async fn waiters(&self, task: &str, exec_id: ExecId) -> Result<Vec<ExecId>, CoordError> {
        let keys = TaskKeys::new(task);
        Ok(self
            .lock()
            .sets
            .get(&keys.waiters(exec_id))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn finish_pointer(&self, task: &str, exec_id: ExecId) -> Result<Option<ExecId>, CoordError> {
        Ok(self.lock().finish_pointer(&TaskKeys::new(task), exec_id))
    }

    async fn job(&self, task: &str, exec_id: ExecId) -> Result<Option<Vec<u8>>, CoordError> {
        let keys = TaskKeys::new(task);
        Ok(self
            .lock()
            .hget(&keys.hash(), &keys::job_field(exec_id))
            .map(<[u8]>::to_vec))
    }

    async fn peek_result(&self, task: &str, exec_id: ExecId) -> Result<Option<Vec<u8>>, CoordError> {
        let keys = TaskKeys::new(task);
        Ok(self
            .lock()
            .lists
            .get(&keys.result(exec_id))
            .and_then(|l| l.front().cloned()))
    }

    async fn wait_result(
        &self,
        task: &str,
        exec_id: ExecId,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, CoordError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.results.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.peek_result(task, exec_id).await? {
                return Ok(Some(payload));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn finish_node(&self, task: &str, exec_id: ExecId, payload: &[u8]) -> Result<Completion, CoordError> {
        let keys = TaskKeys::new(task);
        let completion = self.lock().cascade(&keys, exec_id, payload)?;
        if !completion.is_noop() {
            self.results.notify_waiters();
        }
        Ok(completion)
    }

    async fn fail_node(&self, task: &str, exec_id: ExecId, payload: &[u8]) -> Result<bool, CoordError> {
        let keys = TaskKeys::new(task);
        {
            let mut ks = self.lock();
            if ks.state(&keys, exec_id)?.is_some_and(|s| s.is_terminal()) {
                return Ok(false);
            }
            ks.set_state(&keys, exec_id, NodeState::Error);
            ks.store_result(&keys, exec_id, payload);
        }
        self.results.notify_waiters();
        Ok(true)
    }

    async fn link_tail(&self, task: &str, exec_id: ExecId, target: ExecId) -> Result<TailLink, CoordError> {
        let keys = TaskKeys::new(task);
        let completion = {
            let mut ks = self.lock();
            if ks.state(&keys, target)? == Some(NodeState::Finished) {
                let payload = ks
                    .lists
                    .get(&keys.result(target))
                    .and_then(|l| l.front().cloned())
                    .unwrap_or_default();
                ks.cascade(&keys, exec_id, &payload)?
            } else {
                ks.hset(&keys.hash(), keys::finish_pointer_field(target), exec_id.to_string());
                return Ok(TailLink::Linked);
            }
        };
        if !completion.is_noop() {
            self.results.notify_waiters();
        }
        Ok(TailLink::Completed(completion))
    }

    async fn purge_task(&self, task: &str) -> Result<u64, CoordError> {
        let keys = TaskKeys::new(task);
        let mut ks = self.lock();
        let mut removed = 0u64;
        let last = ks.counters.remove(&keys.counter());
        if let Some(last) = last {
            removed += 1;
            for id in 1..=last {
                removed += ks.sets.remove(&keys.waiters(id)).is_some() as u64;
                removed += ks.lists.remove(&keys.result(id)).is_some() as u64;
            }
        }
        removed += ks.hashes.remove(&keys.hash()).is_some() as u64;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TASK: &str = "task-under-test";

    async fn node(store: &MemoryStore, job: &[u8], deps: &[ExecId]) -> ExecId {
        let id = store.next_exec_id(TASK).await.unwrap();
        store.register_node(TASK, id, job, deps).await.unwrap();
        id
    }

    #[tokio::test]
    async fn exec_ids_are_monotonic_per_task() {
        let store = MemoryStore::new();
        assert_eq!(store.next_exec_id("a").await.unwrap(), 1);
        assert_eq!(store.next_exec_id("a").await.unwrap(), 2);
        assert_eq!(store.next_exec_id("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn registration_counts_only_pending_dependencies() {
        let store = MemoryStore::new();
        let a = node(&store, b"a", &[]).await;
        let b = node(&store, b"b", &[]).await;
        store.finish_node(TASK, a, b"ra").await.unwrap();

        let c = store.next_exec_id(TASK).await.unwrap();
        let count = store.register_node(TASK, c, b"c", &[a, b]).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.waiters(TASK, b).await.unwrap(), vec![c]);
        assert!(store.waiters(TASK, a).await.unwrap().is_empty());
        assert_eq!(store.node_state(TASK, c).await.unwrap(), Some(NodeState::Pending));
    }

    #[tokio::test]
    async fn errored_dependency_counts_as_terminal() {
        let store = MemoryStore::new();
        let a = node(&store, b"a", &[]).await;
        assert!(store.fail_node(TASK, a, b"boom").await.unwrap());
        let c = store.next_exec_id(TASK).await.unwrap();
        assert_eq!(store.register_node(TASK, c, b"c", &[a]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected_without_writes() {
        let store = MemoryStore::new();
        let c = store.next_exec_id(TASK).await.unwrap();
        let err = store.register_node(TASK, c, b"c", &[42]).await.unwrap_err();
        assert!(matches!(err, CoordError::UnknownNode { exec_id: 42, .. }));
        assert_eq!(store.node_state(TASK, c).await.unwrap(), None);
    }

    #[tokio::test]
    async fn finishing_last_dependency_releases_waiter_once() {
        let store = MemoryStore::new();
        let a = node(&store, b"a", &[]).await;
        let b = node(&store, b"b", &[]).await;
        let c = node(&store, b"job-c", &[a, b]).await;

        let first = store.finish_node(TASK, a, b"ra").await.unwrap();
        assert!(first.ready.is_empty());
        assert_eq!(store.dependency_count(TASK, c).await.unwrap(), Some(1));

        let second = store.finish_node(TASK, b, b"rb").await.unwrap();
        assert_eq!(second.ready, vec![ReadyJob { exec_id: c, job: b"job-c".to_vec() }]);

        // Redelivered completion changes nothing.
        let again = store.finish_node(TASK, b, b"rb").await.unwrap();
        assert!(again.is_noop());
        assert_eq!(store.dependency_count(TASK, c).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn begin_skips_terminal_nodes() {
        let store = MemoryStore::new();
        let a = node(&store, b"a", &[]).await;
        assert_eq!(store.begin_node(TASK, a).await.unwrap(), Begin::Started(Some(NodeState::Pending)));
        assert_eq!(store.node_state(TASK, a).await.unwrap(), Some(NodeState::Running));
        store.finish_node(TASK, a, b"r").await.unwrap();
        assert_eq!(store.begin_node(TASK, a).await.unwrap(), Begin::AlreadyTerminal(NodeState::Finished));
    }

    #[tokio::test]
    async fn tail_chain_finishes_every_link() {
        let store = MemoryStore::new();
        let outer = node(&store, b"outer", &[]).await;
        let middle = node(&store, b"middle", &[]).await;
        let inner = node(&store, b"inner", &[]).await;
        let dependent = node(&store, b"dependent", &[outer]).await;

        assert_eq!(store.link_tail(TASK, outer, middle).await.unwrap(), TailLink::Linked);
        assert_eq!(store.link_tail(TASK, middle, inner).await.unwrap(), TailLink::Linked);
        assert_eq!(store.finish_pointer(TASK, middle).await.unwrap(), Some(outer));

        let completion = store.finish_node(TASK, inner, b"value").await.unwrap();
        assert_eq!(completion.finished, vec![inner, middle, outer]);
        assert_eq!(completion.ready.len(), 1);
        assert_eq!(completion.ready[0].exec_id, dependent);
        for id in [inner, middle, outer] {
            assert_eq!(store.peek_result(TASK, id).await.unwrap().as_deref(), Some(&b"value"[..]));
        }
    }

    #[tokio::test]
    async fn linking_to_finished_target_completes_immediately() {
        let store = MemoryStore::new();
        let target = node(&store, b"t", &[]).await;
        let outer = node(&store, b"o", &[]).await;
        store.finish_node(TASK, target, b"done").await.unwrap();

        match store.link_tail(TASK, outer, target).await.unwrap() {
            TailLink::Completed(c) => assert_eq!(c.finished, vec![outer]),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(store.node_state(TASK, outer).await.unwrap(), Some(NodeState::Finished));
    }

    #[tokio::test]
    async fn linking_to_failed_target_only_records_pointer() {
        let store = MemoryStore::new();
        let target = node(&store, b"t", &[]).await;
        let outer = node(&store, b"o", &[]).await;
        store.fail_node(TASK, target, b"err").await.unwrap();

        assert_eq!(store.link_tail(TASK, outer, target).await.unwrap(), TailLink::Linked);
        assert_eq!(store.node_state(TASK, outer).await.unwrap(), Some(NodeState::Pending));
    }

    #[tokio::test]
    async fn wait_result_blocks_until_finish_and_is_repeatable() {
        let store = Arc::new(MemoryStore::new());
        let a = node(&store, b"a", &[]).await;

        let reader = store.clone();
        let waiter = tokio::spawn(async move { reader.wait_result(TASK, a, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.finish_node(TASK, a, b"42").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some(&b"42"[..]));
        assert_eq!(
            store.wait_result(TASK, a, Some(Duration::from_millis(5))).await.unwrap().as_deref(),
            Some(&b"42"[..])
        );
    }

    #[tokio::test]
    async fn wait_result_times_out() {
        let store = MemoryStore::new();
        let a = node(&store, b"a", &[]).await;
        let got = store.wait_result(TASK, a, Some(Duration::from_millis(10))).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn purge_removes_every_task_key() {
        let store = MemoryStore::new();
        let a = node(&store, b"a", &[]).await;
        let _b = node(&store, b"b", &[a]).await;
        store.finish_node(TASK, a, b"r").await.unwrap();

        // counter + hash + waiters(a) + result(a)
        assert_eq!(store.purge_task(TASK).await.unwrap(), 4);
        assert_eq!(store.node_state(TASK, a).await.unwrap(), None);
        assert_eq!(store.next_exec_id(TASK).await.unwrap(), 1);
    }
}
