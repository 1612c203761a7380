//! The coordination store contract.
//!
//! Every multi-step mutation (registration, completion cascade, tail
//! linking, failure) is atomic with respect to every other mutation on the
//! same task. Implementations must hold that under concurrent workers.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoordError;
use crate::state::{Begin, Completion, ExecId, NodeState, TailLink};

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Allocate the next exec id for `task`. The first id of a task is 1.
    async fn next_exec_id(&self, task: &str) -> Result<ExecId, CoordError>;

    /// Record a PENDING node with its job descriptor and register it as a
    /// waiter on each dependency that is not yet terminal.
    ///
    /// Returns the dependency count: how many of `deps` were still pending.
    /// `deps` must already be deduplicated. Fails with `UnknownNode` before
    /// writing anything if a dependency was never registered.
    async fn register_node(
        &self,
        task: &str,
        exec_id: ExecId,
        job: &[u8],
        deps: &[ExecId],
    ) -> Result<u64, CoordError>;

    /// Move a node to RUNNING unless it is already terminal.
    async fn begin_node(&self, task: &str, exec_id: ExecId) -> Result<Begin, CoordError>;

    async fn node_state(&self, task: &str, exec_id: ExecId) -> Result<Option<NodeState>, CoordError>;

    async fn dependency_count(&self, task: &str, exec_id: ExecId) -> Result<Option<i64>, CoordError>;

    /// Dependents registered on `exec_id`, sorted ascending.
    async fn waiters(&self, task: &str, exec_id: ExecId) -> Result<Vec<ExecId>, CoordError>;

    async fn finish_pointer(&self, task: &str, exec_id: ExecId) -> Result<Option<ExecId>, CoordError>;

    /// The stored job descriptor for a node.
    async fn job(&self, task: &str, exec_id: ExecId) -> Result<Option<Vec<u8>>, CoordError>;

    /// Non-blocking read of a node's result slot.
    async fn peek_result(&self, task: &str, exec_id: ExecId) -> Result<Option<Vec<u8>>, CoordError>;

    /// Block until the node's result slot is populated, then return it
    /// without consuming it. `None` timeout waits indefinitely; an elapsed
    /// timeout returns `Ok(None)`.
    async fn wait_result(
        &self,
        task: &str,
        exec_id: ExecId,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, CoordError>;

    /// Store a concrete result and run the completion cascade: follow finish
    /// pointers from `exec_id`, mark each node FINISHED with the same
    /// payload, and decrement every waiter. Nodes that are already terminal
    /// are left untouched, so a redelivered completion is a no-op.
    async fn finish_node(&self, task: &str, exec_id: ExecId, payload: &[u8]) -> Result<Completion, CoordError>;

    /// Mark a node ERROR and store its error payload. Returns false when the
    /// node was already terminal.
    async fn fail_node(&self, task: &str, exec_id: ExecId, payload: &[u8]) -> Result<bool, CoordError>;

    /// `exec_id` produced a reference to `target`: it finishes when `target`
    /// does. If `target` is already FINISHED the cascade runs now with its
    /// result. An ERROR target only records the pointer.
    async fn link_tail(&self, task: &str, exec_id: ExecId, target: ExecId) -> Result<TailLink, CoordError>;

    /// Delete every key belonging to `task`. Returns the number of keys removed.
    async fn purge_task(&self, task: &str) -> Result<u64, CoordError>;

    /// Round-trip to the backend.
    async fn ping(&self) -> Result<(), CoordError> {
        Ok(())
    }
}
