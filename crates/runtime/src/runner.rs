//! Worker loop: consume job descriptors, run operators, drive completion.
//!
//! A [`Runner`] is one consume loop over one session. [`RunnerPool`] starts
//! several of them and stops them together on shutdown. There is no
//! scheduler: every runner polls the same broker queue, and nodes become
//! visible on the queue only once all of their dependencies have finished.

use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coper_coord::{Begin, Completion, CoordinationStore, ExecId, NodeState, ReadyJob, TailLink};
use coper_core::config::{CoordBackend, QueueBackend};
use coper_core::Config;
use coper_queue::{Broker, QueueError, QueueMessage};
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_value, encode_value, ErrorPayload, JobDescriptor, Kwargs};
use crate::error::{OperatorError, RuntimeError};
use crate::operator::OperatorRegistry;
use crate::session::{Backends, Session};
use crate::value::Value;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

// ── Shutdown ─────────────────────────────────────────────────────────

/// One-shot stop signal shared by every runner of a pool.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────

/// What happened to one consumed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The node (and every node forwarding to it) finished; `dispatched`
    /// dependents were published.
    Finished {
        exec_id: ExecId,
        finished: Vec<ExecId>,
        dispatched: usize,
    },
    /// The operator returned a reference; the node completes when `target` does.
    Linked { exec_id: ExecId, target: ExecId },
    /// The node was marked ERROR.
    Failed { exec_id: ExecId, message: String },
    /// Redelivery of a node that is already terminal.
    Skipped { exec_id: ExecId, state: NodeState },
    /// Redelivery of a FINISHED node whose released dependents were still
    /// PENDING; they were published again.
    Redispatched { exec_id: ExecId, dispatched: usize },
}

/// Why a job could not produce a value.
enum Failure {
    /// Recorded on the node as its error payload.
    Node { message: String, stack: String },
    /// Leaves the message unacknowledged.
    Infrastructure(RuntimeError),
}

impl Failure {
    fn node(message: impl Into<String>) -> Self {
        Failure::Node {
            message: message.into(),
            stack: String::new(),
        }
    }
}

impl From<RuntimeError> for Failure {
    fn from(e: RuntimeError) -> Self {
        if e.is_infrastructure() {
            Failure::Infrastructure(e)
        } else {
            Failure::Node {
                message: e.to_string(),
                stack: error_chain(&e),
            }
        }
    }
}

impl From<coper_coord::CoordError> for Failure {
    fn from(e: coper_coord::CoordError) -> Self {
        Failure::Infrastructure(e.into())
    }
}

/// `error` followed by its `source()` chain, one cause per line.
fn error_chain(error: &dyn StdError) -> String {
    let mut trace = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(trace, "\n  caused by: {cause}");
        source = cause.source();
    }
    trace
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Runner ───────────────────────────────────────────────────────────

/// A single consume loop.
pub struct Runner {
    name: String,
    session: Session,
    registry: Arc<OperatorRegistry>,
    poll_batch: u32,
}

impl Runner {
    pub fn new(name: impl Into<String>, session: Session, registry: Arc<OperatorRegistry>) -> Self {
        Self {
            name: name.into(),
            session,
            registry,
            poll_batch: 1,
        }
    }

    pub fn with_poll_batch(mut self, poll_batch: u32) -> Self {
        self.poll_batch = poll_batch.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume until `shutdown` fires or the broker is closed. A batch that
    /// was already received is processed to the end before stopping.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<(), RuntimeError> {
        let broker = self.session.broker()?;
        info!(worker = %self.name, "runner started");

        while !shutdown.is_triggered() {
            let polled = tokio::select! {
                polled = broker.poll_batch(self.poll_batch) => polled,
                _ = shutdown.wait() => break,
            };
            match polled {
                Ok(messages) => {
                    for message in messages {
                        self.handle_message(broker.as_ref(), message).await;
                    }
                }
                Err(QueueError::Closed(_)) => {
                    info!(worker = %self.name, "broker closed");
                    break;
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }

        info!(worker = %self.name, "runner stopped");
        Ok(())
    }

    /// Poll once and process whatever arrived. Returns the outcomes of the
    /// jobs that were acknowledged.
    pub async fn run_once(&self) -> Result<Vec<JobOutcome>, RuntimeError> {
        let broker = self.session.broker()?;
        let messages = broker.poll_batch(self.poll_batch).await?;
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            if let Some(outcome) = self.handle_message(broker.as_ref(), message).await {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Process one delivery and ack or nack it. Undecodable bodies are
    /// dropped; infrastructure failures are nacked for redelivery.
    pub async fn handle_message(&self, broker: &dyn Broker, message: QueueMessage) -> Option<JobOutcome> {
        debug!(worker = %self.name, message_id = %message.id, attempt = message.attempt_count, "message received");

        let job = match JobDescriptor::decode(&message.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(worker = %self.name, message_id = %message.id, error = %e, "dropping undecodable job");
                self.settle(broker, &message, true).await;
                return None;
            }
        };

        match self.process(&job).await {
            Ok(outcome) => {
                self.log_outcome(&job, &outcome);
                self.settle(broker, &message, true).await;
                Some(outcome)
            }
            Err(e) => {
                error!(
                    worker = %self.name,
                    task = %job.task_id,
                    exec_id = job.exec_id,
                    operator = %job.operator,
                    error = %e,
                    "job aborted, returning message to the queue"
                );
                self.settle(broker, &message, false).await;
                None
            }
        }
    }

    async fn settle(&self, broker: &dyn Broker, message: &QueueMessage, ack: bool) {
        let result = if ack {
            broker.ack(&message.receipt_handle).await
        } else {
            broker.nack(&message.receipt_handle).await
        };
        if let Err(e) = result {
            error!(worker = %self.name, message_id = %message.id, ack, error = %e, "failed to settle message");
        }
    }

    fn log_outcome(&self, job: &JobDescriptor, outcome: &JobOutcome) {
        let (task, operator) = (&job.task_id, &job.operator);
        match outcome {
            JobOutcome::Finished { exec_id, finished, dispatched } => info!(
                worker = %self.name, task = %task, exec_id, operator = %operator,
                finished = finished.len(), dispatched, "node finished"
            ),
            JobOutcome::Linked { exec_id, target } => info!(
                worker = %self.name, task = %task, exec_id, operator = %operator, target,
                "node forwarded to tail"
            ),
            JobOutcome::Failed { exec_id, message } => info!(
                worker = %self.name, task = %task, exec_id, operator = %operator, error = %message,
                "node failed"
            ),
            JobOutcome::Skipped { exec_id, state } => warn!(
                worker = %self.name, task = %task, exec_id, operator = %operator, state = %state,
                "redelivered job for terminal node skipped"
            ),
            JobOutcome::Redispatched { exec_id, dispatched } => warn!(
                worker = %self.name, task = %task, exec_id, operator = %operator, dispatched,
                "redelivered job for finished node, pending dependents published again"
            ),
        }
    }

    /// Run one job through begin, resolve, compute and completion. Only
    /// infrastructure failures come back as `Err`.
    pub async fn process(&self, job: &JobDescriptor) -> Result<JobOutcome, RuntimeError> {
        let session = self.session.with_task(job.task_id.as_str());
        let coord = session.coord()?;
        let broker = session.broker()?;
        let task = job.task_id.as_str();
        let exec_id = job.exec_id;

        match coord.begin_node(task, exec_id).await? {
            Begin::AlreadyTerminal(NodeState::Finished) => {
                let released = self.released_dependents(coord.as_ref(), task, exec_id).await?;
                if released.is_empty() {
                    return Ok(JobOutcome::Skipped {
                        exec_id,
                        state: NodeState::Finished,
                    });
                }
                for ready in &released {
                    broker.publish(&ready.job).await?;
                }
                return Ok(JobOutcome::Redispatched {
                    exec_id,
                    dispatched: released.len(),
                });
            }
            Begin::AlreadyTerminal(state) => return Ok(JobOutcome::Skipped { exec_id, state }),
            Begin::Started(Some(NodeState::Running)) => {
                warn!(worker = %self.name, task, exec_id, "node was already running, executing again");
            }
            Begin::Started(_) => {}
        }

        let value = match self.execute(&session, coord.as_ref(), job).await {
            Ok(value) => value,
            Err(Failure::Infrastructure(e)) => return Err(e),
            Err(Failure::Node { message, stack }) => {
                return self.fail(coord.as_ref(), task, exec_id, message, stack).await;
            }
        };

        match value {
            Value::Ref(target) if target == exec_id => {
                self.fail(
                    coord.as_ref(),
                    task,
                    exec_id,
                    format!("operator {} returned a reference to its own node", job.operator),
                    String::new(),
                )
                .await
            }
            Value::Ref(target) => match coord.link_tail(task, exec_id, target).await? {
                TailLink::Linked => Ok(JobOutcome::Linked { exec_id, target }),
                TailLink::Completed(completion) => self.complete(broker.as_ref(), exec_id, completion).await,
            },
            value => {
                let payload = match encode_value(&value) {
                    Ok(payload) => payload,
                    Err(e) => {
                        let stack = error_chain(&e);
                        return self.fail(coord.as_ref(), task, exec_id, e.to_string(), stack).await;
                    }
                };
                let completion = coord.finish_node(task, exec_id, &payload).await?;
                self.complete(broker.as_ref(), exec_id, completion).await
            }
        }
    }

    async fn execute(
        &self,
        session: &Session,
        coord: &dyn CoordinationStore,
        job: &JobDescriptor,
    ) -> Result<Value, Failure> {
        let task = job.task_id.as_str();

        let mut resolved = HashMap::new();
        for dep in job.dependencies() {
            match coord.node_state(task, dep).await? {
                Some(NodeState::Finished) => {
                    let payload = coord.peek_result(task, dep).await?.ok_or_else(|| {
                        Failure::Infrastructure(RuntimeError::Inconsistent(format!(
                            "dependency {dep} is FINISHED without a result"
                        )))
                    })?;
                    resolved.insert(dep, decode_value(&payload)?);
                }
                Some(NodeState::Error) => return Err(Failure::node(format!("Previous task {dep} failed"))),
                other => {
                    return Err(Failure::Infrastructure(RuntimeError::Inconsistent(format!(
                        "node {} dispatched while dependency {dep} is {}",
                        job.exec_id,
                        other.map_or("unregistered", |s| s.as_str())
                    ))))
                }
            }
        }

        let args: Vec<Value> = job.args.iter().map(|a| a.substitute(&resolved)).collect();
        let kwargs: Kwargs = job
            .kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.substitute(&resolved)))
            .collect();

        let operator = self
            .registry
            .instantiate(&job.operator, &job.init_args, &job.init_kwargs)
            .map_err(|e| operator_failure(&job.operator, e))?;

        debug!(worker = %self.name, task, exec_id = job.exec_id, operator = %job.operator, "computing");
        match AssertUnwindSafe(operator.compute(session, args, kwargs)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(operator_failure(&job.operator, e)),
            Err(panic) => Err(Failure::Node {
                message: format!("operator {} panicked: {}", job.operator, panic_message(panic.as_ref())),
                stack: String::new(),
            }),
        }
    }

    async fn fail(
        &self,
        coord: &dyn CoordinationStore,
        task: &str,
        exec_id: ExecId,
        message: String,
        stack: String,
    ) -> Result<JobOutcome, RuntimeError> {
        let payload = ErrorPayload {
            error: message.clone(),
            stack,
        }
        .encode()?;
        if !coord.fail_node(task, exec_id, &payload).await? {
            let state = coord
                .node_state(task, exec_id)
                .await?
                .unwrap_or(NodeState::Finished);
            return Ok(JobOutcome::Skipped { exec_id, state });
        }
        Ok(JobOutcome::Failed { exec_id, message })
    }

    /// Dependents released by a FINISHED node (or any node forwarding to it)
    /// that are still PENDING. The cascade commits before the worker
    /// publishes, so after a failed publish these exist only here.
    async fn released_dependents(
        &self,
        coord: &dyn CoordinationStore,
        task: &str,
        exec_id: ExecId,
    ) -> Result<Vec<ReadyJob>, RuntimeError> {
        let mut released: Vec<ReadyJob> = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(exec_id);
        while let Some(node) = cursor {
            if !seen.insert(node) || coord.node_state(task, node).await? != Some(NodeState::Finished) {
                break;
            }
            for waiter in coord.waiters(task, node).await? {
                if released.iter().any(|r| r.exec_id == waiter)
                    || coord.dependency_count(task, waiter).await? != Some(0)
                    || coord.node_state(task, waiter).await? != Some(NodeState::Pending)
                {
                    continue;
                }
                if let Some(job) = coord.job(task, waiter).await? {
                    released.push(ReadyJob { exec_id: waiter, job });
                }
            }
            cursor = coord.finish_pointer(task, node).await?;
        }
        Ok(released)
    }

    /// Publish every job the cascade released.
    async fn complete(
        &self,
        broker: &dyn Broker,
        exec_id: ExecId,
        completion: Completion,
    ) -> Result<JobOutcome, RuntimeError> {
        for ready in &completion.ready {
            broker.publish(&ready.job).await?;
            debug!(worker = %self.name, exec_id = ready.exec_id, "dependent dispatched");
        }
        Ok(JobOutcome::Finished {
            exec_id,
            dispatched: completion.ready.len(),
            finished: completion.finished,
        })
    }
}

/// Operator failures become node errors, except a store or broker outage
/// surfacing through the operator, which is retried by redelivery.
fn operator_failure(operator: &str, error: OperatorError) -> Failure {
    match error {
        OperatorError::Runtime(inner) if inner.is_infrastructure() => Failure::Infrastructure(*inner),
        other => Failure::Node {
            message: other.to_string(),
            stack: format!("in operator {operator}\n{}", error_chain(&other)),
        },
    }
}

// ── RunnerPool ───────────────────────────────────────────────────────

enum PoolBackends {
    /// Every runner gets its own session connected from config.
    PerRunner(Config),
    /// Every runner shares one set of backends.
    Shared(Backends),
}

/// Starts `concurrency` runners and stops them together.
pub struct RunnerPool {
    backends: PoolBackends,
    registry: Arc<OperatorRegistry>,
    concurrency: usize,
    poll_batch: u32,
    shutdown_timeout: Duration,
}

impl RunnerPool {
    /// Pool sized from `config.worker`. Memory backends only exist inside one
    /// process, so they are connected once and shared by every runner.
    pub fn new(config: Config, registry: Arc<OperatorRegistry>) -> Self {
        let worker = config.worker.clone();
        Self {
            backends: PoolBackends::PerRunner(config),
            registry,
            concurrency: worker.concurrency as usize,
            poll_batch: worker.poll_batch,
            shutdown_timeout: Duration::from_secs(worker.shutdown_timeout_secs),
        }
    }

    /// Pool whose runners all use `backends`.
    pub fn with_backends(backends: Backends, registry: Arc<OperatorRegistry>) -> Self {
        Self {
            backends: PoolBackends::Shared(backends),
            registry,
            concurrency: 4,
            poll_batch: 1,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn poll_batch(mut self, poll_batch: u32) -> Self {
        self.poll_batch = poll_batch.max(1);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Connect and spawn every runner.
    pub async fn start(self) -> Result<RunningPool, RuntimeError> {
        let shutdown = Arc::new(Shutdown::new());
        let mut sessions = Vec::with_capacity(self.concurrency);

        match &self.backends {
            PoolBackends::Shared(backends) => {
                sessions.extend((0..self.concurrency).map(|_| Session::with_backends(backends.clone())));
            }
            PoolBackends::PerRunner(config)
                if config.coord.backend == CoordBackend::Memory || config.queue.backend == QueueBackend::Memory =>
            {
                warn!("memory backends are process-local; all runners share one set");
                let backends = Backends::connect(config).await?;
                sessions.extend((0..self.concurrency).map(|_| Session::with_backends(backends.clone())));
            }
            PoolBackends::PerRunner(config) => {
                for _ in 0..self.concurrency {
                    let session = Session::new(config.clone());
                    session.enter().await?;
                    sessions.push(session);
                }
            }
        }

        let handles = sessions
            .iter()
            .enumerate()
            .map(|(i, session)| {
                let runner = Runner::new(format!("runner-{i}"), session.clone(), self.registry.clone())
                    .with_poll_batch(self.poll_batch);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { runner.run(&shutdown).await })
            })
            .collect();

        info!(
            concurrency = self.concurrency,
            poll_batch = self.poll_batch,
            operators = self.registry.len(),
            "runner pool started"
        );

        Ok(RunningPool {
            handles,
            sessions,
            shutdown,
            shutdown_timeout: self.shutdown_timeout,
            owns_sessions: matches!(self.backends, PoolBackends::PerRunner(_)),
        })
    }
}

/// Handle to the spawned runners of a [`RunnerPool`].
pub struct RunningPool {
    handles: Vec<JoinHandle<Result<(), RuntimeError>>>,
    sessions: Vec<Session>,
    shutdown: Arc<Shutdown>,
    shutdown_timeout: Duration,
    owns_sessions: bool,
}

impl RunningPool {
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Block until SIGINT/SIGTERM or a programmatic trigger, then stop.
    pub async fn run_until_signal(self) -> Result<(), RuntimeError> {
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = os_signal() => info!("shutdown signal received"),
            _ = shutdown.wait() => info!("shutdown requested"),
        }
        self.stop().await
    }

    /// Signal every runner and wait up to the shutdown timeout for them to
    /// drain. Runners still busy after that are aborted; their messages
    /// become visible again once the broker's visibility timeout lapses.
    pub async fn stop(self) -> Result<(), RuntimeError> {
        self.shutdown.trigger();
        info!(runners = self.handles.len(), timeout = ?self.shutdown_timeout, "stopping runner pool");

        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(self.handles)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "runner exited with error"),
                        Err(e) => warn!(error = %e, "runner task panicked"),
                    }
                }
            }
            Err(_) => {
                warn!("runner pool did not drain in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        if self.owns_sessions {
            for session in &self.sessions {
                if session.is_entered() {
                    session.exit().await?;
                }
            }
        }
        info!("runner pool stopped");
        Ok(())
    }
}

/// SIGINT or SIGTERM on Unix, Ctrl+C elsewhere. If the handlers cannot be
/// installed this never resolves and only a programmatic trigger stops the pool.
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::basic;
    use crate::operator::{Computable, Operator, OperatorInfo};
    use async_trait::async_trait;

    struct Boom;

    #[async_trait]
    impl Operator for Boom {
        async fn compute(&self, _: &Session, _: Vec<Value>, _: Kwargs) -> Result<Value, OperatorError> {
            Err(OperatorError::Failed("boom".into()))
        }
    }

    struct Panics;

    #[async_trait]
    impl Operator for Panics {
        async fn compute(&self, _: &Session, _: Vec<Value>, _: Kwargs) -> Result<Value, OperatorError> {
            panic!("operator bug")
        }
    }

    fn registry() -> Arc<OperatorRegistry> {
        let mut registry = OperatorRegistry::with_builtins();
        registry
            .register_stateless(OperatorInfo::new("test.Boom", "always fails"), || Boom)
            .unwrap();
        registry
            .register_stateless(OperatorInfo::new("test.Panics", "always panics"), || Panics)
            .unwrap();
        Arc::new(registry)
    }

    fn runner(session: &Session) -> Runner {
        Runner::new("test", session.clone(), registry()).with_poll_batch(10)
    }

    #[tokio::test]
    async fn shutdown_wait_returns_after_trigger() {
        let shutdown = Arc::new(Shutdown::new());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // already triggered: returns immediately
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn run_once_finishes_and_dispatches_dependent() {
        let session = Session::in_memory().with_task("t");
        let a = Computable::new(basic::ADD)
            .call(&session, vec![Value::Int(1), Value::Int(2)])
            .await
            .unwrap();
        let b = a.mul(10).await.unwrap();

        let worker = runner(&session);
        let outcomes = worker.run_once().await.unwrap();
        assert_eq!(
            outcomes,
            vec![JobOutcome::Finished {
                exec_id: a.exec_id(),
                finished: vec![a.exec_id()],
                dispatched: 1
            }]
        );
        let outcomes = worker.run_once().await.unwrap();
        assert!(matches!(outcomes[..], [JobOutcome::Finished { exec_id, .. }] if exec_id == b.exec_id()));
        assert_eq!(b.result().await.unwrap(), Value::Int(30));
    }

    #[tokio::test]
    async fn operator_error_marks_node_failed() {
        let session = Session::in_memory().with_task("t");
        let handle = Computable::new("test.Boom").call(&session, vec![]).await.unwrap();
        let outcomes = runner(&session).run_once().await.unwrap();
        assert!(matches!(&outcomes[..], [JobOutcome::Failed { message, .. }] if message == "boom"));

        match handle.result().await {
            Err(RuntimeError::Execution { message, stack, .. }) => {
                assert_eq!(message, "boom");
                assert!(stack.contains("test.Boom"));
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panic_is_captured_as_failure() {
        let session = Session::in_memory().with_task("t");
        let handle = Computable::new("test.Panics").call(&session, vec![]).await.unwrap();
        runner(&session).run_once().await.unwrap();
        let err = handle.result().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Execution { ref message, .. } if message.contains("operator bug")));
    }

    #[tokio::test]
    async fn unknown_operator_fails_the_node() {
        let session = Session::in_memory().with_task("t");
        let handle = Computable::new("test.Missing").call(&session, vec![]).await.unwrap();
        runner(&session).run_once().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), Some(NodeState::Error));
    }

    #[tokio::test]
    async fn redelivered_terminal_job_is_skipped() {
        let session = Session::in_memory().with_task("t");
        let handle = Computable::new(basic::ADD)
            .call(&session, vec![Value::Int(1), Value::Int(1)])
            .await
            .unwrap();
        let worker = runner(&session);
        worker.run_once().await.unwrap();

        let job = JobDescriptor::decode(&session.coord().unwrap().job("t", handle.exec_id()).await.unwrap().unwrap())
            .unwrap();
        let outcome = worker.process(&job).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Skipped {
                exec_id: handle.exec_id(),
                state: NodeState::Finished
            }
        );
        assert_eq!(handle.result().await.unwrap(), Value::Int(2));
    }

    /// Memory queue whose publish can be switched off.
    struct UnreliablePublish {
        inner: coper_queue::MemoryQueue,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl coper_queue::QueueProducer for UnreliablePublish {
        async fn publish(&self, body: &[u8]) -> Result<(), QueueError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(QueueError::Publish("broker unavailable".into()));
            }
            self.inner.publish(body).await
        }
    }

    #[async_trait]
    impl coper_queue::QueueConsumer for UnreliablePublish {
        async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
            self.inner.poll_batch(max_messages).await
        }

        async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
            self.inner.ack(receipt_handle).await
        }

        async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
            self.inner.nack(receipt_handle).await
        }

        async fn health_check(&self) -> Result<coper_queue::QueueHealth, QueueError> {
            self.inner.health_check().await
        }
    }

    impl Broker for UnreliablePublish {}

    #[tokio::test]
    async fn failed_dependent_publish_is_recovered_on_redelivery() {
        let broker = Arc::new(UnreliablePublish {
            inner: coper_queue::MemoryQueue::new("q"),
            refuse: AtomicBool::new(false),
        });
        let backends = Backends {
            broker: broker.clone(),
            ..Backends::in_memory()
        };
        let session = Session::with_backends(backends).with_task("t");
        let a = Computable::new(basic::ADD)
            .call(&session, vec![Value::Int(1), Value::Int(2)])
            .await
            .unwrap();
        let b = a.mul(10).await.unwrap();
        let worker = runner(&session);

        // the cascade commits, then publishing b fails and a is nacked
        broker.refuse.store(true, Ordering::SeqCst);
        assert!(worker.run_once().await.unwrap().is_empty());
        assert_eq!(a.state().await.unwrap(), Some(NodeState::Finished));
        assert_eq!(b.state().await.unwrap(), Some(NodeState::Pending));

        broker.refuse.store(false, Ordering::SeqCst);
        let outcomes = worker.run_once().await.unwrap();
        assert_eq!(
            outcomes,
            vec![JobOutcome::Redispatched {
                exec_id: a.exec_id(),
                dispatched: 1
            }]
        );
        let outcomes = worker.run_once().await.unwrap();
        assert!(matches!(outcomes[..], [JobOutcome::Finished { exec_id, .. }] if exec_id == b.exec_id()));
        assert_eq!(b.result().await.unwrap(), Value::Int(30));
    }

    #[tokio::test]
    async fn redelivery_skips_dependents_already_running() {
        let session = Session::in_memory().with_task("t");
        let a = Computable::new(basic::ADD)
            .call(&session, vec![Value::Int(1), Value::Int(2)])
            .await
            .unwrap();
        let b = a.mul(10).await.unwrap();
        let worker = runner(&session);
        worker.run_once().await.unwrap();
        let coord = session.coord().unwrap();
        coord.begin_node("t", b.exec_id()).await.unwrap();

        let job = JobDescriptor::decode(&coord.job("t", a.exec_id()).await.unwrap().unwrap()).unwrap();
        assert_eq!(
            worker.process(&job).await.unwrap(),
            JobOutcome::Skipped {
                exec_id: a.exec_id(),
                state: NodeState::Finished
            }
        );
    }

    #[tokio::test]
    async fn undecodable_message_is_dropped() {
        let session = Session::in_memory().with_task("t");
        let broker = session.broker().unwrap();
        broker.publish(b"not msgpack").await.unwrap();
        let outcomes = runner(&session).run_once().await.unwrap();
        assert!(outcomes.is_empty());
        let health = broker.health_check().await.unwrap();
        assert_eq!(health.approximate_message_count, Some(0));
    }

    #[tokio::test]
    async fn pool_stops_on_trigger() {
        let pool = RunnerPool::with_backends(Backends::in_memory(), registry())
            .concurrency(3)
            .shutdown_timeout(Duration::from_secs(2))
            .start()
            .await
            .unwrap();
        assert_eq!(pool.len(), 3);
        tokio::time::timeout(Duration::from_secs(5), pool.stop())
            .await
            .unwrap()
            .unwrap();
    }
}
