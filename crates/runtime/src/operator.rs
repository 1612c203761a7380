//! Operators: the units of remote computation.
//!
//! Workers resolve an operator by its string reference in an
//! [`OperatorRegistry`], build it from the job's init args, and call
//! [`Operator::compute`]. Clients never touch the registry; they invoke a
//! [`Computable`], which registers a graph node and returns a handle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error};

use crate::codec::{JobDescriptor, Kwargs};
use crate::error::{OperatorError, RuntimeError};
use crate::handle::ResultHandle;
use crate::session::Session;
use crate::value::Value;

#[async_trait]
pub trait Operator: Send + Sync {
    /// Run on resolved arguments. Returning [`Value::Ref`] hands completion
    /// over to the referenced node.
    async fn compute(&self, session: &Session, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, OperatorError>;
}

/// Builds an operator instance from a job's init args.
pub type OperatorFactory =
    Arc<dyn Fn(&[Value], &Kwargs) -> Result<Box<dyn Operator>, OperatorError> + Send + Sync>;

/// Discovery metadata for a registered operator.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorInfo {
    pub reference: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
}

impl OperatorInfo {
    pub fn new(reference: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            description: description.into(),
            input_schema: serde_json::Value::Null,
            output_schema: serde_json::Value::Null,
        }
    }

    pub fn with_schemas(mut self, input: serde_json::Value, output: serde_json::Value) -> Self {
        self.input_schema = input;
        self.output_schema = output;
        self
    }
}

struct Registration {
    info: OperatorInfo,
    factory: OperatorFactory,
}

/// Typed operator registry keyed by `namespace.TypeName`.
/// Must be populated identically on every worker.
pub struct OperatorRegistry {
    operators: HashMap<String, Registration>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// Registry preloaded with `basic_ops.*` and `storage.Blob`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        if let Err(e) = crate::builtin::register_all(&mut registry) {
            error!(error = %e, "built-in operator registration failed");
        }
        registry
    }

    /// Register a factory. Returns error if the reference is taken.
    pub fn register(&mut self, info: OperatorInfo, factory: OperatorFactory) -> Result<(), RuntimeError> {
        if self.operators.contains_key(&info.reference) {
            return Err(RuntimeError::DuplicateOperator(info.reference));
        }
        self.operators
            .insert(info.reference.clone(), Registration { info, factory });
        Ok(())
    }

    /// Register an operator that takes no init args.
    pub fn register_stateless<O>(&mut self, info: OperatorInfo, make: fn() -> O) -> Result<(), RuntimeError>
    where
        O: Operator + 'static,
    {
        let reference = info.reference.clone();
        self.register(
            info,
            Arc::new(move |init_args: &[Value], init_kwargs: &Kwargs| {
                if !init_args.is_empty() || !init_kwargs.is_empty() {
                    return Err(OperatorError::Argument(format!("{reference} takes no init args")));
                }
                Ok(Box::new(make()) as Box<dyn Operator>)
            }),
        )
    }

    pub fn instantiate(
        &self,
        reference: &str,
        init_args: &[Value],
        init_kwargs: &Kwargs,
    ) -> Result<Box<dyn Operator>, OperatorError> {
        let registration = self
            .operators
            .get(reference)
            .ok_or_else(|| OperatorError::Runtime(Box::new(RuntimeError::UnknownOperator(reference.to_string()))))?;
        (registration.factory)(init_args, init_kwargs)
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.operators.contains_key(reference)
    }

    pub fn describe(&self, reference: &str) -> Option<&OperatorInfo> {
        self.operators.get(reference).map(|r| &r.info)
    }

    /// All registered operators, sorted by reference.
    pub fn list(&self) -> Vec<&OperatorInfo> {
        let mut infos: Vec<&OperatorInfo> = self.operators.values().map(|r| &r.info).collect();
        infos.sort_by(|a, b| a.reference.cmp(&b.reference));
        infos
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Client-side invocation ───────────────────────────────────────────

/// An operator reference plus its init args, ready to be invoked as graph nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Computable {
    reference: String,
    init_args: Vec<Value>,
    init_kwargs: Kwargs,
}

impl Computable {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            init_args: Vec::new(),
            init_kwargs: Kwargs::new(),
        }
    }

    pub fn with_init_args(mut self, args: Vec<Value>) -> Self {
        self.init_args = args;
        self
    }

    pub fn with_init_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.init_kwargs.insert(key.into(), value.into());
        self
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Register a node for this call and return its handle without waiting.
    ///
    /// Handles embedded anywhere in `args`/`kwargs` become dependencies. The
    /// job is published right away when none of them is pending; otherwise
    /// the last dependency to finish publishes it.
    pub async fn invoke(&self, session: &Session, args: Vec<Value>, kwargs: Kwargs) -> Result<ResultHandle, RuntimeError> {
        let task = session.task()?;
        let coord = session.coord()?;
        let broker = session.broker()?;

        if self.init_args.iter().chain(self.init_kwargs.values()).any(Value::contains_ref) {
            return Err(RuntimeError::InvalidArgument(format!(
                "init args of {} must be concrete values, not result references",
                self.reference
            )));
        }

        let exec_id = coord.next_exec_id(task).await?;
        let job = JobDescriptor {
            exec_id,
            task_id: task.to_string(),
            operator: self.reference.clone(),
            args,
            kwargs,
            init_args: self.init_args.clone(),
            init_kwargs: self.init_kwargs.clone(),
        };
        if job.dependencies().contains(&exec_id) {
            return Err(RuntimeError::InvalidArgument(format!("node {exec_id} cannot depend on itself")));
        }

        let encoded = job.encode()?;
        let pending = coord
            .register_node(task, exec_id, &encoded, &job.dependencies())
            .await?;
        if pending == 0 {
            broker.publish(&encoded).await?;
        }
        debug!(task, exec_id, operator = %self.reference, pending, "node registered");
        Ok(ResultHandle::new(exec_id, session.clone()))
    }

    /// Invoke with positional args only.
    pub async fn call(&self, session: &Session, args: Vec<Value>) -> Result<ResultHandle, RuntimeError> {
        self.invoke(session, args, Kwargs::new()).await
    }
}
