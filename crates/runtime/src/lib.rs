//! Client and worker runtime for coper task graphs.
//!
//! A client enters a [`Session`], binds a task, and invokes [`Computable`]s;
//! each invocation registers a graph node and returns a [`ResultHandle`]
//! immediately. Workers run [`Runner`] loops that pull dispatched nodes off
//! the broker, execute the registered [`Operator`], and release dependents
//! as their inputs finish.

pub mod builtin;
pub mod codec;
pub mod error;
pub mod handle;
pub mod operator;
pub mod runner;
pub mod session;
pub mod value;

pub use codec::{ErrorPayload, JobDescriptor, Kwargs};
pub use coper_coord::{ExecId, NodeState};
pub use error::{OperatorError, RuntimeError, SessionError};
pub use handle::{algebra, ResultHandle};
pub use operator::{Computable, Operator, OperatorFactory, OperatorInfo, OperatorRegistry};
pub use runner::{JobOutcome, Runner, RunnerPool, RunningPool, Shutdown};
pub use session::{Backends, Session};
pub use value::Value;
