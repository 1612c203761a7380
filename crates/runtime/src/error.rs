use std::time::Duration;

use coper_coord::{CoordError, ExecId};
use coper_queue::QueueError;
use coper_storage::StorageError;
use thiserror::Error;

/// Misuse of a [`Session`](crate::Session).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not entered: {0} is only available inside an entered session")]
    NotEntered(&'static str),

    #[error("session already entered")]
    AlreadyEntered,

    #[error("no task bound to this session")]
    NoTask,
}

/// Failure raised by an operator's compute step. Stored as the node's error payload.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero: {0}")]
    ZeroDivision(String),

    #[error("overflow: {0}")]
    Overflow(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Runtime(Box<RuntimeError>),

    #[error("{0}")]
    Failed(String),
}

impl From<RuntimeError> for OperatorError {
    fn from(e: RuntimeError) -> Self {
        OperatorError::Runtime(Box::new(e))
    }
}

impl From<SessionError> for OperatorError {
    fn from(e: SessionError) -> Self {
        OperatorError::Runtime(Box::new(e.into()))
    }
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("coordination store error: {0}")]
    Coord(#[from] CoordError),

    #[error("broker error: {0}")]
    Queue(#[from] QueueError),

    #[error("object store error: {0}")]
    Storage(#[from] StorageError),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("operator {0} is not registered")]
    UnknownOperator(String),

    #[error("operator {0} is already registered")]
    DuplicateOperator(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The node ended in ERROR; carries the remote message and trace.
    #[error("node {exec_id} failed: {message}")]
    Execution {
        exec_id: ExecId,
        message: String,
        stack: String,
    },

    #[error("timed out after {waited:?} waiting for node {exec_id}")]
    Timeout { exec_id: ExecId, waited: Duration },

    #[error("inconsistent node state: {0}")]
    Inconsistent(String),
}

impl RuntimeError {
    /// Broker or store unavailable: the message should be redelivered.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            RuntimeError::Coord(_) | RuntimeError::Queue(_) | RuntimeError::Storage(_) | RuntimeError::Inconsistent(_)
        )
    }
}
