//! Result handles and the lazy operator algebra built on them.

use std::fmt;
use std::time::Duration;

use coper_coord::{ExecId, NodeState};
use tracing::debug;

use crate::builtin::basic as ops;
use crate::codec::{decode_value, ErrorPayload};
use crate::error::RuntimeError;
use crate::operator::Computable;
use crate::session::Session;
use crate::value::Value;

/// Reference to a graph node's eventual value.
///
/// Builder methods (`add`, `lt`, `logical_not`, ...) register a new node
/// computing the operation; nothing is resolved early. There is no boolean
/// conversion: compare with [`ResultHandle::lt`] and friends, then resolve.
#[derive(Clone)]
pub struct ResultHandle {
    exec_id: ExecId,
    session: Session,
}

impl ResultHandle {
    pub fn new(exec_id: ExecId, session: Session) -> Self {
        Self { exec_id, session }
    }

    pub fn exec_id(&self) -> ExecId {
        self.exec_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// This handle as an argument value.
    pub fn as_value(&self) -> Value {
        Value::Ref(self.exec_id)
    }

    /// Wait for the node to reach a terminal state and return its value.
    /// Repeated calls return the same value.
    pub async fn result(&self) -> Result<Value, RuntimeError> {
        self.wait(None).await
    }

    /// Like [`result`](Self::result) but gives up after `timeout`.
    pub async fn result_timeout(&self, timeout: Duration) -> Result<Value, RuntimeError> {
        self.wait(Some(timeout)).await
    }

    /// Current node state without waiting.
    pub async fn state(&self) -> Result<Option<NodeState>, RuntimeError> {
        let task = self.session.task()?;
        Ok(self.session.coord()?.node_state(task, self.exec_id).await?)
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<Value, RuntimeError> {
        let task = self.session.task()?;
        let coord = self.session.coord()?;
        let payload = coord
            .wait_result(task, self.exec_id, timeout)
            .await?
            .ok_or(RuntimeError::Timeout {
                exec_id: self.exec_id,
                waited: timeout.unwrap_or_default(),
            })?;

        match coord.node_state(task, self.exec_id).await? {
            Some(NodeState::Finished) => decode_value(&payload),
            Some(NodeState::Error) => {
                let failure = ErrorPayload::decode(&payload)?;
                debug!(task, exec_id = self.exec_id, error = %failure.error, "node failed");
                Err(RuntimeError::Execution {
                    exec_id: self.exec_id,
                    message: failure.error,
                    stack: failure.stack,
                })
            }
            other => Err(RuntimeError::Inconsistent(format!(
                "node {} has a result but state {:?}",
                self.exec_id, other
            ))),
        }
    }

    async fn unary(&self, reference: &str) -> Result<ResultHandle, RuntimeError> {
        Computable::new(reference)
            .call(&self.session, vec![self.as_value()])
            .await
    }

    async fn binary(&self, reference: &str, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        Computable::new(reference)
            .call(&self.session, vec![self.as_value(), other.into()])
            .await
    }

    // ── Arithmetic ──────────────────────────────────────────────

    pub async fn add(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::ADD, other).await
    }

    pub async fn sub(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::SUBTRACT, other).await
    }

    pub async fn mul(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::MULTIPLY, other).await
    }

    pub async fn div(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::DIVIDE, other).await
    }

    pub async fn floor_div(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::FLOOR_DIVIDE, other).await
    }

    pub async fn rem(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::MODULO, other).await
    }

    pub async fn pow(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::POWER, other).await
    }

    pub async fn neg(&self) -> Result<ResultHandle, RuntimeError> {
        self.unary(ops::NEGATE).await
    }

    // ── Bitwise ─────────────────────────────────────────────────

    pub async fn bitand(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::BITWISE_AND, other).await
    }

    pub async fn bitor(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::BITWISE_OR, other).await
    }

    pub async fn bitxor(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::BITWISE_XOR, other).await
    }

    pub async fn shl(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::LEFT_SHIFT, other).await
    }

    pub async fn shr(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::RIGHT_SHIFT, other).await
    }

    pub async fn invert(&self) -> Result<ResultHandle, RuntimeError> {
        self.unary(ops::INVERT).await
    }

    // ── Comparison ──────────────────────────────────────────────

    pub async fn equals(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::EQUAL, other).await
    }

    pub async fn not_equals(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::NOT_EQUAL, other).await
    }

    pub async fn lt(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::LESS, other).await
    }

    pub async fn le(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::LESS_EQUAL, other).await
    }

    pub async fn gt(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::GREATER, other).await
    }

    pub async fn ge(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::GREATER_EQUAL, other).await
    }

    // ── Logical ─────────────────────────────────────────────────

    pub async fn logical_and(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::LOGICAL_AND, other).await
    }

    pub async fn logical_or(&self, other: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        self.binary(ops::LOGICAL_OR, other).await
    }

    pub async fn logical_not(&self) -> Result<ResultHandle, RuntimeError> {
        self.unary(ops::LOGICAL_NOT).await
    }
}

impl fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Result id={}>", self.exec_id)
    }
}

impl From<&ResultHandle> for Value {
    fn from(handle: &ResultHandle) -> Self {
        handle.as_value()
    }
}

impl From<ResultHandle> for Value {
    fn from(handle: ResultHandle) -> Self {
        handle.as_value()
    }
}

/// Builders for a non-handle left operand, e.g. `algebra::sub(&s, 10, &h)` for `10 - h`.
pub mod algebra {
    use super::*;

    /// Register `reference(lhs, rhs)` as a new node.
    pub async fn apply(
        session: &Session,
        reference: &str,
        lhs: impl Into<Value>,
        rhs: impl Into<Value>,
    ) -> Result<ResultHandle, RuntimeError> {
        Computable::new(reference)
            .call(session, vec![lhs.into(), rhs.into()])
            .await
    }

    pub async fn add(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::ADD, lhs, rhs).await
    }

    pub async fn sub(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::SUBTRACT, lhs, rhs).await
    }

    pub async fn mul(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::MULTIPLY, lhs, rhs).await
    }

    pub async fn div(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::DIVIDE, lhs, rhs).await
    }

    pub async fn floor_div(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::FLOOR_DIVIDE, lhs, rhs).await
    }

    pub async fn rem(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::MODULO, lhs, rhs).await
    }

    pub async fn pow(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::POWER, lhs, rhs).await
    }

    pub async fn bitand(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::BITWISE_AND, lhs, rhs).await
    }

    pub async fn bitor(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::BITWISE_OR, lhs, rhs).await
    }

    pub async fn bitxor(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::BITWISE_XOR, lhs, rhs).await
    }

    pub async fn shl(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::LEFT_SHIFT, lhs, rhs).await
    }

    pub async fn shr(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::RIGHT_SHIFT, lhs, rhs).await
    }

    pub async fn lt(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::LESS, lhs, rhs).await
    }

    pub async fn le(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::LESS_EQUAL, lhs, rhs).await
    }

    pub async fn gt(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::GREATER, lhs, rhs).await
    }

    pub async fn ge(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::GREATER_EQUAL, lhs, rhs).await
    }

    pub async fn logical_and(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::LOGICAL_AND, lhs, rhs).await
    }

    pub async fn logical_or(s: &Session, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Result<ResultHandle, RuntimeError> {
        apply(s, ops::LOGICAL_OR, lhs, rhs).await
    }
}
