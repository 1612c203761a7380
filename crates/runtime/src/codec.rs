//! Job descriptor and result payload encoding (MessagePack).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use coper_coord::ExecId;

use crate::error::RuntimeError;
use crate::value::Value;

/// Keyword arguments, ordered by name.
pub type Kwargs = BTreeMap<String, Value>;

/// One graph node's invocation. Stored verbatim at registration and sent
/// unchanged to the broker at dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub exec_id: ExecId,
    pub task_id: String,
    /// Registry reference (`namespace.TypeName`).
    #[serde(rename = "task")]
    pub operator: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub init_args: Vec<Value>,
    #[serde(default)]
    pub init_kwargs: Kwargs,
}

impl JobDescriptor {
    /// Referenced exec ids in args and kwargs, in first-seen order without duplicates.
    pub fn dependencies(&self) -> Vec<ExecId> {
        let mut refs = Vec::new();
        for arg in &self.args {
            arg.collect_refs(&mut refs);
        }
        for value in self.kwargs.values() {
            value.collect_refs(&mut refs);
        }
        let mut seen = std::collections::HashSet::new();
        refs.retain(|id| seen.insert(*id));
        refs
    }

    pub fn encode(&self) -> Result<Vec<u8>, RuntimeError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RuntimeError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Stored in a node's result slot when it ends in ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub stack: String,
}

impl ErrorPayload {
    pub fn encode(&self) -> Result<Vec<u8>, RuntimeError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RuntimeError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>, RuntimeError> {
    Ok(rmp_serde::to_vec(value)?)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value, RuntimeError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
