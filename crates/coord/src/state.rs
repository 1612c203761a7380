use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoordError;

/// Graph node identifier, unique within one task.
pub type ExecId = u64;

/// Lifecycle of a graph node: `PENDING → RUNNING → {FINISHED | ERROR}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    Pending,
    Running,
    Finished,
    Error,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "PENDING",
            NodeState::Running => "RUNNING",
            NodeState::Finished => "FINISHED",
            NodeState::Error => "ERROR",
        }
    }

    /// FINISHED and ERROR never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Finished | NodeState::Error)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(NodeState::Pending),
            "RUNNING" => Ok(NodeState::Running),
            "FINISHED" => Ok(NodeState::Finished),
            "ERROR" => Ok(NodeState::Error),
            other => Err(CoordError::Protocol(format!("unknown node state {other:?}"))),
        }
    }
}

/// A dependent whose counter reached zero, with the job descriptor to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyJob {
    pub exec_id: ExecId,
    pub job: Vec<u8>,
}

/// Outcome of a completion cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Nodes marked FINISHED, in finish-pointer order (the starting node first).
    pub finished: Vec<ExecId>,
    /// Dependents released for dispatch.
    pub ready: Vec<ReadyJob>,
}

impl Completion {
    /// Nothing changed: the starting node was already terminal.
    pub fn is_noop(&self) -> bool {
        self.finished.is_empty()
    }
}

/// What `begin_node` found before marking a node RUNNING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// Node is now RUNNING; carries the state it had before (None if unknown).
    Started(Option<NodeState>),
    /// Node was already terminal and was left untouched.
    AlreadyTerminal(NodeState),
}

/// Result of recording a tail reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailLink {
    /// Finish pointer recorded; completion happens when the target finishes.
    Linked,
    /// Target had already finished, so the cascade ran immediately.
    Completed(Completion),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_string_roundtrip() {
        for state in [NodeState::Pending, NodeState::Running, NodeState::Finished, NodeState::Error] {
            assert_eq!(state.as_str().parse::<NodeState>().unwrap(), state);
        }
        assert!("DONE".parse::<NodeState>().is_err());
    }

    #[test]
    fn only_finished_and_error_are_terminal() {
        assert!(!NodeState::Pending.is_terminal());
        assert!(!NodeState::Running.is_terminal());
        assert!(NodeState::Finished.is_terminal());
        assert!(NodeState::Error.is_terminal());
    }
}
