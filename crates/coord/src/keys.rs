//! Coordination-store key layout for one logical task.
//!
//! ```text
//! hash  runner-node:{task}              state:<id> dep_cnt:<id> dep:<id> job:<id> finish_pointer:<id>
//! int   runner-node-counter:{task}      exec_id allocation
//! set   runner-node-waiters:{task}:<id> dependents to notify when <id> finishes
//! list  runner-node-result:{task}:<id>  single-slot result / error payload
//! ```

use crate::state::ExecId;

/// Key builder bound to one task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKeys {
    task: String,
}

impl TaskKeys {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Per-task hash holding every node field.
    pub fn hash(&self) -> String {
        format!("runner-node:{}", self.task)
    }

    pub fn counter(&self) -> String {
        format!("runner-node-counter:{}", self.task)
    }

    /// Prefix for waiter sets; the exec id is appended.
    pub fn waiter_prefix(&self) -> String {
        format!("runner-node-waiters:{}:", self.task)
    }

    pub fn waiters(&self, exec_id: ExecId) -> String {
        format!("{}{}", self.waiter_prefix(), exec_id)
    }

    /// Prefix for result lists; the exec id is appended.
    pub fn result_prefix(&self) -> String {
        format!("runner-node-result:{}:", self.task)
    }

    pub fn result(&self, exec_id: ExecId) -> String {
        format!("{}{}", self.result_prefix(), exec_id)
    }
}

pub fn state_field(exec_id: ExecId) -> String {
    format!("state:{exec_id}")
}

pub fn dep_cnt_field(exec_id: ExecId) -> String {
    format!("dep_cnt:{exec_id}")
}

pub fn dep_field(exec_id: ExecId) -> String {
    format!("dep:{exec_id}")
}

pub fn job_field(exec_id: ExecId) -> String {
    format!("job:{exec_id}")
}

pub fn finish_pointer_field(exec_id: ExecId) -> String {
    format!("finish_pointer:{exec_id}")
}

/// Comma-separated dependency list, as stored under `dep:<id>`.
pub fn join_deps(deps: &[ExecId]) -> String {
    deps.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")
}
