use thiserror::Error;

use crate::state::ExecId;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unexpected store reply: {0}")]
    Protocol(String),

    #[error("task {task} has no node {exec_id}")]
    UnknownNode { task: String, exec_id: ExecId },
}
