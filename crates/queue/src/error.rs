//! Broker error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The provider could not be reached or rejected the request.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A received message body could not be turned back into bytes.
    #[error("malformed message: {0}")]
    Parse(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("ack failed: {0}")]
    Ack(String),

    /// The queue was closed by its owner; no further publish or poll succeeds.
    #[error("queue {0} is closed")]
    Closed(String),

    #[error("provider error: {0}")]
    Provider(String),
}
