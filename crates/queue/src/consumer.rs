//! Broker traits and the delivery envelope.
//!
//! Delivery is at-least-once: a message stays invisible while a runner holds
//! it and comes back if it is nacked or never acknowledged.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::QueueError;

/// One delivery of a published job.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Provider message id, stable across redeliveries.
    pub id: String,
    /// The encoded job descriptor, byte for byte as published.
    pub body: Vec<u8>,
    /// Token for settling this particular delivery.
    pub receipt_handle: String,
    /// When the message was first published.
    pub timestamp: DateTime<Utc>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt_count: u32,
}

impl QueueMessage {
    pub fn is_redelivery(&self) -> bool {
        self.attempt_count > 1
    }
}

/// Snapshot reported by [`QueueConsumer::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    /// Messages waiting to be delivered, if the provider reports it.
    pub approximate_message_count: Option<u64>,
    /// "sqs" or "memory".
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth = self
            .approximate_message_count
            .map_or_else(|| "unknown".to_string(), |n| n.to_string());
        write!(f, "{} broker (connected: {}, waiting: {})", self.provider, self.connected, depth)
    }
}

#[async_trait]
pub trait QueueProducer: Send + Sync {
    /// Enqueue a job. Returns once the provider has persisted it.
    async fn publish(&self, body: &[u8]) -> Result<(), QueueError>;
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Receive up to `max_messages`, waiting at most the provider's long-poll
    /// interval. An empty vec means nothing arrived in time.
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError>;

    /// Settle a delivery for good.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Make a delivery visible again right away.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;

    /// Depth of the dead-letter queue, when one is attached.
    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(None)
    }
}

/// The job queue shared by clients and runners.
#[async_trait]
pub trait Broker: QueueProducer + QueueConsumer {
    /// Release the connection. Later calls may fail with [`QueueError::Closed`].
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
