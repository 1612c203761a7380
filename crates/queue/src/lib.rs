pub mod consumer;
pub mod error;
pub mod memory;
pub mod sqs;

use std::sync::Arc;
use std::time::Duration;

use coper_core::config::{Config, QueueBackend};
use tracing::info;

pub use consumer::{Broker, QueueConsumer, QueueHealth, QueueMessage, QueueProducer};
pub use error::QueueError;
pub use memory::MemoryQueue;
pub use sqs::SqsQueue;

/// Open the broker selected by config.
pub async fn connect(config: &Config) -> Result<Arc<dyn Broker>, QueueError> {
    match config.queue.backend {
        QueueBackend::Sqs => {
            let queue = SqsQueue::new(&config.aws, &config.queue).await?;
            Ok(Arc::new(queue))
        }
        QueueBackend::Memory => {
            info!(queue = %config.queue.name, "using in-process memory queue");
            Ok(Arc::new(MemoryQueue::with_timeouts(
                config.queue.name.clone(),
                Duration::from_secs(config.queue.visibility_timeout_secs as u64),
                Duration::from_secs(config.queue.wait_time_secs as u64),
            )))
        }
    }
}
