//! Shared coordination state for distributed graph execution: node states,
//! dependency counters, waiter sets, finish pointers and result slots.

pub mod error;
pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod state;
pub mod store;

use std::sync::Arc;

use coper_core::config::{Config, CoordBackend};
use tracing::info;

pub use error::CoordError;
pub use keys::TaskKeys;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use state::{Begin, Completion, ExecId, NodeState, ReadyJob, TailLink};
pub use store::CoordinationStore;

/// Open the coordination store selected by config.
pub async fn connect(config: &Config) -> Result<Arc<dyn CoordinationStore>, CoordError> {
    match config.coord.backend {
        CoordBackend::Redis => Ok(Arc::new(RedisStore::connect(&config.coord.redis_url).await?)),
        CoordBackend::Memory => {
            info!("using in-process memory coordination store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
