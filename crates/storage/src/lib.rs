pub mod backend;
pub mod blob;
pub mod error;

use coper_core::config::{Config, ObjectStoreBackend};

pub use backend::{LocalBackend, S3Backend, StorageBackend};
pub use blob::{BlobHandle, BlobStore};
pub use error::StorageError;

impl BlobStore {
    /// Build the blob store selected by config.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        let backend = match config.object_store.backend {
            ObjectStoreBackend::Memory => StorageBackend::memory(),
            ObjectStoreBackend::Local => {
                StorageBackend::Local(LocalBackend::new(&config.object_store.root_dir)?)
            }
            ObjectStoreBackend::S3 => StorageBackend::S3(S3Backend::new(&config.aws)?),
        };
        Ok(BlobStore::new(backend))
    }
}
