//! Bucket/object blob store over an [`object_store`] backend.
//!
//! A bucket is a key prefix holding a `.bucket` marker object; objects live
//! at `<prefix>/<bucket>/<object_name>`.

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::PutPayload;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::error::StorageError;

const BUCKET_MARKER: &str = ".bucket";

/// Location of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHandle {
    pub bucket: String,
    pub object_name: String,
}

pub struct BlobStore {
    backend: StorageBackend,
}

impl BlobStore {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(StorageBackend::memory())
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    fn bucket_root(&self, bucket: &str) -> Result<String, StorageError> {
        validate_bucket(bucket)?;
        Ok(match self.backend.prefix() {
            "" => bucket.to_string(),
            prefix => format!("{prefix}/{bucket}"),
        })
    }

    fn object_path(&self, bucket: &str, object_name: &str) -> Result<Path, StorageError> {
        validate_object(object_name)?;
        Ok(Path::from(format!("{}/{}", self.bucket_root(bucket)?, object_name)))
    }

    fn marker_path(&self, bucket: &str) -> Result<Path, StorageError> {
        Ok(Path::from(format!("{}/{}", self.bucket_root(bucket)?, BUCKET_MARKER)))
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        match self.backend.store().head(&self.marker_path(bucket)?).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a bucket if it does not exist. Returns the bucket name.
    pub async fn make_bucket(&self, bucket: &str) -> Result<String, StorageError> {
        if !self.bucket_exists(bucket).await? {
            self.backend
                .store()
                .put(&self.marker_path(bucket)?, PutPayload::new())
                .await?;
            info!(bucket, backend = self.backend.name(), "created bucket");
        }
        Ok(bucket.to_string())
    }

    /// Remove a bucket and every object in it. Missing buckets are ignored.
    pub async fn delete_bucket(&self, bucket: &str) -> Result<String, StorageError> {
        if !self.bucket_exists(bucket).await? {
            return Ok(bucket.to_string());
        }
        let root = Path::from(self.bucket_root(bucket)?);
        let store = self.backend.store();
        let locations: Vec<Path> = store
            .list(Some(&root))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        let mut failures = Vec::new();
        for location in &locations {
            match store.delete(location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => failures.push(format!("{location}: {e}")),
            }
        }
        if !failures.is_empty() {
            return Err(StorageError::Other(format!(
                "error deleting objects from bucket {bucket}: {}",
                failures.join("\n")
            )));
        }
        info!(bucket, objects = locations.len(), "deleted bucket");
        Ok(bucket.to_string())
    }

    pub async fn write(
        &self,
        bucket: &str,
        object_name: &str,
        data: impl Into<Bytes>,
    ) -> Result<BlobHandle, StorageError> {
        let path = self.object_path(bucket, object_name)?;
        if !self.bucket_exists(bucket).await? {
            return Err(StorageError::NoSuchBucket(bucket.to_string()));
        }
        let data: Bytes = data.into();
        debug!(bucket, object_name, bytes = data.len(), "writing object");
        self.backend.store().put(&path, PutPayload::from(data)).await?;
        Ok(BlobHandle {
            bucket: bucket.to_string(),
            object_name: object_name.to_string(),
        })
    }

    /// Read an object. A missing object is `Ok(None)`.
    pub async fn read(&self, bucket: &str, object_name: &str) -> Result<Option<Bytes>, StorageError> {
        let path = self.object_path(bucket, object_name)?;
        match self.backend.store().get(&path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an object. Deleting a missing object succeeds.
    pub async fn delete(&self, bucket: &str, object_name: &str) -> Result<BlobHandle, StorageError> {
        let path = self.object_path(bucket, object_name)?;
        match self.backend.store().delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(BlobHandle {
            bucket: bucket.to_string(),
            object_name: object_name.to_string(),
        })
    }

    /// Object names in a bucket, sorted, excluding the bucket marker.
    pub async fn list(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        let root = self.bucket_root(bucket)?;
        let mut names: Vec<String> = self
            .backend
            .store()
            .list(Some(&Path::from(root.as_str())))
            .map_ok(|meta| meta.location.to_string())
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&format!("{root}/")).map(str::to_string))
            .filter(|name| name != BUCKET_MARKER)
            .collect();
        names.sort();
        Ok(names)
    }
}

fn validate_bucket(bucket: &str) -> Result<(), StorageError> {
    let reason = if bucket.is_empty() {
        Some("bucket name is empty")
    } else if bucket.contains('/') {
        Some("bucket name contains '/'")
    } else if bucket.starts_with('.') {
        Some("bucket name starts with '.'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StorageError::InvalidName { name: bucket.to_string(), reason }),
        None => Ok(()),
    }
}

fn validate_object(object_name: &str) -> Result<(), StorageError> {
    let reason = if object_name.is_empty() {
        Some("object name is empty")
    } else if object_name == BUCKET_MARKER {
        Some("object name is reserved")
    } else if object_name
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        Some("object name has an empty or relative path segment")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StorageError::InvalidName { name: object_name.to_string(), reason }),
        None => Ok(()),
    }
}
