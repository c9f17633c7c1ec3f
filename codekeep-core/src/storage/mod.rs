/*!
Archive storage adapters.

This module defines the archival object store abstraction (port) and its
concrete implementations (adapters). The snapshot producer and retention
pruner only ever talk to [`ArchiveStore`], so backends can be swapped
through configuration.
*/

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use crate::config::{StorageBackend, StorageConfig};
use crate::{CodekeepError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Options attached to an object on write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// MIME type of the body
    pub content_type: Option<String>,
    /// Custom string metadata stored next to the body
    pub metadata: HashMap<String, String>,
}

/// Summary of one stored object as returned by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    /// Body size in bytes, when the backend reports it
    pub size: Option<u64>,
}

impl ObjectInfo {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            size: None,
        }
    }
}

/// One page of an object listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub objects: Vec<ObjectInfo>,
    /// Continuation cursor; `None` once the listing is complete
    pub cursor: Option<String>,
}

/// Archival object storage abstraction
///
/// Objects are immutable once written; the pipeline only creates, lists,
/// reads back, and deletes them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Write `body` under `name` with the given content type and metadata
    async fn put(&self, name: &str, body: Bytes, options: PutOptions) -> Result<()>;

    /// Read an object body back, or `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Bytes>>;

    /// List objects, resuming after `cursor` if given
    async fn list(&self, cursor: Option<String>) -> Result<ObjectPage>;

    /// Delete every named object in one batch; missing names are not an error
    async fn delete(&self, names: Vec<String>) -> Result<()>;
}

/// Follow continuation cursors until the store reports the listing complete
pub async fn list_all_objects(store: &dyn ArchiveStore) -> Result<Vec<ObjectInfo>> {
    let mut objects = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = store.list(cursor.clone()).await?;
        pages += 1;
        objects.extend(page.objects);

        match page.cursor {
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                return Err(CodekeepError::storage(
                    "Object listing returned a repeated cursor",
                ));
            }
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    debug!(pages, objects = objects.len(), "Listed archive objects");
    Ok(objects)
}

/// Create an archive store based on storage configuration
///
/// # Example
/// ```rust,no_run
/// use codekeep_core::{create_archive_store, StorageConfig};
///
/// # async fn demo() -> codekeep_core::Result<()> {
/// let store = create_archive_store(&StorageConfig::local("/var/lib/codekeep/archives")).await?;
/// # Ok(())
/// # }
/// ```
pub async fn create_archive_store(config: &StorageConfig) -> Result<Arc<dyn ArchiveStore>> {
    config.validate()?;

    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryArchiveStore::new())),
        StorageBackend::Local => {
            let base = config.local_base_path.clone().ok_or_else(|| {
                CodekeepError::validation("Local backend requires a base directory")
            })?;
            Ok(Arc::new(LocalArchiveStore::with_base_dir(base)))
        }
        #[cfg(feature = "s3")]
        StorageBackend::S3 => {
            let store = S3ArchiveStore::from_config(config).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        StorageBackend::S3 => Err(CodekeepError::validation(
            "S3 backend requires the `s3` feature",
        )),
    }
}

/// Validate a flat archive object name
pub(crate) fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(CodekeepError::invalid_key(format!(
            "invalid archive object name '{name}'"
        )));
    }
    Ok(())
}

// Re-export types for convenience
pub use local::LocalArchiveStore;
pub use memory::{MemoryArchiveStore, StoredObject};
#[cfg(feature = "s3")]
pub use s3::S3ArchiveStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_all_objects_follows_cursors() {
        let store = MemoryArchiveStore::with_page_size(3);
        for i in 0..10 {
            store
                .put(&format!("backup-{i}.json"), Bytes::from_static(b"{}"), PutOptions::default())
                .await
                .unwrap();
        }

        let objects = list_all_objects(&store).await.unwrap();
        assert_eq!(objects.len(), 10);
    }

    #[tokio::test]
    async fn test_list_all_objects_rejects_repeated_cursor() {
        let mut store = MockArchiveStore::new();
        store.expect_list().returning(|_| {
            Ok(ObjectPage {
                objects: vec![ObjectInfo::new("backup-1.json")],
                cursor: Some("same".to_string()),
            })
        });

        let result = list_all_objects(&store).await;
        assert!(matches!(result, Err(CodekeepError::Storage(_))));
    }

    #[tokio::test]
    async fn test_create_archive_store_from_config() {
        assert!(create_archive_store(&StorageConfig::memory()).await.is_ok());

        let temp_dir = tempfile::TempDir::new().unwrap();
        assert!(create_archive_store(&StorageConfig::local(temp_dir.path()))
            .await
            .is_ok());

        let invalid = StorageConfig {
            s3_bucket: None,
            ..StorageConfig::s3_with_bucket(String::new())
        };
        assert!(create_archive_store(&invalid).await.is_err());
    }

    #[test]
    fn test_validate_object_name() {
        assert!(validate_object_name("backup-1.json").is_ok());
        assert!(validate_object_name("notes.txt").is_ok());

        for bad in ["", ".meta", "a/b", "..", "a\\b"] {
            assert!(validate_object_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
