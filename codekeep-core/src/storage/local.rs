/*!
Local filesystem archive store implementation.
*/

use super::{validate_object_name, ArchiveStore, ObjectInfo, ObjectPage, PutOptions};
use crate::{CodekeepError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory under the base holding content type and metadata sidecars
const SIDECAR_DIR: &str = ".meta";

/// Default number of objects returned per listing page
const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    content_type: Option<String>,
    metadata: HashMap<String, String>,
}

/// Local filesystem archive store
///
/// Each object is a file directly under the base directory. Content type and
/// metadata are kept as JSON in `<base_dir>/.meta/<name>.json` so listings
/// see only the objects themselves. The base directory is created on first
/// write.
///
/// # Example
/// ```rust,no_run
/// use codekeep_core::storage::{ArchiveStore, LocalArchiveStore, PutOptions};
///
/// # async fn demo() -> codekeep_core::Result<()> {
/// let store = LocalArchiveStore::with_base_dir("/var/lib/codekeep/archives");
/// store.put("backup-1.json", "{}".into(), PutOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalArchiveStore {
    base_dir: PathBuf,
    page_size: usize,
}

impl LocalArchiveStore {
    /// Create a new local archive store rooted at `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the number of objects returned per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Read back the content type and metadata written with an object
    pub async fn options(&self, name: &str) -> Result<Option<PutOptions>> {
        let path = self.sidecar_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let sidecar: Sidecar = serde_json::from_slice(&bytes)?;
                Ok(Some(PutOptions {
                    content_type: sidecar.content_type,
                    metadata: sidecar.metadata,
                }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CodekeepError::storage(format!(
                "Failed to read metadata {}: {e}",
                path.display()
            ))),
        }
    }

    fn resolve_path(&self, name: &str) -> Result<PathBuf> {
        validate_object_name(name)?;
        Ok(self.base_dir.join(name))
    }

    fn sidecar_path(&self, name: &str) -> Result<PathBuf> {
        validate_object_name(name)?;
        Ok(self.base_dir.join(SIDECAR_DIR).join(format!("{name}.json")))
    }

    /// Ensure the directory exists, creating it if necessary
    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            CodekeepError::storage(format!("Failed to create directory {}: {e}", dir.display()))
        })
    }
}

/// Remove a file, treating "already gone" as success
async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CodekeepError::storage(format!(
            "Failed to delete {}: {e}",
            path.display()
        ))),
    }
}

#[async_trait]
impl ArchiveStore for LocalArchiveStore {
    async fn put(&self, name: &str, body: Bytes, options: PutOptions) -> Result<()> {
        let full_path = self.resolve_path(name)?;
        let sidecar_path = self.sidecar_path(name)?;

        self.ensure_dir(&self.base_dir.join(SIDECAR_DIR)).await?;

        let sidecar = Sidecar {
            content_type: options.content_type,
            metadata: options.metadata,
        };
        tokio::fs::write(&sidecar_path, serde_json::to_vec_pretty(&sidecar)?)
            .await
            .map_err(|e| {
                CodekeepError::storage(format!(
                    "Failed to write metadata to {}: {e}",
                    sidecar_path.display()
                ))
            })?;

        tokio::fs::write(&full_path, &body).await.map_err(|e| {
            CodekeepError::storage(format!(
                "Failed to write archive to {}: {e}",
                full_path.display()
            ))
        })?;

        debug!(path = %full_path.display(), size = body.len(), "Wrote archive object");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        let full_path = self.resolve_path(name)?;
        match tokio::fs::read(&full_path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CodekeepError::storage(format!(
                "Failed to read archive from {}: {e}",
                full_path.display()
            ))),
        }
    }

    async fn list(&self, cursor: Option<String>) -> Result<ObjectPage> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ObjectPage::default()),
            Err(e) => {
                return Err(CodekeepError::storage(format!(
                    "Failed to list {}: {e}",
                    self.base_dir.display()
                )))
            }
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if cursor.as_deref().is_some_and(|after| name.as_str() <= after) {
                continue;
            }
            let size = entry.metadata().await.ok().map(|meta| meta.len());
            objects.push(ObjectInfo { name, size });
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        let has_more = objects.len() > self.page_size;
        objects.truncate(self.page_size);

        let cursor = if has_more {
            objects.last().map(|object| object.name.clone())
        } else {
            None
        };
        Ok(ObjectPage { objects, cursor })
    }

    async fn delete(&self, names: Vec<String>) -> Result<()> {
        let mut removed = 0usize;
        for name in &names {
            if remove_if_exists(&self.resolve_path(name)?).await? {
                removed += 1;
            }
            remove_if_exists(&self.sidecar_path(name)?).await?;
        }

        info!(
            requested = names.len(),
            removed,
            base_dir = %self.base_dir.display(),
            "Deleted archive objects"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn json_options() -> PutOptions {
        PutOptions {
            content_type: Some("application/json".to_string()),
            metadata: HashMap::from([
                ("keyCount".to_string(), "1".to_string()),
                ("version".to_string(), "1.0".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn test_local_archive_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalArchiveStore::with_base_dir(temp_dir.path());

        let body = Bytes::from_static(b"{\"data\":{}}");
        store
            .put("backup-1000.json", body.clone(), json_options())
            .await
            .unwrap();

        assert_eq!(store.get("backup-1000.json").await.unwrap(), Some(body));
        assert_eq!(
            store.options("backup-1000.json").await.unwrap(),
            Some(json_options())
        );

        store
            .delete(vec!["backup-1000.json".to_string()])
            .await
            .unwrap();
        assert!(store.get("backup-1000.json").await.unwrap().is_none());
        assert!(store.options("backup-1000.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_archive_listing_skips_sidecars() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalArchiveStore::with_base_dir(temp_dir.path()).with_page_size(2);

        for name in ["backup-1.json", "backup-2.json", "notes.txt"] {
            store
                .put(name, Bytes::from_static(b"{}"), PutOptions::default())
                .await
                .unwrap();
        }

        let first = store.list(None).await.unwrap();
        let names: Vec<_> = first.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["backup-1.json", "backup-2.json"]);
        assert_eq!(first.objects[0].size, Some(2));

        let second = store.list(first.cursor).await.unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].name, "notes.txt");
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn test_local_archive_missing_dir_lists_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalArchiveStore::with_base_dir(temp_dir.path().join("absent"));

        let page = store.list(None).await.unwrap();
        assert!(page.objects.is_empty());
    }

    #[tokio::test]
    async fn test_local_archive_delete_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalArchiveStore::with_base_dir(temp_dir.path());

        assert!(store
            .delete(vec!["backup-42.json".to_string()])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_local_archive_rejects_nested_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalArchiveStore::with_base_dir(temp_dir.path());

        let result = store
            .put("../escape.json", Bytes::new(), PutOptions::default())
            .await;
        assert!(matches!(result, Err(CodekeepError::InvalidKey(_))));
    }
}
