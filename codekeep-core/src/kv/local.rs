/*!
Local filesystem key-value store.
*/

use super::{validate_key, KeyPage, KvStore};
use crate::{CodekeepError, Result};
use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const VALUE_SUFFIX: &str = ".json";

/// Filesystem-backed key-value store
///
/// Each key is stored as `<base_dir>/<key>.json`; `/` in a key becomes a
/// directory level. Listings are sorted and paginated like
/// [`MemoryKvStore`](super::MemoryKvStore).
///
/// # Example
/// ```rust,no_run
/// use codekeep_core::kv::{KvStore, LocalKvStore};
///
/// # async fn demo() -> codekeep_core::Result<()> {
/// let kv = LocalKvStore::with_base_dir("/var/lib/codekeep/kv");
/// kv.put("user_codes/1/2", serde_json::json!([])).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalKvStore {
    base_dir: PathBuf,
    page_size: usize,
}

impl LocalKvStore {
    /// Create a store rooted at `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            page_size: super::memory::DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the number of keys returned per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_dir.join(format!("{key}{VALUE_SUFFIX}")))
    }
}

#[async_trait]
impl KvStore for LocalKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.resolve_path(key)?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CodekeepError::storage(format!(
                "Failed to read value from {}: {e}",
                path.display()
            ))),
        }
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let path = self.resolve_path(key)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CodekeepError::storage(format!(
                    "Failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let bytes = serde_json::to_vec(&value)?;
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            CodekeepError::storage(format!("Failed to write value to {}: {e}", path.display()))
        })?;

        debug!(key = %key, path = %path.display(), "Stored value");
        Ok(())
    }

    async fn list(&self, prefix: &str, cursor: Option<&str>) -> Result<KeyPage> {
        let base_dir = self.base_dir.clone();
        let mut keys = tokio::task::spawn_blocking(move || collect_keys(&base_dir))
            .await
            .map_err(|e| CodekeepError::storage(format!("Key listing task failed: {e}")))??;

        keys.sort();
        let mut matching = keys
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| cursor.map_or(true, |after| key.as_str() > after));

        let page: Vec<String> = matching.by_ref().take(self.page_size).collect();
        let has_more = matching.next().is_some();

        let cursor = if has_more { page.last().cloned() } else { None };
        Ok(KeyPage { keys: page, cursor })
    }
}

/// Walk `base_dir` and turn every `*.json` file into its key
fn collect_keys(base_dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    if !base_dir.exists() {
        return Ok(keys);
    }

    let mut pending = vec![base_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }

            let Ok(relative) = path.strip_prefix(base_dir) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                continue;
            };
            if let Some(key) = relative.strip_suffix(VALUE_SUFFIX) {
                keys.push(key.replace(std::path::MAIN_SEPARATOR, "/"));
            }
        }
    }

    Ok(keys)
}
