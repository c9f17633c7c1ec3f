/*!
Key-value store port for the live code data.

The bot keeps one JSON value per key. Snapshots only need `get` and a
paginated prefix listing; `put` is used by the code-entry helpers and the CLI.
*/

pub mod local;
pub mod memory;

use crate::config::{KvBackend, KvConfig};
use crate::{CodekeepError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub use local::LocalKvStore;
pub use memory::MemoryKvStore;

/// One page of a prefix listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    /// Key names in this page
    pub keys: Vec<String>,
    /// Continuation cursor; `None` once the listing is complete
    pub cursor: Option<String>,
}

/// Key-value storage abstraction
///
/// Implementations must be safe to share across tasks. No isolation is
/// expected between concurrent readers and writers.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` if absent
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// List keys starting with `prefix`, resuming after `cursor` if given
    async fn list(&self, prefix: &str, cursor: Option<&str>) -> Result<KeyPage>;
}

/// Follow continuation cursors until the store reports the listing complete
pub async fn list_all_keys(kv: &dyn KvStore, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = kv.list(prefix, cursor.as_deref()).await?;
        pages += 1;
        keys.extend(page.keys);

        match page.cursor {
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                return Err(CodekeepError::storage(format!(
                    "Key listing for prefix '{prefix}' returned a repeated cursor"
                )));
            }
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    debug!(prefix = %prefix, pages, keys = keys.len(), "Listed keys");
    Ok(keys)
}

/// Create a key-value store from configuration
pub fn create_kv_store(config: &KvConfig) -> Result<Arc<dyn KvStore>> {
    config.validate()?;

    match config.backend {
        KvBackend::Memory => Ok(Arc::new(MemoryKvStore::new())),
        KvBackend::Local => {
            let base = config.local_base_path.clone().ok_or_else(|| {
                CodekeepError::validation("Local key-value store requires a base directory")
            })?;
            Ok(Arc::new(LocalKvStore::with_base_dir(base)))
        }
    }
}

/// Validate a key made of `/`-separated segments
///
/// Rejects empty keys, absolute keys, and empty, `.` or `..` segments so a
/// key can never escape a filesystem base directory.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CodekeepError::invalid_key("key cannot be empty"));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(CodekeepError::invalid_key(key));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(CodekeepError::invalid_key(key));
    }
    Ok(())
}
