/*!
In-memory key-value store.
*/

use super::{KeyPage, KvStore};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default number of keys returned per listing page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Key-value store kept in a sorted in-process map
///
/// Listing is paginated the same way a remote store would be: keys come back
/// in lexical order and the cursor is the last key of the previous page.
/// Clones share the same underlying map.
#[derive(Debug, Clone)]
pub struct MemoryKvStore {
    data: Arc<Mutex<BTreeMap<String, serde_json::Value>>>,
    page_size: usize,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Create a store whose listings return at most `page_size` keys per page
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(BTreeMap::new())),
            page_size: page_size.max(1),
        }
    }

    /// Remove a key, returning whether it existed
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        super::validate_key(key)?;
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, prefix: &str, cursor: Option<&str>) -> Result<KeyPage> {
        let data = self.lock();
        let lower = match cursor {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut matching = data
            .range((lower, Bound::Unbounded))
            .map(|(key, _)| key)
            .skip_while(|key| key.as_str() < prefix)
            .take_while(|key| key.starts_with(prefix));

        let keys: Vec<String> = matching.by_ref().take(self.page_size).cloned().collect();
        let has_more = matching.next().is_some();

        let cursor = if has_more { keys.last().cloned() } else { None };
        Ok(KeyPage { keys, cursor })
    }
}
