/*!
In-memory archive store.
*/

use super::{validate_object_name, ArchiveStore, ObjectInfo, ObjectPage, PutOptions};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default number of objects returned per listing page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// An object as held by [`MemoryArchiveStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub options: PutOptions,
}

/// Archive store kept in process memory
///
/// Useful for tests and for dry runs of the pipeline. Clones share the same
/// objects.
#[derive(Debug, Clone)]
pub struct MemoryArchiveStore {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
    page_size: usize,
}

impl Default for MemoryArchiveStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Create a store whose listings return at most `page_size` objects per page
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            page_size: page_size.max(1),
        }
    }

    /// Look up a stored object with its write options
    pub fn object(&self, name: &str) -> Option<StoredObject> {
        self.lock().get(name).cloned()
    }

    /// Names of all stored objects in lexical order
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn put(&self, name: &str, body: Bytes, options: PutOptions) -> Result<()> {
        validate_object_name(name)?;
        self.lock()
            .insert(name.to_string(), StoredObject { body, options });
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.lock().get(name).map(|object| object.body.clone()))
    }

    async fn list(&self, cursor: Option<String>) -> Result<ObjectPage> {
        let objects = self.lock();
        let lower = match cursor {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };

        let mut remaining = objects.range((lower, Bound::Unbounded));
        let page: Vec<ObjectInfo> = remaining
            .by_ref()
            .take(self.page_size)
            .map(|(name, object)| ObjectInfo {
                name: name.clone(),
                size: Some(object.body.len() as u64),
            })
            .collect();
        let has_more = remaining.next().is_some();

        let cursor = if has_more {
            page.last().map(|object| object.name.clone())
        } else {
            None
        };
        Ok(ObjectPage {
            objects: page,
            cursor,
        })
    }

    async fn delete(&self, names: Vec<String>) -> Result<()> {
        let mut objects = self.lock();
        for name in &names {
            objects.remove(name);
        }
        Ok(())
    }
}
