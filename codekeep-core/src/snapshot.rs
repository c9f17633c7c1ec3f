/*!
Snapshot producer: exports every live key under the storage prefix into one
versioned archive object.

The export is a point-in-time read, not a transaction. Keys written while the
listing is running may or may not be captured, and a key deleted between
listing and fetch is simply left out.
*/

use crate::archive::{archive_name, ArchiveDocument, ARCHIVE_CONTENT_TYPE};
use crate::clock::{Clock, SystemClock};
use crate::kv::{list_all_keys, KvStore};
use crate::storage::{ArchiveStore, PutOptions};
use crate::Result;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Outcome of one successful snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Archive object name, `backup-{millis}.json`
    pub name: String,
    /// Keys captured in the document
    pub key_count: usize,
    /// Keys listed but gone by the time they were fetched
    pub skipped: usize,
    /// Size of the serialized document
    pub size_bytes: usize,
    /// ISO 8601 instant recorded in the document
    pub timestamp: String,
}

/// Produces archive objects from the live key-value store
///
/// # Example
/// ```rust
/// use codekeep_core::{MemoryArchiveStore, MemoryKvStore, SnapshotProducer};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() {
/// let producer = SnapshotProducer::new(
///     Arc::new(MemoryKvStore::new()),
///     Arc::new(MemoryArchiveStore::new()),
///     "user_codes/",
/// );
/// producer.snapshot().await;
/// # }
/// ```
#[derive(Clone)]
pub struct SnapshotProducer {
    kv: Arc<dyn KvStore>,
    archive: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl SnapshotProducer {
    /// Create a producer reading keys under `prefix`, timed by the system clock
    pub fn new<S: Into<String>>(
        kv: Arc<dyn KvStore>,
        archive: Arc<dyn ArchiveStore>,
        prefix: S,
    ) -> Self {
        Self {
            kv,
            archive,
            clock: Arc::new(SystemClock),
            prefix: prefix.into(),
        }
    }

    /// Replace the time source used for the archive name and timestamp
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Take a snapshot, logging instead of returning any failure
    ///
    /// This is the entry point for cron ticks and detached background work:
    /// nobody is waiting on the result, so errors end up in the logs only.
    pub async fn snapshot(&self) {
        if let Err(e) = self.try_snapshot().await {
            error!(prefix = %self.prefix, error = %e, "Backup failed");
            #[cfg(feature = "metrics")]
            crate::observability::BackupMetrics::global().record_snapshot_failure();
        }
    }

    /// Take a snapshot and report what was written
    ///
    /// # Errors
    /// Any listing, fetch, serialization, or write failure is returned as-is.
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn try_snapshot(&self) -> Result<SnapshotReport> {
        let keys = list_all_keys(self.kv.as_ref(), &self.prefix).await?;
        debug!(listed = keys.len(), "Fetching values for snapshot");

        let mut data = BTreeMap::new();
        let mut skipped = 0usize;
        for key in keys {
            match self.kv.get(&key).await? {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    debug!(key = %key, "Key vanished before fetch, skipping");
                    skipped += 1;
                }
            }
        }

        let taken_at = self.clock.now();
        let document = ArchiveDocument::new(data, taken_at);
        let name = archive_name(taken_at);
        let body = document.to_json_bytes()?;
        let size_bytes = body.len();

        let options = PutOptions {
            content_type: Some(ARCHIVE_CONTENT_TYPE.to_string()),
            metadata: document.object_metadata(),
        };
        self.archive
            .put(&name, Bytes::from(body), options)
            .await?;

        info!(
            name = %name,
            key_count = document.key_count(),
            skipped,
            size_bytes,
            "Backup written"
        );
        #[cfg(feature = "metrics")]
        crate::observability::BackupMetrics::global().record_snapshot(size_bytes);

        Ok(SnapshotReport {
            name,
            key_count: document.key_count(),
            skipped,
            size_bytes,
            timestamp: document.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{META_KEY_COUNT, META_TIMESTAMP, META_VERSION};
    use crate::clock::FixedClock;
    use crate::kv::{KeyPage, MemoryKvStore};
    use crate::storage::{MemoryArchiveStore, MockArchiveStore};
    use crate::CodekeepError;
    use async_trait::async_trait;
    use serde_json::json;

    const NOW_MILLIS: i64 = 1_700_000_000_000;

    fn producer(kv: MemoryKvStore, archive: MemoryArchiveStore) -> SnapshotProducer {
        SnapshotProducer::new(Arc::new(kv), Arc::new(archive), "user_codes/")
            .with_clock(Arc::new(FixedClock::from_millis(NOW_MILLIS)))
    }

    async fn seeded_kv() -> MemoryKvStore {
        let kv = MemoryKvStore::new();
        kv.put("user_codes/g1/u1", json!([{"name": "SW", "code": "123"}]))
            .await
            .unwrap();
        kv.put("user_codes/g2/u2", json!([{"name": "friend", "code": "456"}]))
            .await
            .unwrap();
        kv
    }

    #[tokio::test]
    async fn test_snapshot_writes_single_archive() {
        let archive = MemoryArchiveStore::new();
        let producer = producer(seeded_kv().await, archive.clone());

        let report = producer.try_snapshot().await.unwrap();
        assert_eq!(report.name, "backup-1700000000000.json");
        assert_eq!(report.key_count, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(archive.names(), vec!["backup-1700000000000.json"]);

        let stored = archive.object(&report.name).unwrap();
        let document = ArchiveDocument::from_json_bytes(&stored.body).unwrap();
        assert_eq!(document.version, "1.0");
        assert_eq!(
            serde_json::to_value(&document.data).unwrap(),
            json!({
                "user_codes/g1/u1": [{"name": "SW", "code": "123"}],
                "user_codes/g2/u2": [{"name": "friend", "code": "456"}]
            })
        );

        assert_eq!(stored.options.content_type.as_deref(), Some("application/json"));
        assert_eq!(stored.options.metadata[META_KEY_COUNT], "2");
        assert_eq!(stored.options.metadata[META_VERSION], "1.0");
        assert_eq!(
            stored.options.metadata[META_TIMESTAMP],
            "2023-11-14T22:13:20.000Z"
        );
        assert_eq!(document.timestamp, "2023-11-14T22:13:20.000Z");
    }

    #[tokio::test]
    async fn test_snapshot_ignores_keys_outside_prefix() {
        let kv = seeded_kv().await;
        kv.put("settings/g1", json!({"locale": "en"})).await.unwrap();
        let archive = MemoryArchiveStore::new();

        let report = producer(kv, archive).try_snapshot().await.unwrap();
        assert_eq!(report.key_count, 2);
    }

    #[tokio::test]
    async fn test_snapshot_of_empty_store() {
        let archive = MemoryArchiveStore::new();
        let report = producer(MemoryKvStore::new(), archive.clone())
            .try_snapshot()
            .await
            .unwrap();

        assert_eq!(report.key_count, 0);
        let stored = archive.object(&report.name).unwrap();
        assert_eq!(stored.options.metadata[META_KEY_COUNT], "0");
    }

    #[tokio::test]
    async fn test_snapshot_spans_multiple_pages() {
        let kv = MemoryKvStore::with_page_size(3);
        for i in 0..10 {
            kv.put(&format!("user_codes/g/u{i}"), json!([])).await.unwrap();
        }
        let archive = MemoryArchiveStore::new();

        let report = producer(kv, archive).try_snapshot().await.unwrap();
        assert_eq!(report.key_count, 10);
    }

    /// Lists a key whose value has been deleted before the fetch
    struct RacyKv {
        inner: MemoryKvStore,
        phantom: &'static str,
    }

    #[async_trait]
    impl KvStore for RacyKv {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
            self.inner.put(key, value).await
        }

        async fn list(&self, prefix: &str, cursor: Option<&str>) -> Result<KeyPage> {
            let mut page = self.inner.list(prefix, cursor).await?;
            if cursor.is_none() {
                page.keys.push(self.phantom.to_string());
            }
            Ok(page)
        }
    }

    #[tokio::test]
    async fn test_snapshot_skips_vanished_key() {
        let kv = RacyKv {
            inner: seeded_kv().await,
            phantom: "user_codes/g3/deleted",
        };
        let archive = MemoryArchiveStore::new();
        let producer = SnapshotProducer::new(Arc::new(kv), Arc::new(archive.clone()), "user_codes/");

        let report = producer.try_snapshot().await.unwrap();
        assert_eq!(report.key_count, 2);
        assert_eq!(report.skipped, 1);

        let document =
            ArchiveDocument::from_json_bytes(&archive.object(&report.name).unwrap().body).unwrap();
        assert!(!document.data.contains_key("user_codes/g3/deleted"));
    }

    #[tokio::test]
    async fn test_try_snapshot_propagates_write_failure() {
        let mut archive = MockArchiveStore::new();
        archive
            .expect_put()
            .times(1)
            .returning(|_, _, _| Err(CodekeepError::storage("bucket is read-only")));

        let producer = SnapshotProducer::new(
            Arc::new(seeded_kv().await),
            Arc::new(archive),
            "user_codes/",
        );

        assert!(producer.try_snapshot().await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_best_effort_does_not_propagate() {
        let mut archive = MockArchiveStore::new();
        archive
            .expect_put()
            .returning(|_, _, _| Err(CodekeepError::unavailable("503")));

        let producer = SnapshotProducer::new(
            Arc::new(seeded_kv().await),
            Arc::new(archive),
            "user_codes/",
        );

        // Completes without panicking or returning an error
        producer.snapshot().await;
    }
}
