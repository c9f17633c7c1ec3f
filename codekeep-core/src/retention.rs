/*!
Retention pruner: deletes archive objects older than the retention window.

Age comes from the millisecond timestamp embedded in each object name, never
from store-side modification times. Objects whose names do not match the
archive pattern are left alone.
*/

use crate::archive::parse_archive_name;
use crate::clock::{Clock, SystemClock};
use crate::config::DEFAULT_RETENTION_DAYS;
use crate::storage::{list_all_objects, ArchiveStore};
use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Outcome of one successful prune
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneReport {
    /// Objects with an embedded timestamp below this were deleted
    pub cutoff_millis: i64,
    /// Retention window actually applied
    pub retention_days: u32,
    /// Objects returned by the listing
    pub scanned: usize,
    /// Names deleted, in lexical order
    pub deleted: Vec<String>,
}

/// Deletes archives that have aged out of the retention window
#[derive(Clone)]
pub struct RetentionPruner {
    archive: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
}

impl RetentionPruner {
    /// Create a pruner with the default 30-day window and the system clock
    pub fn new(archive: Arc<dyn ArchiveStore>) -> Self {
        Self {
            archive,
            clock: Arc::new(SystemClock),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    /// Replace the default retention window
    pub fn with_retention_days(mut self, retention_days: u32) -> Self {
        self.retention_days = retention_days;
        self
    }

    /// Replace the "now" provider used for the cutoff
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Millisecond cutoff for a window of `retention_days`
    pub fn cutoff_millis(&self, retention_days: u32) -> i64 {
        self.clock.now().timestamp_millis() - i64::from(retention_days) * MILLIS_PER_DAY
    }

    /// Prune, logging instead of returning any failure
    ///
    /// `retention_days` overrides the configured window for this call only.
    pub async fn prune(&self, retention_days: Option<u32>) {
        if let Err(e) = self.try_prune(retention_days).await {
            error!(error = %e, "Cleanup of old backups failed");
            #[cfg(feature = "metrics")]
            crate::observability::BackupMetrics::global().record_prune_failure();
        }
    }

    /// Prune and report what was deleted
    ///
    /// # Errors
    /// Listing or deletion failures are returned as-is.
    ///
    /// A zero-day window puts the cutoff at "now", so every archive written
    /// before this instant is deleted.
    #[instrument(skip(self))]
    pub async fn try_prune(&self, retention_days: Option<u32>) -> Result<PruneReport> {
        let retention_days = retention_days.unwrap_or(self.retention_days);
        let cutoff_millis = self.cutoff_millis(retention_days);
        let objects = list_all_objects(self.archive.as_ref()).await?;
        let scanned = objects.len();

        let expired: BTreeSet<String> = objects
            .into_iter()
            .filter(|object| {
                parse_archive_name(&object.name).is_some_and(|millis| millis < cutoff_millis)
            })
            .map(|object| object.name)
            .collect();

        if expired.is_empty() {
            info!(scanned, cutoff_millis, retention_days, "No old backups to delete");
            return Ok(PruneReport {
                cutoff_millis,
                retention_days,
                scanned,
                deleted: Vec::new(),
            });
        }

        let deleted: Vec<String> = expired.into_iter().collect();
        debug!(names = ?deleted, "Deleting expired backups");
        self.archive.delete(deleted.clone()).await?;

        info!(
            deleted = deleted.len(),
            scanned,
            cutoff_millis,
            retention_days,
            "Deleted old backups"
        );
        #[cfg(feature = "metrics")]
        crate::observability::BackupMetrics::global().record_pruned(deleted.len());

        Ok(PruneReport {
            cutoff_millis,
            retention_days,
            scanned,
            deleted,
        })
    }
}
