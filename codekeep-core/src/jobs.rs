/*!
Wiring of the snapshot and prune jobs onto the schedule dispatcher.
*/

use crate::clock::{Clock, SystemClock};
use crate::config::BackupConfig;
use crate::kv::KvStore;
use crate::retention::RetentionPruner;
use crate::scheduler::ScheduleDispatcher;
use crate::snapshot::SnapshotProducer;
use crate::storage::ArchiveStore;
use std::sync::Arc;
use tracing::debug;

/// Bindings handed to every backup handler
#[derive(Clone)]
pub struct BackupEnv {
    pub kv: Arc<dyn KvStore>,
    pub archive: Arc<dyn ArchiveStore>,
    pub clock: Arc<dyn Clock>,
    pub config: BackupConfig,
}

impl BackupEnv {
    /// Bindings using the system clock
    pub fn new(kv: Arc<dyn KvStore>, archive: Arc<dyn ArchiveStore>, config: BackupConfig) -> Self {
        Self {
            kv,
            archive,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Snapshot producer over these bindings
    pub fn snapshot_producer(&self) -> SnapshotProducer {
        SnapshotProducer::new(
            Arc::clone(&self.kv),
            Arc::clone(&self.archive),
            self.config.key_prefix.clone(),
        )
        .with_clock(Arc::clone(&self.clock))
    }

    /// Retention pruner over these bindings
    pub fn retention_pruner(&self) -> RetentionPruner {
        RetentionPruner::new(Arc::clone(&self.archive))
            .with_retention_days(self.config.retention_days)
            .with_clock(Arc::clone(&self.clock))
    }
}

/// Build a dispatcher with the snapshot job on `backup_schedule` and the prune
/// job on the effective prune schedule
///
/// Both handlers return as soon as their work is deferred; the dispatcher
/// still waits for that work before completing. Job failures are logged by
/// the jobs themselves and never fail the dispatch.
pub fn backup_dispatcher(config: &BackupConfig) -> ScheduleDispatcher<BackupEnv> {
    debug!(
        backup_schedule = %config.backup_schedule,
        prune_schedule = %config.effective_prune_schedule(),
        "Registering backup jobs"
    );

    ScheduleDispatcher::new()
        .register(
            config.backup_schedule.clone(),
            |_event, env: Arc<BackupEnv>, ctx| {
                let producer = env.snapshot_producer();
                ctx.wait_until(async move { producer.snapshot().await });
                async { Ok(()) }
            },
        )
        .register(
            config.effective_prune_schedule().to_string(),
            |_event, env: Arc<BackupEnv>, ctx| {
                let pruner = env.retention_pruner();
                ctx.wait_until(async move { pruner.prune(None).await });
                async { Ok(()) }
            },
        )
}
