/*!
# Codekeep Core Engine

Scheduled backup and retention for the per-server code storage bot.

This crate provides:

- A cron-keyed [`ScheduleDispatcher`] that fans a trigger out to every
  handler registered on its exact schedule string
- A [`SnapshotProducer`] exporting every live key under a prefix into one
  versioned JSON archive object
- A [`RetentionPruner`] deleting archives whose name-encoded timestamp has
  aged out of the retention window
- Helpers for the per-user code entries the bot stores

## Architecture

The jobs talk to two ports, [`KvStore`] for the live data and
[`ArchiveStore`] for archive objects. Adapters for memory, the local
filesystem, and S3 (feature `s3`) are selected from configuration.

## Usage

```rust
use codekeep_core::{
    backup_dispatcher, BackupConfig, BackupEnv, ExecutionContext, MemoryArchiveStore,
    MemoryKvStore, ScheduledEvent,
};
use std::sync::Arc;

# #[tokio::main]
# async fn main() -> codekeep_core::Result<()> {
let archive = MemoryArchiveStore::new();
let config = BackupConfig::default();
let env = BackupEnv::new(Arc::new(MemoryKvStore::new()), Arc::new(archive.clone()), config.clone());

backup_dispatcher(&config)
    .dispatch(&ScheduledEvent::now("0 3 * * *"), Arc::new(env), &ExecutionContext::new())
    .await?;

assert_eq!(archive.len(), 1);
# Ok(())
# }
```
*/

pub mod archive;
pub mod clock;
pub mod codes;
pub mod config;
pub mod error;
pub mod jobs;
pub mod kv;
pub mod observability;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod storage;


pub use archive::{archive_name, parse_archive_name, ArchiveDocument};
pub use clock::{Clock, FixedClock, SystemClock};
pub use codes::{add_code, list_codes, remove_code, user_codes_key, CodeEntry};
pub use config::{BackupConfig, KvBackend, KvConfig, StorageBackend, StorageConfig};
pub use error::{CodekeepError, Result};
pub use jobs::{backup_dispatcher, BackupEnv};
pub use kv::{create_kv_store, list_all_keys, KvStore, LocalKvStore, MemoryKvStore};
pub use retention::{PruneReport, RetentionPruner};
pub use scheduler::{ExecutionContext, ScheduleDispatcher, ScheduledEvent};
pub use snapshot::{SnapshotProducer, SnapshotReport};
pub use storage::{
    create_archive_store, list_all_objects, ArchiveStore, LocalArchiveStore, MemoryArchiveStore,
    ObjectInfo, PutOptions,
};

#[cfg(feature = "s3")]
pub use storage::S3ArchiveStore;
