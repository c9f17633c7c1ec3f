//! Configuration for store backends and the backup pipeline
//!
//! `StorageConfig` selects where archives are written (memory, local
//! filesystem, S3), `KvConfig` selects the live key-value store, and
//! `BackupConfig` carries the prefix, retention window, and schedules.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Prefix under which the bot stores per-user code lists
pub const DEFAULT_KEY_PREFIX: &str = "user_codes/";

/// Days an archive is kept before the pruner deletes it
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Daily at 03:00 UTC
pub const DEFAULT_BACKUP_SCHEDULE: &str = "0 3 * * *";

/// Enumeration of supported archive storage backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// In-process storage, lost on exit
    Memory,
    /// Local filesystem storage
    Local,
    /// Amazon S3 cloud storage
    S3,
}

/// Configuration structure for archive storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// The storage backend to use
    pub backend: StorageBackend,
    /// S3 bucket name (required for S3 backend)
    pub s3_bucket: Option<String>,
    /// AWS region for S3 operations (optional, defaults to environment)
    pub s3_region: Option<String>,
    /// Key prefix inside the bucket, e.g. `backups/`
    pub s3_prefix: Option<String>,
    /// Base directory for local storage
    pub local_base_path: Option<PathBuf>,
}

impl StorageConfig {
    /// In-memory archive storage
    pub fn memory() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            s3_bucket: None,
            s3_region: None,
            s3_prefix: None,
            local_base_path: None,
        }
    }

    /// Local filesystem archive storage rooted at `path`
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        StorageConfig {
            backend: StorageBackend::Local,
            local_base_path: Some(path.into()),
            ..Self::memory()
        }
    }

    /// Create an S3 configuration with specified bucket
    pub fn s3_with_bucket(bucket: String) -> Self {
        StorageConfig {
            backend: StorageBackend::S3,
            s3_bucket: Some(bucket),
            ..Self::memory()
        }
    }

    /// Parse a storage URI and create the matching configuration
    ///
    /// Supports formats:
    /// - `s3://bucket-name/prefix` for S3 storage
    /// - `memory://` for in-process storage
    /// - `/local/path` or `./relative/path` for local storage
    pub fn from_uri(uri: &str) -> crate::Result<StorageConfig> {
        if let Some(s3_part) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = match s3_part.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix),
                None => (s3_part, ""),
            };
            if bucket.is_empty() {
                return Err(crate::CodekeepError::validation(
                    "Invalid S3 URI: missing bucket name",
                ));
            }

            let mut config = StorageConfig::s3_with_bucket(bucket.to_string());
            if !prefix.is_empty() {
                config.s3_prefix = Some(normalize_prefix(prefix));
            }
            Ok(config)
        } else if uri == "memory://" || uri == "memory" {
            Ok(StorageConfig::memory())
        } else if uri.is_empty() {
            Err(crate::CodekeepError::validation("Storage URI cannot be empty"))
        } else {
            Ok(StorageConfig::local(uri))
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        match self.backend {
            StorageBackend::S3 => {
                if self.s3_bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(crate::CodekeepError::validation(
                        "S3 backend requires a valid bucket name",
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_base_path.is_none() {
                    return Err(crate::CodekeepError::validation(
                        "Local backend requires a base directory",
                    ));
                }
            }
            StorageBackend::Memory => {}
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::memory()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    format!("{trimmed}/")
}

/// Backends available for the live key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvBackend {
    Memory,
    Local,
}

/// Configuration for the live key-value store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub backend: KvBackend,
    pub local_base_path: Option<PathBuf>,
}

impl KvConfig {
    pub fn memory() -> Self {
        KvConfig {
            backend: KvBackend::Memory,
            local_base_path: None,
        }
    }

    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        KvConfig {
            backend: KvBackend::Local,
            local_base_path: Some(path.into()),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.backend == KvBackend::Local && self.local_base_path.is_none() {
            return Err(crate::CodekeepError::validation(
                "Local key-value store requires a base directory",
            ));
        }
        Ok(())
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self::memory()
    }
}

/// Settings for the snapshot and retention jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Only keys starting with this prefix are archived
    pub key_prefix: String,
    /// Default retention window, overridable per prune invocation
    pub retention_days: u32,
    /// Schedule string the snapshot job is registered under
    pub backup_schedule: String,
    /// Schedule string for the prune job; falls back to `backup_schedule`
    pub prune_schedule: Option<String>,
}

impl BackupConfig {
    /// The schedule the prune job actually listens on
    pub fn effective_prune_schedule(&self) -> &str {
        self.prune_schedule
            .as_deref()
            .unwrap_or(&self.backup_schedule)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.key_prefix.is_empty() {
            return Err(crate::CodekeepError::validation(
                "key_prefix cannot be empty",
            ));
        }
        Ok(())
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            backup_schedule: DEFAULT_BACKUP_SCHEDULE.to_string(),
            prune_schedule: None,
        }
    }
}
