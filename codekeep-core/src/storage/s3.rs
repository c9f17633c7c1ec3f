/*!
Amazon S3 archive store implementation.

This module stores archive objects in an S3 bucket using the official AWS SDK.
*/

use aws_config::SdkConfig;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use codekeep_retry::{cloud_storage_backoff_policy, with_custom_backoff};
use tracing::{debug, error, info, warn};

use super::{validate_object_name, ArchiveStore, ObjectInfo, ObjectPage, PutOptions};
use crate::config::StorageConfig;
use crate::{CodekeepError, Result};
use async_trait::async_trait;

/// S3 accepts at most this many keys per DeleteObjects request
const MAX_DELETE_BATCH: usize = 1000;

type S3SdkError<E> = SdkError<E, aws_smithy_runtime_api::http::Response>;

/// Amazon S3 archive store
///
/// Object names map to keys as `{prefix}{name}`. Listing strips the prefix
/// again and ignores anything nested deeper below it.
///
/// # Authentication
/// The store uses the standard AWS credential provider chain:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
/// 4. ECS task roles
///
/// # Example
/// ```rust,no_run
/// use codekeep_core::{StorageConfig, storage::S3ArchiveStore};
///
/// # async fn demo() -> codekeep_core::Result<()> {
/// let config = StorageConfig::from_uri("s3://my-backups/codekeep")?;
/// let store = S3ArchiveStore::from_config(&config).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3ArchiveStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3ArchiveStore {
    /// Create a store from a validated S3 storage configuration
    ///
    /// # Errors
    /// Returns an error if the bucket is missing or no AWS credentials are available.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .s3_bucket
            .clone()
            .filter(|bucket| !bucket.is_empty())
            .ok_or_else(|| CodekeepError::validation("S3 bucket name is required for S3 backend"))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.s3_region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(CodekeepError::storage(
                "AWS credentials not found. Please set AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, and AWS_REGION environment variables",
            ));
        }

        Ok(Self::with_config(
            bucket,
            config.s3_prefix.clone().unwrap_or_default(),
            &sdk_config,
        ))
    }

    /// Create a store with explicit AWS configuration
    pub fn with_config(bucket: String, prefix: String, config: &SdkConfig) -> Self {
        let client = S3Client::new(config);
        info!(bucket = %bucket, prefix = %prefix, "Initialized S3 archive store");
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Map a listed key back to an object name directly under the prefix
    fn name_for<'a>(&self, key: &'a str) -> Option<&'a str> {
        let name = key.strip_prefix(self.prefix.as_str())?;
        (!name.is_empty() && !name.contains('/')).then_some(name)
    }

    async fn put_once(&self, key: &str, body: Bytes, options: PutOptions) -> Result<()> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_content_type(options.content_type)
            .set_metadata(Some(options.metadata))
            .send()
            .await
            .map_err(|e| map_s3_error("put_object", e, key))?;

        debug!(bucket = %self.bucket, key = %key, size, "Wrote archive object to S3");
        Ok(())
    }

    async fn get_once(&self, key: &str) -> Result<Option<Bytes>> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|err| err.is_no_such_key()) => {
                return Ok(None)
            }
            Err(e) => return Err(map_s3_error("get_object", e, key)),
        };

        let data = output.body.collect().await.map_err(|e| {
            CodekeepError::unavailable(format!("Failed to read S3 object stream: {e}"))
        })?;
        Ok(Some(data.into_bytes()))
    }

    async fn list_once(&self, cursor: Option<String>) -> Result<ObjectPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_continuation_token(cursor);
        if !self.prefix.is_empty() {
            request = request.prefix(&self.prefix);
        }

        let output = request
            .send()
            .await
            .map_err(|e| map_s3_error("list_objects_v2", e, &self.prefix))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                let name = self.name_for(object.key()?)?;
                Some(ObjectInfo {
                    name: name.to_string(),
                    size: object.size().and_then(|size| u64::try_from(size).ok()),
                })
            })
            .collect();

        let cursor = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage { objects, cursor })
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<()> {
        let identifiers = keys
            .iter()
            .map(|key| {
                ObjectIdentifier::builder().key(key).build().map_err(|e| {
                    CodekeepError::storage(format!("Invalid S3 object identifier '{key}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .map_err(|e| CodekeepError::storage(format!("Invalid S3 delete request: {e}")))?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| map_s3_error("delete_objects", e, &self.prefix))?;

        if let Some(failure) = output.errors().first() {
            error!(
                bucket = %self.bucket,
                failed = output.errors().len(),
                key = failure.key().unwrap_or_default(),
                "S3 rejected some deletions"
            );
            return Err(CodekeepError::storage(format!(
                "S3 failed to delete {} of {} objects (first: {} - {})",
                output.errors().len(),
                keys.len(),
                failure.key().unwrap_or("unknown"),
                failure.message().unwrap_or("no message"),
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for S3ArchiveStore {
    async fn put(&self, name: &str, body: Bytes, options: PutOptions) -> Result<()> {
        validate_object_name(name)?;
        let key = self.key_for(name);
        info!(bucket = %self.bucket, key = %key, size = body.len(), "Saving archive to S3");

        with_custom_backoff("s3.put_object", cloud_storage_backoff_policy(), |_attempt| {
            self.put_once(&key, body.clone(), options.clone())
        })
        .await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        validate_object_name(name)?;
        let key = self.key_for(name);

        let body = with_custom_backoff("s3.get_object", cloud_storage_backoff_policy(), |_attempt| {
            self.get_once(&key)
        })
        .await?;
        Ok(body)
    }

    async fn list(&self, cursor: Option<String>) -> Result<ObjectPage> {
        let page = with_custom_backoff(
            "s3.list_objects_v2",
            cloud_storage_backoff_policy(),
            |_attempt| self.list_once(cursor.clone()),
        )
        .await?;
        Ok(page)
    }

    async fn delete(&self, names: Vec<String>) -> Result<()> {
        let keys = names
            .iter()
            .map(|name| validate_object_name(name).map(|_| self.key_for(name)))
            .collect::<Result<Vec<_>>>()?;

        for batch in keys.chunks(MAX_DELETE_BATCH) {
            info!(bucket = %self.bucket, count = batch.len(), "Deleting archives from S3");
            with_custom_backoff("s3.delete_objects", cloud_storage_backoff_policy(), |_attempt| {
                self.delete_batch(batch)
            })
            .await?;
        }
        Ok(())
    }
}

/// Map AWS SDK errors to CodekeepError, separating retryable failures
fn map_s3_error<E: ProvideErrorMetadata + std::fmt::Debug>(
    op: &str,
    error: S3SdkError<E>,
    key: &str,
) -> CodekeepError {
    let mapped = match &error {
        SdkError::DispatchFailure(dispatch_err) => CodekeepError::unavailable(format!(
            "S3 {op} request failed to dispatch: {dispatch_err:?}"
        )),
        SdkError::TimeoutError(_) => {
            CodekeepError::unavailable(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            CodekeepError::unavailable(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            match service_err.err().code() {
                Some("SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout") => {
                    CodekeepError::unavailable(format!("S3 {op} throttled or unavailable ({status})"))
                }
                Some("NoSuchBucket") => CodekeepError::storage("S3 bucket not found"),
                Some("AccessDenied" | "Forbidden") => CodekeepError::storage(
                    "Access denied to S3 (check credentials and permissions)",
                ),
                _ if status >= 500 => {
                    CodekeepError::unavailable(format!("S3 {op} server error ({status})"))
                }
                Some(code) => CodekeepError::storage(format!(
                    "S3 service error ({code}): {}",
                    service_err.err().message().unwrap_or("Unknown error")
                )),
                None => CodekeepError::storage(format!("S3 {op} service error: {service_err:?}")),
            }
        }
        _ => CodekeepError::storage(format!("S3 {op} error: {error:?}")),
    };

    warn!(operation = op, key = %key, error = %mapped, "S3 request failed");
    mapped
}
