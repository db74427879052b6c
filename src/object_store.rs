//! S3-compatible object store client.
//!
//! Uploads carry a bounded retry with exponential backoff; copies surface
//! failure immediately. Prefix-level operations (copy, delete) are built
//! from list + per-key operations with no partial rollback: a failed prefix
//! copy leaves whatever keys already landed, which the publish pipeline
//! documents as an accepted risk.

use crate::config::StorageConfig;
use crate::error::AppError;
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Object store client for the content and assets buckets.
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
    assets_bucket: String,
    upload_attempts: u32,
    backoff_base: Duration,
    transfer_concurrency: usize,
}

impl ObjectStore {
    /// Create a new object store client.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for R2/MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            assets_bucket = %config.assets_bucket,
            region = %config.region,
            "Object store client initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            assets_bucket: config.assets_bucket.clone(),
            upload_attempts: config.upload_attempts,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            transfer_concurrency: config.transfer_concurrency,
        })
    }

    /// Upload bytes to the content bucket.
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        key: &str,
    ) -> Result<String, AppError> {
        self.upload_to_bucket(&self.bucket, bytes, content_type, key)
            .await
    }

    /// Upload bytes to the assets bucket (cover images).
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    pub async fn upload_asset(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        key: &str,
    ) -> Result<String, AppError> {
        self.upload_to_bucket(&self.assets_bucket, bytes, content_type, key)
            .await
    }

    /// PutObject with bounded retry and exponential backoff.
    async fn upload_to_bucket(
        &self,
        bucket: &str,
        bytes: Vec<u8>,
        content_type: &str,
        key: &str,
    ) -> Result<String, AppError> {
        let mut last_error = String::new();

        for attempt in 1..=self.upload_attempts {
            let result = self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(bytes.clone()))
                .content_type(content_type)
                .send()
                .await;

            match result {
                Ok(_) => {
                    debug!(key = %key, attempt, "Object uploaded");
                    metrics::counter!("pagedrop.storage.uploads").increment(1);
                    return Ok(key.to_string());
                }
                Err(e) => {
                    last_error = DisplayErrorContext(&e).to_string();
                    if attempt < self.upload_attempts {
                        let delay = backoff_delay(self.backoff_base, attempt);
                        warn!(
                            key = %key,
                            attempt,
                            delay_secs = delay.as_secs(),
                            error = %last_error,
                            "Upload failed, retrying"
                        );
                        metrics::counter!("pagedrop.storage.upload_retries").increment(1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        metrics::counter!("pagedrop.storage.upload_failures").increment(1);
        Err(AppError::Storage(format!(
            "upload of {} failed after {} attempts: {}",
            key, self.upload_attempts, last_error
        )))
    }

    /// Server-side copy of a single object. No retry; failure surfaces
    /// immediately.
    #[instrument(skip(self))]
    pub async fn copy_object(
        &self,
        source_key: &str,
        dest_key: &str,
    ) -> Result<String, AppError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .key(dest_key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "copy {} -> {} failed: {}",
                    source_key,
                    dest_key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(dest_key.to_string())
    }

    /// List all keys under a prefix, following continuation tokens.
    pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    AppError::Storage(format!(
                        "list of {} failed: {}",
                        prefix,
                        DisplayErrorContext(&e)
                    ))
                })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    /// Copy every object under `source_prefix` to `dest_prefix`.
    ///
    /// Per-key copies are issued in parallel with no ordering guarantee.
    /// Fails with `NotFound` when the source prefix holds zero objects, and
    /// with `PartialCopy` when some copies landed before one failed.
    #[instrument(skip(self))]
    pub async fn copy_prefix(
        &self,
        source_prefix: &str,
        dest_prefix: &str,
    ) -> Result<Vec<String>, AppError> {
        let source_keys = self.list_by_prefix(source_prefix).await?;

        if source_keys.is_empty() {
            return Err(AppError::NotFound(format!(
                "Source prefix {}", source_prefix
            )));
        }

        let total = source_keys.len();
        let results: Vec<Result<String, AppError>> = stream::iter(source_keys)
            .map(|source_key| {
                let dest_key = substitute_prefix(&source_key, source_prefix, dest_prefix);
                async move { self.copy_object(&source_key, &dest_key).await }
            })
            .buffer_unordered(self.transfer_concurrency)
            .collect()
            .await;

        let mut dest_keys = Vec::with_capacity(total);
        let mut failed = 0usize;
        for result in results {
            match result {
                Ok(key) => dest_keys.push(key),
                Err(e) => {
                    warn!(error = %e, source_prefix, "Prefix copy: object copy failed");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(AppError::PartialCopy {
                source_prefix: source_prefix.to_string(),
                copied: dest_keys.len(),
            });
        }

        debug!(source_prefix, dest_prefix, count = dest_keys.len(), "Prefix copied");
        Ok(dest_keys)
    }

    /// Delete every object under a prefix. A prefix with no objects is a
    /// no-op, so repeated calls are safe.
    #[instrument(skip(self))]
    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<(), AppError> {
        let keys = self.list_by_prefix(prefix).await?;

        for key in &keys {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    AppError::Storage(format!(
                        "delete of {} failed: {}",
                        key,
                        DisplayErrorContext(&e)
                    ))
                })?;
        }

        debug!(prefix, count = keys.len(), "Prefix deleted");
        Ok(())
    }

    /// Delete a single object from the assets bucket.
    #[instrument(skip(self))]
    pub async fn delete_asset(&self, key: &str) -> Result<(), AppError> {
        self.client
            .delete_object()
            .bucket(&self.assets_bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "delete of asset {} failed: {}",
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    /// Concurrency limit for callers running their own transfer fan-outs.
    pub fn transfer_concurrency(&self) -> usize {
        self.transfer_concurrency
    }
}

/// Exponential backoff: base * 2^(attempt-1), so 1s, 2s, 4s for the default
/// base and three attempts.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Replace `source_prefix` at the front of `key` with `dest_prefix`.
fn substitute_prefix(key: &str, source_prefix: &str, dest_prefix: &str) -> String {
    let relative = key.strip_prefix(source_prefix).unwrap_or(key);
    format!("{}{}", dest_prefix, relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
    }

    #[test]
    fn test_substitute_prefix() {
        assert_eq!(
            substitute_prefix(
                "preview/abc/content/index.html",
                "preview/abc/content",
                "public/xyz/content"
            ),
            "public/xyz/content/index.html"
        );
        assert_eq!(
            substitute_prefix(
                "preview/abc/content/assets/app.js",
                "preview/abc/content",
                "public/xyz/content"
            ),
            "public/xyz/content/assets/app.js"
        );
    }

    #[test]
    fn test_substitute_prefix_non_matching_key_kept() {
        assert_eq!(
            substitute_prefix("other/key", "preview/abc/content", "public/xyz/content"),
            "public/xyz/contentother/key"
        );
    }
}
