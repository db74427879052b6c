//! Preview creation: validate an uploaded bundle, fan out uploads to the
//! ephemeral storage prefix, and record the ledger row.
//!
//! Validation happens entirely before any storage write. After that, the
//! upload fan-out and the ledger insert are launched together for latency;
//! if the insert lands and an upload fails, the row references incomplete
//! content. Previews are TTL-bounded, so such orphans are reaped rather
//! than rolled back.

use crate::config::LimitsConfig;
use crate::error::AppError;
use crate::ledger::Ledger;
use crate::object_store::ObjectStore;
use crate::paths;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

/// One file of an uploaded bundle, as received from the client.
/// Deserialized camelCase per the API contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Relative path within the bundle
    pub path: String,
    /// Base64-encoded content
    pub content: String,
    /// MIME type
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "text/html".to_string()
}

/// A validated, decoded file ready for upload.
#[derive(Debug, Clone)]
pub struct DecodedFile {
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Result of a successful preview creation. Serialized camelCase: the field
/// names are part of the external API contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewCreated {
    pub preview_id: String,
    pub preview_url: String,
    pub expires_at: DateTime<Utc>,
    pub file_size: i64,
    pub file_count: i32,
}

/// Preview service.
pub struct PreviewService {
    object_store: Arc<ObjectStore>,
    ledger: Arc<Ledger>,
    limits: LimitsConfig,
}

impl PreviewService {
    pub fn new(object_store: Arc<ObjectStore>, ledger: Arc<Ledger>, limits: LimitsConfig) -> Self {
        Self {
            object_store,
            ledger,
            limits,
        }
    }

    /// Create a preview from an uploaded bundle.
    ///
    /// The generated ID is not collision-checked on this path; the ID space
    /// (36^10) makes collisions astronomically rare and the check would cost
    /// a round-trip on the hot path.
    #[instrument(skip(self, files), fields(file_count = files.len()))]
    pub async fn create_preview(
        &self,
        files: Vec<FileEntry>,
    ) -> Result<PreviewCreated, AppError> {
        let decoded = validate_bundle(files, self.limits.max_bundle_bytes)?;
        let preview_id = paths::generate_short_id();
        self.store_preview(preview_id, decoded).await
    }

    /// Create a preview from a single pasted HTML document.
    ///
    /// Bare fragments are wrapped into a complete document first. Unlike the
    /// bundle path, this one collision-checks the generated ID against the
    /// ledger before writing anything.
    #[instrument(skip(self, html))]
    pub async fn create_preview_from_html(
        &self,
        html: String,
    ) -> Result<PreviewCreated, AppError> {
        if html.trim().is_empty() {
            return Err(AppError::Validation("HTML content is required".to_string()));
        }

        let document = wrap_html_document(&html);
        if document.len() > self.limits.max_bundle_bytes {
            return Err(AppError::PayloadTooLarge {
                limit_mb: self.limits.max_bundle_bytes / (1024 * 1024),
            });
        }

        let preview_id = paths::generate_short_id();
        if self.ledger.preview_exists(&preview_id).await? {
            return Err(AppError::Conflict);
        }

        let file = DecodedFile {
            path: "index.html".to_string(),
            bytes: document.into_bytes(),
            content_type: "text/html".to_string(),
        };
        self.store_preview(preview_id, vec![file]).await
    }

    /// Upload the decoded files and insert the ledger row, concurrently.
    async fn store_preview(
        &self,
        preview_id: String,
        files: Vec<DecodedFile>,
    ) -> Result<PreviewCreated, AppError> {
        let file_size: i64 = files.iter().map(|f| f.bytes.len() as i64).sum();
        let file_count = files.len() as i32;
        let expires_at = Utc::now() + Duration::hours(self.limits.preview_ttl_hours);

        let uploads = futures::stream::iter(files.into_iter().map(|file| {
            let key = paths::preview_file_key(&preview_id, &file.path);
            let store = self.object_store.clone();
            async move { store.upload(file.bytes, &file.content_type, &key).await }
        }))
        .buffer_unordered(self.object_store.transfer_concurrency())
        .try_collect::<Vec<_>>();

        let insert = self
            .ledger
            .insert_preview(&preview_id, file_size, file_count, expires_at);

        // Launched together, not sequenced: a failed upload can leave a row
        // referencing incomplete content, reaped along with the preview.
        let (_, preview) = tokio::try_join!(uploads, async {
            insert.await.map_err(AppError::from)
        })?;

        info!(
            preview_id = %preview.id,
            file_size,
            file_count,
            "Preview created"
        );

        Ok(PreviewCreated {
            preview_url: paths::preview_url(&preview.id, &self.limits.app_domain),
            preview_id: preview.id,
            expires_at: preview.expires_at,
            file_size,
            file_count,
        })
    }
}

/// Wrap a bare HTML fragment in a complete document. Content that already
/// carries an `<html` tag passes through untouched.
pub fn wrap_html_document(html: &str) -> String {
    if html.contains("<html") {
        return html.to_string();
    }

    format!(
        "<!DOCTYPE html>\n\
         <html lang=\"en\">\n\
         <head>\n  \
         <meta charset=\"UTF-8\">\n  \
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n  \
         <title>Preview</title>\n\
         </head>\n\
         <body>\n{}\n</body>\n</html>",
        html
    )
}

/// Validate a bundle and decode its contents. No storage writes happen
/// before this returns.
pub fn validate_bundle(
    files: Vec<FileEntry>,
    max_bundle_bytes: usize,
) -> Result<Vec<DecodedFile>, AppError> {
    if files.is_empty() {
        return Err(AppError::Validation(
            "At least one file is required".to_string(),
        ));
    }

    let mut decoded = Vec::with_capacity(files.len());
    let mut total_size = 0usize;

    for file in files {
        let path = paths::sanitize_relative_path(&file.path);
        if path.is_empty() {
            return Err(AppError::Validation(format!(
                "Invalid file path: {}",
                file.path
            )));
        }

        let bytes = BASE64.decode(file.content.as_bytes()).map_err(|_| {
            AppError::Validation(format!("File {} is not valid base64", path))
        })?;

        total_size += bytes.len();
        if total_size > max_bundle_bytes {
            return Err(AppError::PayloadTooLarge {
                limit_mb: max_bundle_bytes / (1024 * 1024),
            });
        }

        decoded.push(DecodedFile {
            path,
            bytes,
            content_type: file.content_type,
        });
    }

    if !decoded.iter().any(|f| f.path == "index.html") {
        return Err(AppError::Validation(
            "An 'index.html' file is required for all previews".to_string(),
        ));
    }

    Ok(decoded)
}
