//! Publish pipeline: promote a still-valid preview into a permanent
//! artifact.
//!
//! Ordering is deliberate: all local checks (preview lookup, quota, ID
//! collision, cover validation) happen before the first mutation, then the
//! ledger row is created before the object tree is copied. The ledger/object
//! store pair is not covered by a transaction, so a late copy failure can
//! leave an artifact row with incomplete content; reconciliation relies on
//! the soft-delete marker rather than a commit protocol.

use crate::config::LimitsConfig;
use crate::error::AppError;
use crate::ledger::{Artifact, Ledger, NewArtifact};
use crate::object_store::ObjectStore;
use crate::paths;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

const MAX_TITLE_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 500;

/// Cover image as received from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverImage {
    /// Base64-encoded image data
    pub data: String,
    /// MIME type, used to derive the stored extension
    pub content_type: String,
}

/// Publish request payload, camelCase per the API contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub preview_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub cover_image: Option<CoverImage>,
}

/// Publish service.
pub struct PublishService {
    object_store: Arc<ObjectStore>,
    ledger: Arc<Ledger>,
    limits: LimitsConfig,
}

impl PublishService {
    pub fn new(object_store: Arc<ObjectStore>, ledger: Arc<Ledger>, limits: LimitsConfig) -> Self {
        Self {
            object_store,
            ledger,
            limits,
        }
    }

    /// Publish a preview as a permanent artifact owned by `user_id`.
    #[instrument(skip(self, request), fields(preview_id = %request.preview_id, user_id = %user_id))]
    pub async fn publish(
        &self,
        request: PublishRequest,
        user_id: &str,
    ) -> Result<Artifact, AppError> {
        validate_title(&request.title)?;
        validate_description(&request.description)?;

        let preview = self
            .ledger
            .get_preview(&request.preview_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Preview".to_string()))?;

        // A preview that already produced an artifact is consumed.
        if preview.artifact_id.is_some() {
            return Err(AppError::NotFound("Preview".to_string()));
        }

        let artifact_count = self.ledger.count_user_artifacts(user_id).await?;
        if artifact_count >= self.limits.max_user_artifacts {
            return Err(AppError::QuotaExceeded {
                max: self.limits.max_user_artifacts,
            });
        }

        // Single candidate; a collision is surfaced, not retried.
        let artifact_id = paths::generate_short_id();
        if self.ledger.artifact_exists(&artifact_id).await? {
            return Err(AppError::Conflict);
        }

        // An artifact is never created without its declared cover.
        let cover_image_path = match &request.cover_image {
            Some(cover) => Some(self.upload_cover(&artifact_id, cover).await?),
            None => None,
        };

        let artifact = self
            .ledger
            .insert_artifact(&NewArtifact {
                id: artifact_id.clone(),
                user_id: user_id.to_string(),
                title: request.title,
                description: request.description,
                cover_image_path,
                file_size: preview.file_size,
                file_count: preview.file_count,
            })
            .await?;

        self.ledger
            .link_preview_to_artifact(&preview.id, &artifact_id)
            .await?;

        // Last step: a failure here leaves the row pointing at an incomplete
        // tree (see module docs).
        self.object_store
            .copy_prefix(
                &paths::preview_content_prefix(&preview.id),
                &paths::artifact_content_prefix(&artifact_id),
            )
            .await?;

        info!(
            artifact_id = %artifact.id,
            preview_id = %preview.id,
            file_count = artifact.file_count,
            "Preview published as artifact"
        );

        Ok(artifact)
    }

    /// Validate and upload a cover image, returning its assets-bucket key.
    async fn upload_cover(
        &self,
        artifact_id: &str,
        cover: &CoverImage,
    ) -> Result<String, AppError> {
        let bytes = BASE64
            .decode(cover.data.as_bytes())
            .map_err(|_| AppError::Validation("Cover image is not valid base64".to_string()))?;

        let max_bytes = self.limits.max_cover_image_kb * 1024;
        if bytes.len() > max_bytes {
            return Err(AppError::Validation(format!(
                "Cover image size exceeds the maximum limit of {}KB",
                self.limits.max_cover_image_kb
            )));
        }

        let key = paths::cover_image_key(artifact_id, &cover.content_type);
        self.object_store
            .upload_asset(bytes, &cover.content_type, &key)
            .await
    }

    /// Soft-delete an artifact and clean up its stored objects.
    ///
    /// The ledger soft delete is authoritative; object cleanup is
    /// best-effort and a failure there is logged, not surfaced.
    #[instrument(skip(self))]
    pub async fn delete_artifact(
        &self,
        artifact_id: &str,
        user_id: &str,
    ) -> Result<(), AppError> {
        let artifact = self
            .ledger
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Artifact".to_string()))?;

        if artifact.user_id != user_id {
            return Err(AppError::Forbidden(
                "You do not have permission to delete this artifact".to_string(),
            ));
        }

        self.ledger.soft_delete_artifact(artifact_id).await?;

        if let Err(e) = self
            .object_store
            .delete_by_prefix(&paths::artifact_content_prefix(artifact_id))
            .await
        {
            warn!(error = %e, artifact_id, "Failed to delete artifact content");
        }

        if let Some(cover_path) = &artifact.cover_image_path {
            if let Err(e) = self.object_store.delete_asset(cover_path).await {
                warn!(error = %e, artifact_id, "Failed to delete cover image");
            }
        }

        info!(artifact_id, "Artifact deleted");
        Ok(())
    }

    /// Update an artifact's title and/or description.
    #[instrument(skip(self, title, description))]
    pub async fn update_artifact(
        &self,
        artifact_id: &str,
        user_id: &str,
        title: Option<String>,
        description: Option<String>,
    ) -> Result<Artifact, AppError> {
        // Only supplied fields are validated; an absent field leaves the
        // stored value untouched.
        if let Some(title) = title.as_deref() {
            validate_title(title)?;
        }
        if let Some(description) = description.as_deref() {
            validate_description(description)?;
        }

        let artifact = self
            .ledger
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Artifact".to_string()))?;

        if artifact.user_id != user_id {
            return Err(AppError::Forbidden(
                "You don't have permission to update this artifact".to_string(),
            ));
        }

        let updated = self
            .ledger
            .update_artifact_metadata(artifact_id, title.as_deref(), description.as_deref())
            .await?;

        Ok(updated)
    }
}

/// Title constraints shared by publish and update.
fn validate_title(title: &str) -> Result<(), AppError> {
    if title.trim().is_empty() {
        return Err(AppError::Validation("Title is required".to_string()));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(AppError::Validation(format!(
            "Title too long, max {} characters",
            MAX_TITLE_LEN
        )));
    }
    Ok(())
}

/// Description constraints shared by publish and update.
fn validate_description(description: &str) -> Result<(), AppError> {
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(AppError::Validation(format!(
            "Description too long, max {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_constraints() {
        assert!(validate_title("Hello").is_ok());
        assert!(validate_title("").is_err());
        assert!(validate_title("   ").is_err());
        assert!(validate_title(&"t".repeat(100)).is_ok());
        assert!(validate_title(&"t".repeat(101)).is_err());
    }

    #[test]
    fn test_description_constraints() {
        // Description rules stand alone: no title needed to validate one.
        assert!(validate_description("").is_ok());
        assert!(validate_description(&"d".repeat(500)).is_ok());
        assert!(validate_description(&"d".repeat(501)).is_err());
    }

    #[test]
    fn test_publish_request_deserializes_without_cover() {
        let json = serde_json::json!({
            "previewId": "abc123defg",
            "title": "My page",
        });
        let request: PublishRequest = serde_json::from_value(json).unwrap();
        assert!(request.cover_image.is_none());
        assert_eq!(request.description, "");
    }

    #[test]
    fn test_publish_request_with_cover() {
        let json = serde_json::json!({
            "previewId": "abc123defg",
            "title": "My page",
            "description": "A page",
            "coverImage": {
                "data": BASE64.encode(b"fakepng"),
                "contentType": "image/png",
            },
        });
        let request: PublishRequest = serde_json::from_value(json).unwrap();
        let cover = request.cover_image.unwrap();
        assert_eq!(cover.content_type, "image/png");
        assert_eq!(BASE64.decode(cover.data).unwrap(), b"fakepng");
    }
}
