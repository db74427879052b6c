//! PostgreSQL ledger for preview and artifact rows.
//!
//! The ledger and the object store are kept in sync by the preview and
//! publish services, which are the only writers of either. Rows here are
//! metadata; the bytes live under the object-store prefixes in `paths`.

use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Ephemeral preview record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Preview {
    /// Short opaque ID, also the object-store prefix component
    pub id: String,
    /// Sum of decoded content sizes in bytes
    pub file_size: i64,
    /// Number of files in the bundle
    pub file_count: i32,
    /// When the preview was created
    pub created_at: DateTime<Utc>,
    /// When the preview becomes eligible for reaping
    pub expires_at: DateTime<Utc>,
    /// Back-reference set once the preview is published
    pub artifact_id: Option<String>,
}

/// Permanent artifact record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artifact {
    /// Short opaque ID, also the object-store prefix component
    pub id: String,
    /// Owning user
    pub user_id: String,
    pub title: String,
    pub description: String,
    /// Cover image key in the assets bucket, when one was supplied
    pub cover_image_path: Option<String>,
    /// Carried over from the source preview
    pub file_size: i64,
    pub file_count: i32,
    pub like_count: i32,
    /// Soft-delete marker
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data required to create a new artifact row.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub cover_image_path: Option<String>,
    pub file_size: i64,
    pub file_count: i32,
}

/// Relational ledger backed by PostgreSQL.
pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    /// Create a new ledger with a connection pool.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a preview row.
    #[instrument(skip(self))]
    pub async fn insert_preview(
        &self,
        id: &str,
        file_size: i64,
        file_count: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<Preview, sqlx::Error> {
        let preview = sqlx::query_as::<_, Preview>(
            r#"
            INSERT INTO previews (id, file_size, file_count, created_at, expires_at)
            VALUES ($1, $2, $3, NOW(), $4)
            RETURNING id, file_size, file_count, created_at, expires_at, artifact_id
            "#,
        )
        .bind(id)
        .bind(file_size)
        .bind(file_count)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        metrics::counter!("pagedrop.previews.created").increment(1);
        debug!(preview_id = %id, file_count, "Preview row inserted");

        Ok(preview)
    }

    /// Get a preview by ID.
    pub async fn get_preview(&self, id: &str) -> Result<Option<Preview>, sqlx::Error> {
        sqlx::query_as::<_, Preview>(
            r#"
            SELECT id, file_size, file_count, created_at, expires_at, artifact_id
            FROM previews
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Whether a preview row with this ID already exists.
    pub async fn preview_exists(&self, id: &str) -> Result<bool, sqlx::Error> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM previews WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Link a preview to the artifact created from it.
    #[instrument(skip(self))]
    pub async fn link_preview_to_artifact(
        &self,
        preview_id: &str,
        artifact_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE previews SET artifact_id = $2 WHERE id = $1")
            .bind(preview_id)
            .bind(artifact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether an artifact row with this ID already exists (deleted or not).
    pub async fn artifact_exists(&self, id: &str) -> Result<bool, sqlx::Error> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM artifacts WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// Count a user's non-deleted artifacts, for quota enforcement.
    pub async fn count_user_artifacts(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM artifacts WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Insert an artifact row.
    #[instrument(skip(self, artifact), fields(artifact_id = %artifact.id, user_id = %artifact.user_id))]
    pub async fn insert_artifact(
        &self,
        artifact: &NewArtifact,
    ) -> Result<Artifact, sqlx::Error> {
        let row = sqlx::query_as::<_, Artifact>(
            r#"
            INSERT INTO artifacts (
                id, user_id, title, description, cover_image_path,
                file_size, file_count, like_count, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0, NOW(), NOW())
            RETURNING id, user_id, title, description, cover_image_path,
                      file_size, file_count, like_count, deleted_at,
                      created_at, updated_at
            "#,
        )
        .bind(&artifact.id)
        .bind(&artifact.user_id)
        .bind(&artifact.title)
        .bind(&artifact.description)
        .bind(&artifact.cover_image_path)
        .bind(artifact.file_size)
        .bind(artifact.file_count)
        .fetch_one(&self.pool)
        .await?;

        metrics::counter!("pagedrop.artifacts.published").increment(1);
        debug!(artifact_id = %artifact.id, "Artifact row inserted");

        Ok(row)
    }

    /// Get a non-deleted artifact by ID.
    pub async fn get_artifact(&self, id: &str) -> Result<Option<Artifact>, sqlx::Error> {
        sqlx::query_as::<_, Artifact>(
            r#"
            SELECT id, user_id, title, description, cover_image_path,
                   file_size, file_count, like_count, deleted_at,
                   created_at, updated_at
            FROM artifacts
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Soft delete an artifact.
    #[instrument(skip(self))]
    pub async fn soft_delete_artifact(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE artifacts SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        metrics::counter!("pagedrop.artifacts.deleted").increment(1);
        Ok(())
    }

    /// Update artifact title and/or description.
    pub async fn update_artifact_metadata(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Artifact, sqlx::Error> {
        sqlx::query_as::<_, Artifact>(
            r#"
            UPDATE artifacts
            SET title = COALESCE($2, title),
                description = COALESCE($3, description),
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING id, user_id, title, description, cover_image_path,
                      file_size, file_count, like_count, deleted_at,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(description)
        .fetch_one(&self.pool)
        .await
    }

    /// Get the connection pool (for health checks).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_serializes_with_expiry() {
        let preview = Preview {
            id: "abc123defg".to_string(),
            file_size: 2048,
            file_count: 3,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
            artifact_id: None,
        };

        let json = serde_json::to_value(&preview).unwrap();
        assert_eq!(json["id"], "abc123defg");
        assert_eq!(json["fileSize"], serde_json::Value::Null);
        assert_eq!(json["file_size"], 2048);
        assert!(json["expires_at"].is_string());
    }

    #[test]
    fn test_new_artifact_carries_preview_size() {
        let artifact = NewArtifact {
            id: "xyz789abcd".to_string(),
            user_id: "user-1".to_string(),
            title: "My page".to_string(),
            description: String::new(),
            cover_image_path: Some("covers/xyz789abcd.png".to_string()),
            file_size: 4096,
            file_count: 2,
        };
        assert_eq!(artifact.file_size, 4096);
        assert_eq!(artifact.file_count, 2);
    }
}
