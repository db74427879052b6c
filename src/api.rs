//! HTTP API: route definitions, request handlers, and the admission guard
//! wiring for each route.
//!
//! Authentication itself is out of scope: the upstream proxy terminates the
//! session and injects the caller's user ID as the `x-pagedrop-user` header.
//! The client IP used by the sliding-window limiter is the first hop of
//! `x-forwarded-for`.

use crate::admission::{Admission, Identity};
use crate::config::{AdmissionConfig, ApiConfig};
use crate::error::AppError;
use crate::kv::KvStore;
use crate::ledger::{Artifact, Ledger};
use crate::preview::{FileEntry, PreviewCreated, PreviewService};
use crate::publish::{PublishRequest, PublishService};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Route keys scoping limiter and lock state in the KV store.
const ROUTE_CREATE_PREVIEW: &str = "artifact.createPreview";
const ROUTE_PUBLISH: &str = "artifact.publish";
const ROUTE_DELETE: &str = "artifact.delete";
const ROUTE_UPDATE: &str = "artifact.update";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<Admission>,
    pub preview_service: Arc<PreviewService>,
    pub publish_service: Arc<PublishService>,
    pub ledger: Arc<Ledger>,
    pub kv: KvStore,
    pub admission_config: AdmissionConfig,
}

/// Create-preview request: either a file bundle or a single pasted HTML
/// document.
#[derive(Debug, Deserialize)]
pub struct CreatePreviewBody {
    #[serde(default)]
    pub files: Option<Vec<FileEntry>>,
    #[serde(default)]
    pub html: Option<String>,
}

/// Artifact fields exposed to clients, camelCase per the API contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactResponse {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub cover_image_path: Option<String>,
    pub file_size: i64,
    pub file_count: i32,
    pub like_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Artifact> for ArtifactResponse {
    fn from(a: Artifact) -> Self {
        Self {
            id: a.id,
            user_id: a.user_id,
            title: a.title,
            description: a.description,
            cover_image_path: a.cover_image_path,
            file_size: a.file_size,
            file_count: a.file_count,
            like_count: a.like_count,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

/// Publish response body.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub artifact: ArtifactResponse,
}

/// Metadata update request body.
#[derive(Debug, Deserialize)]
pub struct UpdateArtifactBody {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Create the API router.
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/preview/create", post(create_preview))
        .route("/api/v1/artifact/publish", post(publish_artifact))
        .route("/api/v1/artifact/:artifact_id", patch(update_artifact))
        .route("/api/v1/artifact/:artifact_id", delete(delete_artifact))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "pagedrop"
    }))
}

/// Readiness check: database and KV connectivity.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = sqlx::query("SELECT 1")
        .fetch_one(state.ledger.pool())
        .await
        .is_ok();
    let kv = state.kv.ping().await.is_ok();

    if database && kv {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected",
                "kv": "connected"
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": if database { "connected" } else { "disconnected" },
                "kv": if kv { "connected" } else { "disconnected" }
            })),
        )
    }
}

/// Create a preview from an uploaded bundle or pasted HTML.
///
/// Guarded by the per-IP sliding window, then the global token bucket.
#[instrument(skip(state, headers, body))]
async fn create_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePreviewBody>,
) -> Result<Json<PreviewCreated>, AppError> {
    let identity = identity_from_headers(&headers);

    state
        .admission
        .check_sliding_window(
            ROUTE_CREATE_PREVIEW,
            &state.admission_config.preview_sliding_window,
            &identity,
            None,
        )
        .await?;
    state
        .admission
        .check_token_bucket(
            ROUTE_CREATE_PREVIEW,
            &state.admission_config.preview_token_bucket,
        )
        .await?;

    let created = match (body.files, body.html) {
        (Some(files), None) => state.preview_service.create_preview(files).await?,
        (None, Some(html)) => state.preview_service.create_preview_from_html(html).await?,
        _ => {
            return Err(AppError::Validation(
                "Provide either 'files' or 'html'".to_string(),
            ))
        }
    };

    Ok(Json(created))
}

/// Publish a preview as an artifact. Authenticated; serialized per user by
/// the single-flight lock.
#[instrument(skip(state, headers, request))]
async fn publish_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, AppError> {
    let identity = identity_from_headers(&headers);
    let user_id = identity.user_id.ok_or(AppError::Unauthorized)?;

    let artifact = state
        .admission
        .with_single_flight(&user_id, ROUTE_PUBLISH, async {
            state.publish_service.publish(request, &user_id).await
        })
        .await?;

    Ok(Json(PublishResponse {
        artifact: artifact.into(),
    }))
}

/// Update artifact metadata. Authenticated.
#[instrument(skip(state, headers, body))]
async fn update_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateArtifactBody>,
) -> Result<Json<ArtifactResponse>, AppError> {
    let identity = identity_from_headers(&headers);
    let user_id = identity.user_id.ok_or(AppError::Unauthorized)?;

    let artifact = state
        .admission
        .with_single_flight(&user_id, ROUTE_UPDATE, async {
            state
                .publish_service
                .update_artifact(&artifact_id, &user_id, body.title, body.description)
                .await
        })
        .await?;

    Ok(Json(artifact.into()))
}

/// Soft-delete an artifact and clean up its objects. Authenticated.
#[instrument(skip(state, headers))]
async fn delete_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let identity = identity_from_headers(&headers);
    let user_id = identity.user_id.ok_or(AppError::Unauthorized)?;

    state
        .admission
        .with_single_flight(&user_id, ROUTE_DELETE, async {
            state
                .publish_service
                .delete_artifact(&artifact_id, &user_id)
                .await
        })
        .await?;

    Ok(Json(serde_json::json!({ "success": true })))
}

/// Derive the caller identity from request headers.
fn identity_from_headers(headers: &HeaderMap) -> Identity {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let user_id = headers
        .get("x-pagedrop-user")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    Identity { client_ip, user_id }
}

/// Start the API server.
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> anyhow::Result<()> {
    use anyhow::Context;

    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_identity_takes_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1, 10.0.0.2"),
        );
        let identity = identity_from_headers(&headers);
        assert_eq!(identity.client_ip.as_deref(), Some("203.0.113.7"));
        assert!(identity.user_id.is_none());
    }

    #[test]
    fn test_identity_missing_headers() {
        let identity = identity_from_headers(&HeaderMap::new());
        assert!(identity.client_ip.is_none());
        assert!(identity.user_id.is_none());
    }

    #[test]
    fn test_identity_user_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-pagedrop-user", HeaderValue::from_static("user-42"));
        let identity = identity_from_headers(&headers);
        assert_eq!(identity.user_id.as_deref(), Some("user-42"));
    }

    #[test]
    fn test_identity_empty_values_filtered() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("  "));
        headers.insert("x-pagedrop-user", HeaderValue::from_static(""));
        let identity = identity_from_headers(&headers);
        assert!(identity.client_ip.is_none());
        assert!(identity.user_id.is_none());
    }

    #[test]
    fn test_artifact_response_camel_case() {
        let artifact = Artifact {
            id: "xyz789abcd".to_string(),
            user_id: "user-1".to_string(),
            title: "My page".to_string(),
            description: String::new(),
            cover_image_path: None,
            file_size: 1024,
            file_count: 1,
            like_count: 0,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let json = serde_json::to_value(ArtifactResponse::from(artifact)).unwrap();
        assert_eq!(json["fileSize"], 1024);
        assert_eq!(json["userId"], "user-1");
        assert!(json.get("deletedAt").is_none());
    }

    #[test]
    fn test_create_preview_body_accepts_both_shapes() {
        let files: CreatePreviewBody = serde_json::from_value(serde_json::json!({
            "files": [{"path": "index.html", "content": "PGgxPg==", "contentType": "text/html"}]
        }))
        .unwrap();
        assert!(files.files.is_some());
        assert!(files.html.is_none());

        let html: CreatePreviewBody =
            serde_json::from_value(serde_json::json!({"html": "<h1>hello</h1>"})).unwrap();
        assert!(html.files.is_none());
        assert!(html.html.is_some());
    }
}
