//! Object-store tests against a local S3-compatible endpoint.
//!
//! These exercise upload, prefix copy/delete, and listing against a real
//! bucket. MinIO works: `minio server /tmp/data`, with AWS_ACCESS_KEY_ID
//! and AWS_SECRET_ACCESS_KEY exported for the SDK credential chain.
//!
//! Run with: cargo test --test storage_integration -- --ignored
//! Set TEST_S3_ENDPOINT (default http://localhost:9000).

use aws_config::BehaviorVersion;
use pagedrop::config::StorageConfig;
use pagedrop::object_store::ObjectStore;
use pagedrop::paths;
use pagedrop::AppError;

fn test_storage_config() -> StorageConfig {
    let endpoint = std::env::var("TEST_S3_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:9000".to_string());
    StorageConfig {
        bucket: "pagedrop-test".to_string(),
        assets_bucket: "pagedrop-test-assets".to_string(),
        region: "us-east-1".to_string(),
        endpoint_url: Some(endpoint),
        force_path_style: true,
        upload_attempts: 3,
        backoff_base_secs: 1,
        transfer_concurrency: 4,
    }
}

async fn ensure_bucket(config: &StorageConfig, bucket: &str) {
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;
    let mut builder = aws_sdk_s3::config::Builder::from(&aws_config).force_path_style(true);
    if let Some(ref endpoint) = config.endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }
    let client = aws_sdk_s3::Client::from_conf(builder.build());

    // Already-existing buckets are fine.
    let _ = client.create_bucket().bucket(bucket).send().await;
}

async fn test_store() -> ObjectStore {
    let config = test_storage_config();
    ensure_bucket(&config, &config.bucket).await;
    ensure_bucket(&config, &config.assets_bucket).await;
    ObjectStore::new(&config)
        .await
        .expect("Failed to build object store client")
}

async fn fetch_content_object(key: &str) -> Vec<u8> {
    let config = test_storage_config();
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;
    let mut builder = aws_sdk_s3::config::Builder::from(&aws_config).force_path_style(true);
    if let Some(ref endpoint) = config.endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }
    let client = aws_sdk_s3::Client::from_conf(builder.build());

    let response = client
        .get_object()
        .bucket(&config.bucket)
        .key(key)
        .send()
        .await
        .expect("Failed to fetch object");
    response
        .body
        .collect()
        .await
        .expect("Failed to read object body")
        .into_bytes()
        .to_vec()
}

#[tokio::test]
#[ignore = "requires S3-compatible storage"]
async fn copy_prefix_moves_every_object_with_substituted_keys() {
    let store = test_store().await;
    let preview_id = paths::generate_short_id();
    let artifact_id = paths::generate_short_id();

    let files = [
        ("index.html", b"<h1>hello</h1>".to_vec()),
        ("assets/app.js", b"console.log(1)".to_vec()),
        ("assets/style.css", b"body{margin:0}".to_vec()),
    ];
    for (path, bytes) in &files {
        store
            .upload(
                bytes.clone(),
                "application/octet-stream",
                &paths::preview_file_key(&preview_id, path),
            )
            .await
            .expect("Upload should succeed");
    }

    let source_prefix = paths::preview_content_prefix(&preview_id);
    let dest_prefix = paths::artifact_content_prefix(&artifact_id);
    let copied = store
        .copy_prefix(&source_prefix, &dest_prefix)
        .await
        .expect("Prefix copy should succeed");
    assert_eq!(copied.len(), files.len());

    let mut dest_keys = store
        .list_by_prefix(&dest_prefix)
        .await
        .expect("Listing the destination should succeed");
    dest_keys.sort();
    let mut expected: Vec<String> = files
        .iter()
        .map(|(path, _)| format!("{}/{}", dest_prefix, path))
        .collect();
    expected.sort();
    assert_eq!(dest_keys, expected);

    // Byte fidelity of a copied object.
    let copied_index = fetch_content_object(&format!("{}/index.html", dest_prefix)).await;
    assert_eq!(copied_index, b"<h1>hello</h1>");

    store.delete_by_prefix(&source_prefix).await.expect("Cleanup");
    store.delete_by_prefix(&dest_prefix).await.expect("Cleanup");
}

#[tokio::test]
#[ignore = "requires S3-compatible storage"]
async fn copy_prefix_with_empty_source_is_not_found() {
    let store = test_store().await;
    let missing = paths::preview_content_prefix(&paths::generate_short_id());

    let result = store
        .copy_prefix(&missing, &paths::artifact_content_prefix("nowhere123"))
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
#[ignore = "requires S3-compatible storage"]
async fn delete_by_prefix_is_idempotent() {
    let store = test_store().await;
    let preview_id = paths::generate_short_id();
    let prefix = paths::preview_content_prefix(&preview_id);

    store
        .upload(
            b"<p>gone soon</p>".to_vec(),
            "text/html",
            &paths::preview_file_key(&preview_id, "index.html"),
        )
        .await
        .expect("Upload should succeed");

    store.delete_by_prefix(&prefix).await.expect("First delete");
    assert!(store
        .list_by_prefix(&prefix)
        .await
        .expect("Listing should succeed")
        .is_empty());

    // Second pass over an empty prefix is a no-op.
    store.delete_by_prefix(&prefix).await.expect("Second delete");
}
