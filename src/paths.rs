//! Object-store key layout and public URL derivation.
//!
//! The layout is a contract with the edge serving worker, which reads
//! (and only reads) these prefixes:
//!
//! - ephemeral content: `preview/{previewId}/content/{relativePath}`
//! - published content: `public/{artifactId}/content/{relativePath}`
//! - cover images:      `covers/{artifactId}.{ext}` (assets bucket)

use rand::Rng;

/// Length of generated preview/artifact IDs
pub const SHORT_ID_LEN: usize = 10;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Content prefix for a preview, without trailing slash
pub fn preview_content_prefix(preview_id: &str) -> String {
    format!("preview/{}/content", preview_id)
}

/// Content prefix for a published artifact, without trailing slash
pub fn artifact_content_prefix(artifact_id: &str) -> String {
    format!("public/{}/content", artifact_id)
}

/// Full key for one file inside a preview
pub fn preview_file_key(preview_id: &str, relative_path: &str) -> String {
    format!("{}/{}", preview_content_prefix(preview_id), relative_path)
}

/// Cover image key in the assets bucket, extension derived from the MIME type
pub fn cover_image_key(artifact_id: &str, content_type: &str) -> String {
    let ext = content_type.split('/').nth(1).unwrap_or("bin");
    format!("covers/{}.{}", artifact_id, ext)
}

/// Externally reachable URL for a preview
pub fn preview_url(preview_id: &str, app_domain: &str) -> String {
    format!("https://preview-{}.{}", preview_id, app_domain)
}

/// Externally reachable URL for a published artifact
pub fn artifact_url(artifact_id: &str, app_domain: &str) -> String {
    format!("https://{}.{}", artifact_id, app_domain)
}

/// Generate a short opaque ID (10 lowercase base-36 characters)
pub fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SHORT_ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Sanitize a path component to prevent path traversal.
///
/// Applied to client-supplied relative paths before they become object keys.
/// Slashes are kept so nested bundle paths survive; dot segments are not.
pub fn sanitize_relative_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .map(sanitize_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            preview_content_prefix("abc123defg"),
            "preview/abc123defg/content"
        );
        assert_eq!(
            artifact_content_prefix("xyz789"),
            "public/xyz789/content"
        );
        assert_eq!(
            preview_file_key("abc123defg", "assets/app.js"),
            "preview/abc123defg/content/assets/app.js"
        );
    }

    #[test]
    fn test_cover_image_key_extension() {
        assert_eq!(cover_image_key("abc", "image/png"), "covers/abc.png");
        assert_eq!(cover_image_key("abc", "image/jpeg"), "covers/abc.jpeg");
        assert_eq!(cover_image_key("abc", "weird"), "covers/abc.bin");
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            preview_url("abc123defg", "pagedrop.dev"),
            "https://preview-abc123defg.pagedrop.dev"
        );
        assert_eq!(
            artifact_url("xyz789", "pagedrop.dev"),
            "https://xyz789.pagedrop.dev"
        );
    }

    #[test]
    fn test_short_id_shape() {
        for _ in 0..100 {
            let id = generate_short_id();
            assert_eq!(id.len(), SHORT_ID_LEN);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_short_ids_are_unique_enough() {
        let a = generate_short_id();
        let b = generate_short_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sanitize_relative_path() {
        assert_eq!(sanitize_relative_path("index.html"), "index.html");
        assert_eq!(
            sanitize_relative_path("assets/main.css"),
            "assets/main.css"
        );
        assert_eq!(sanitize_relative_path("../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_relative_path("a/./b"), "a/b");
        assert_eq!(sanitize_relative_path("sp ace/file.js"), "sp_ace/file.js");
        assert_eq!(sanitize_relative_path("//double//slash"), "double/slash");
    }
}
