//! Shared handler plumbing: multipart upload intake, file responses with
//! RFC 5987 names, and upload-path resolution.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::Multipart;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::Response;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::api::error::ApiError;
use crate::config::{self, TempDir};
use crate::services::ServiceContainer;
use crate::utils::to_ascii_filename;

/// Media extensions accepted for direct uploads.
const ALLOWED_UPLOAD_EXTS: [&str; 20] = [
    "mp4", "webm", "mkv", "mov", "avi", "flv", "wmv", "mp3", "m4a", "wav", "flac", "ogg", "opus",
    "aac", "wma", "ts", "m4v", "3gp", "mpg", "mpeg",
];

/// One parsed multipart upload: the saved file plus all text fields.
pub struct UploadedForm {
    pub file_path: PathBuf,
    pub original_name: String,
    pub fields: HashMap<String, String>,
}

impl UploadedForm {
    pub fn field(&self, key: &str) -> &str {
        self.fields.get(key).map(|s| s.as_str()).unwrap_or("")
    }

    pub fn field_or(&self, key: &str, fallback: &str) -> String {
        let v = self.field(key);
        if v.is_empty() { fallback.to_string() } else { v.to_string() }
    }
}

/// Drain a multipart form, streaming the field named `file_field` into the
/// uploads temp dir and collecting every other field as text.
pub async fn save_uploaded_file(
    mut multipart: Multipart,
    file_field: &str,
) -> Result<UploadedForm, ApiError> {
    let mut file_path: Option<PathBuf> = None;
    let mut original_name = String::new();
    let mut fields = HashMap::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("Failed to parse upload: file may be too large"))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == file_field {
            let filename = field.file_name().unwrap_or("").to_string();
            let ext = PathBuf::from(&filename)
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if ext.is_empty() || !ALLOWED_UPLOAD_EXTS.contains(&ext.as_str()) {
                return Err(ApiError::bad_request(
                    "Unsupported file type. Please upload a media file.",
                ));
            }

            let tmp_path = TempDir::Upload
                .path()
                .join(format!("{}.{ext}", uuid::Uuid::new_v4()));
            let mut dst = tokio::fs::File::create(&tmp_path)
                .await
                .map_err(|_| ApiError::internal("Failed to save file"))?;
            let mut written = 0u64;
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|_| ApiError::bad_request("Failed to parse upload: file may be too large"))?
            {
                written += chunk.len() as u64;
                if written > config::FILE_SIZE_LIMIT {
                    drop(dst);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(ApiError::bad_request(format!(
                        "File too large. Maximum size is {}GB",
                        config::FILE_SIZE_LIMIT / (1024 * 1024 * 1024)
                    )));
                }
                if dst.write_all(&chunk).await.is_err() {
                    drop(dst);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(ApiError::internal("Failed to save file"));
                }
            }
            dst.flush()
                .await
                .map_err(|_| ApiError::internal("Failed to save file"))?;
            file_path = Some(tmp_path);
            original_name = filename;
        } else {
            let value = field.text().await.unwrap_or_default();
            fields.insert(name, value);
        }
    }

    let file_path = file_path.ok_or_else(|| ApiError::bad_request("No file uploaded"))?;
    Ok(UploadedForm { file_path, original_name, fields })
}

/// `Content-Disposition: attachment` with an ASCII fallback plus the
/// RFC 5987 UTF-8 name.
pub fn content_disposition(filename: &str) -> HeaderValue {
    let ascii = to_ascii_filename(filename).replace('"', "_");
    let encoded = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Streaming file response with download headers. `on_done` runs when the
/// body stream is dropped, whether it completed or the client vanished.
pub async fn file_response(
    path: &std::path::Path,
    filename: &str,
    mime_type: &str,
    on_done: Option<Box<dyn FnOnce() + Send + 'static>>,
) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ApiError::internal("Failed to read file"))?;

    let guard = DoneGuard { on_done };
    let stream = ReaderStream::new(file);
    let stream = futures::StreamExt::map(stream, move |chunk| {
        let _hold = &guard;
        chunk
    });

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime_type).unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(filename));

    let mut response = Response::new(Body::from_stream(stream));
    *response.headers_mut() = headers;
    Ok(response)
}

struct DoneGuard {
    on_done: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if let Some(on_done) = self.on_done.take() {
            on_done();
        }
    }
}

/// Resolve an uploaded-file reference: a one-shot FileRef token, or a
/// literal path that must live inside the uploads root and not be a
/// symlink. Returns the path and the original filename when known.
pub async fn resolve_file_path(
    services: &ServiceContainer,
    input: &str,
) -> Option<(PathBuf, Option<String>)> {
    if input.is_empty() {
        return None;
    }

    if let Some(file_ref) = services.file_refs.take(input) {
        return Some((file_ref.file_path, Some(file_ref.file_name)));
    }

    let resolved = std::path::Path::new(input);
    let upload_root = TempDir::Upload.path();
    let resolved = if resolved.is_absolute() {
        resolved.to_path_buf()
    } else {
        upload_root.join(resolved)
    };
    // Reject traversal out of the uploads root.
    let normalized: PathBuf = {
        let mut out = PathBuf::new();
        for component in resolved.components() {
            match component {
                std::path::Component::ParentDir => {
                    out.pop();
                }
                std::path::Component::CurDir => {}
                other => out.push(other),
            }
        }
        out
    };
    if !normalized.starts_with(&upload_root) {
        return None;
    }
    let meta = tokio::fs::symlink_metadata(&normalized).await.ok()?;
    if meta.file_type().is_symlink() || !meta.is_file() {
        return None;
    }
    Some((normalized, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_encodes_both_names() {
        let header = content_disposition("héllo video.mp4");
        let value = header.to_str().unwrap();
        assert!(value.contains("filename=\"h_llo video.mp4\""));
        assert!(value.contains("filename*=UTF-8''h%C3%A9llo%20video%2Emp4"));
    }

    #[test]
    fn disposition_survives_quotes() {
        let header = content_disposition("a\"b.mp4");
        assert!(header.to_str().unwrap().contains("filename=\"a_b.mp4\""));
    }

    #[tokio::test]
    async fn path_resolution_refuses_escapes() {
        let services = ServiceContainer::for_tests();
        assert!(resolve_file_path(&services, "").await.is_none());
        assert!(resolve_file_path(&services, "/etc/passwd").await.is_none());
        assert!(
            resolve_file_path(&services, "../../../etc/passwd").await.is_none(),
            "traversal must not escape the uploads root"
        );
    }

    #[tokio::test]
    async fn file_ref_tokens_resolve_once() {
        let services = ServiceContainer::for_tests();
        services.file_refs.put(
            "tok",
            crate::artifacts::FileRef {
                file_path: PathBuf::from("/var/tmp/yoink/uploads/a.mp4"),
                file_name: "a.mp4".into(),
                created_at: std::time::Instant::now(),
            },
        );
        let (path, name) = resolve_file_path(&services, "tok").await.unwrap();
        assert_eq!(path, PathBuf::from("/var/tmp/yoink/uploads/a.mp4"));
        assert_eq!(name.as_deref(), Some("a.mp4"));
        assert!(resolve_file_path(&services, "tok").await.is_none());
    }
}
