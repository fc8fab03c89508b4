//! File handling: output encoding, uploads, data URLs, and filenames.
//!
//! File-typed leaves travel through the runtime as `file://` URL strings.
//! The output encoder walks nested values and replaces each leaf with
//! either an uploaded URL (when an upload prefix is configured) or an
//! inline data URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use futures::future::BoxFuture;
use serde_json::Value;

/// Platform-safe cap on generated filenames, in bytes.
pub const FILENAME_MAX_LENGTH: usize = 200;

const UPLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_READ_TIMEOUT: Duration = Duration::from_secs(15);
const UPLOAD_MAX_ATTEMPTS: u32 = 3;
const UPLOAD_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Interpret a JSON string as a file leaf if it is a `file://` URL.
pub fn file_url_to_path(value: &str) -> Option<PathBuf> {
    value.strip_prefix("file://").map(PathBuf::from)
}

/// Render a local path as a `file://` URL string.
pub fn path_to_file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn ensure_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

/// Derive a safe filename from a URL path.
///
/// Falls back to `file` (plus an extension guessed from the content type)
/// when the path has no usable basename. Reserved characters are replaced
/// and overlong names are truncated with a `~` marker.
pub fn filename_from_url(url: &str, content_type: Option<&str>) -> String {
    let basename = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_default();

    let name = if basename.is_empty() {
        let extension = content_type
            .and_then(mime_guess::get_mime_extensions_str)
            .and_then(|exts| exts.first())
            .copied();
        match extension {
            Some(ext) => format!("file.{ext}"),
            None => "file".to_string(),
        }
    } else {
        basename
    };

    truncate_filename_bytes(&sanitize_filename(&name), FILENAME_MAX_LENGTH)
}

/// Replace path separators and NUL with underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\0'], "_")
}

/// Truncate a filename so its byte length does not exceed `max`,
/// preserving the extension and appending a `~` to mark the cut.
pub fn truncate_filename_bytes(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }

    let (root, ext) = match name.rfind('.') {
        // A leading dot is a hidden-file prefix, not an extension.
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    };

    let budget = max.saturating_sub(ext.len() + 1);
    let mut cut = budget.min(root.len());
    while cut > 0 && !root.is_char_boundary(cut) {
        cut -= 1;
    }

    format!("{}~{}", &root[..cut], ext)
}

/// Encode a file's bytes as a data URL with a media type guessed from the
/// filename.
pub fn to_data_url(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}

/// Parse a base64 data URL into its media type and payload.
pub fn parse_data_url(value: &str) -> Option<(String, Vec<u8>)> {
    let rest = value.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    let media_type = if media_type.is_empty() {
        "text/plain".to_string()
    } else {
        media_type.to_string()
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()?;
    Some((media_type, bytes))
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload failed with status {status}")]
    Http { status: u16 },
    #[error("upload transport error: {0}")]
    Transport(String),
    #[error("failed to read file for upload: {0}")]
    Io(#[from] std::io::Error),
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Sub-millisecond-seeded jitter so concurrent retries don't align.
fn retry_jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos % 50))
}

/// PUT client for file-typed outputs against a signed upload prefix.
pub struct FileUploader {
    client: reqwest::Client,
    prefix: String,
}

impl FileUploader {
    pub fn new(prefix: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(UPLOAD_CONNECT_TIMEOUT)
            .read_timeout(UPLOAD_READ_TIMEOUT)
            .build()?;
        Ok(Self { client, prefix })
    }

    /// Upload the file at `path` to `<prefix>/<basename>` and return the
    /// destination URL with any signing query parameters stripped.
    pub async fn upload(&self, path: &Path) -> Result<String, UploadError> {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let filename = truncate_filename_bytes(&sanitize_filename(&basename), FILENAME_MAX_LENGTH);
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();
        let url = format!("{}{}", ensure_trailing_slash(&self.prefix), filename);

        let bytes = tokio::fs::read(path).await?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .client
                .put(&url)
                .header(reqwest::header::CONTENT_TYPE, &content_type)
                .body(bytes.clone())
                .send()
                .await;

            let retry_delay = UPLOAD_BACKOFF_BASE * 2u32.saturating_pow(attempt) + retry_jitter();

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        let mut final_url = response.url().clone();
                        final_url.set_query(None);
                        return Ok(final_url.to_string());
                    }

                    if is_retryable_status(status) && attempt < UPLOAD_MAX_ATTEMPTS {
                        tracing::warn!(%url, status, attempt, "File upload failed, retrying");
                        tokio::time::sleep(retry_delay).await;
                        continue;
                    }
                    return Err(UploadError::Http { status });
                }
                Err(e) => {
                    if attempt < UPLOAD_MAX_ATTEMPTS {
                        tracing::warn!(%url, error = %e, attempt, "File upload transport error, retrying");
                        tokio::time::sleep(retry_delay).await;
                        continue;
                    }
                    return Err(UploadError::Transport(e.to_string()));
                }
            }
        }
    }
}

/// Typed walk over an output value, replacing file leaves.
///
/// With an upload prefix configured, leaves become uploaded URLs; without
/// one they become data URLs. If an upload ultimately fails the leaf falls
/// back to a data URL so the prediction still completes.
pub struct OutputEncoder {
    uploader: Option<FileUploader>,
    encountered: Vec<PathBuf>,
}

impl OutputEncoder {
    pub fn new(upload_url: Option<String>) -> Self {
        let uploader = upload_url.and_then(|prefix| match FileUploader::new(prefix) {
            Ok(uploader) => Some(uploader),
            Err(e) => {
                tracing::error!(error = %e, "Failed to build upload client, falling back to data URLs");
                None
            }
        });
        Self {
            uploader,
            encountered: Vec::new(),
        }
    }

    /// Encode one output payload.
    pub async fn encode(&mut self, value: &Value) -> Value {
        self.encode_value(value).await
    }

    /// Files seen so far, for post-terminal cleanup by the handler.
    pub fn take_encountered(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.encountered)
    }

    fn encode_value<'a>(&'a mut self, value: &'a Value) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            match value {
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (key, nested) in map {
                        out.insert(key.clone(), self.encode_value(nested).await);
                    }
                    Value::Object(out)
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for nested in items {
                        out.push(self.encode_value(nested).await);
                    }
                    Value::Array(out)
                }
                Value::String(s) => match file_url_to_path(s) {
                    Some(path) => self.encode_file_leaf(&path).await,
                    None => value.clone(),
                },
                _ => value.clone(),
            }
        })
    }

    async fn encode_file_leaf(&mut self, path: &Path) -> Value {
        self.encountered.push(path.to_path_buf());

        if let Some(ref uploader) = self.uploader {
            match uploader.upload(path).await {
                Ok(url) => return Value::String(url),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Upload failed, inlining file as data URL"
                    );
                }
            }
        }

        match to_data_url(path) {
            Ok(url) => Value::String(url),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to read file output");
                Value::String(path_to_file_url(path))
            }
        }
    }
}

/// Materialize base64 data URLs in an input payload into temp files.
///
/// Returns the rewritten payload (data URLs replaced by `file://` paths)
/// plus the created files, which the handler unlinks after the prediction
/// terminates.
pub fn materialize_data_urls(
    input: &Value,
    dir: &Path,
) -> std::io::Result<(Value, Vec<PathBuf>)> {
    let mut created = Vec::new();
    let mut counter = 0usize;
    let rewritten = materialize_value(input, dir, &mut created, &mut counter)?;
    Ok((rewritten, created))
}

fn materialize_value(
    value: &Value,
    dir: &Path,
    created: &mut Vec<PathBuf>,
    counter: &mut usize,
) -> std::io::Result<Value> {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, nested) in map {
                out.insert(key.clone(), materialize_value(nested, dir, created, counter)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for nested in items {
                out.push(materialize_value(nested, dir, created, counter)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => match parse_data_url(s) {
            Some((media_type, bytes)) => {
                std::fs::create_dir_all(dir)?;
                let extension = mime_guess::get_mime_extensions_str(&media_type)
                    .and_then(|exts| exts.first())
                    .copied()
                    .unwrap_or("bin");
                let path = dir.join(format!("input-{counter}.{extension}"));
                *counter += 1;
                std::fs::write(&path, bytes)?;
                created.push(path.clone());
                Ok(Value::String(path_to_file_url(&path)))
            }
            None => Ok(value.clone()),
        },
        _ => Ok(value.clone()),
    }
}
