//! Blob storage for document attachments.
//!
//! Two backends share the [`Storage`] contract: [`LocalStorage`] writes under a
//! root directory and streams files back; [`S3Storage`] uploads to a bucket and
//! hands out short-lived presigned URLs. One is chosen at startup and kept for
//! the life of the process.

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use service_core::error::AppError;
use std::error::Error;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Lifetime of a presigned download URL.
pub const SIGNED_URL_TTL: Duration = Duration::from_secs(300);

/// How a stored file is handed back to the client.
pub enum FileAccess {
    /// Bytes to send directly as a download.
    Stream {
        body: ReaderStream<File>,
        size: u64,
    },
    /// A time-limited URL the client fetches the file from.
    Redirect(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Stores `data` for the document and returns the locator to persist in
    /// `storage_path`.
    async fn put(
        &self,
        document_id: i64,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<String, AppError>;

    /// Removes the blob behind `locator`.
    async fn delete(&self, locator: &str) -> Result<(), AppError>;

    async fn resolve(&self, locator: &str) -> Result<FileAccess, AppError>;
}

/// Reduce an uploaded filename to a safe single path component.
///
/// Directory parts are dropped, whitespace becomes `_`, anything outside
/// `[A-Za-z0-9._-]` is removed and leading dots are stripped.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `{unix_seconds}_{sanitized name}`, the leaf name used by both backends.
pub fn object_name(timestamp: i64, filename: &str) -> String {
    format!("{}_{}", timestamp, sanitize_filename(filename))
}

pub fn guess_content_type(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown; charset=utf-8",
        Some("csv") => "text/csv; charset=utf-8",
        Some("json") => "application/json",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

fn storage_error(context: &str, err: impl std::fmt::Display) -> AppError {
    AppError::StorageError(anyhow::anyhow!("{}: {}", context, err))
}

/// Walk the error source chain and join all messages.
fn error_chain(err: &dyn Error) -> String {
    let mut msgs = vec![err.to_string()];
    let mut source = err.source();
    while let Some(s) = source {
        msgs.push(s.to_string());
        source = s.source();
    }
    msgs.join(": ")
}

/// Same-second names tried per upload before giving up.
const MAX_NAME_ATTEMPTS: u32 = 16;

/// Leaf name for the `attempt`-th try: `{ts}_{name}`, then `{ts}-{n}_{name}`.
fn local_name(timestamp: i64, attempt: u32, filename: &str) -> String {
    if attempt == 0 {
        object_name(timestamp, filename)
    } else {
        format!("{}-{}_{}", timestamp, attempt, sanitize_filename(filename))
    }
}

/// Files live under `{root}/{document_id}/`, mirroring the S3 key layout.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root).await?;
        }
        Ok(Self { root })
    }

    /// Writes `data` to `path` unless a file is already there. `Ok(None)`
    /// means the name is taken; existing files are never overwritten.
    async fn write_new(&self, path: &Path, data: &[u8]) -> Result<Option<PathBuf>, AppError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(storage_error("Failed to create file", e)),
        };

        file.write_all(data)
            .await
            .map_err(|e| storage_error("Failed to write file", e))?;
        file.flush()
            .await
            .map_err(|e| storage_error("Failed to flush file", e))?;

        Ok(Some(path.to_path_buf()))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        document_id: i64,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<String, AppError> {
        let dir = self.root.join(document_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error("Failed to create document directory", e))?;

        let timestamp = chrono::Utc::now().timestamp();
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = dir.join(local_name(timestamp, attempt, filename));
            if let Some(path) = self.write_new(&candidate, &data).await? {
                tracing::debug!(path = %path.display(), size = data.len(), "Stored file on local disk");
                return Ok(path.to_string_lossy().into_owned());
            }
        }

        Err(storage_error(
            "No free file name",
            format!("{} uploads of {} in one second", MAX_NAME_ATTEMPTS, filename),
        ))
    }

    async fn delete(&self, locator: &str) -> Result<(), AppError> {
        let path = Path::new(locator);
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %locator, "Local file already absent");
            }
            Err(e) => return Err(storage_error("Failed to delete local file", e)),
        }

        // Drop the per-document directory once it is empty.
        if let Some(parent) = path.parent().filter(|p| *p != self.root) {
            let _ = fs::remove_dir(parent).await;
        }
        Ok(())
    }

    async fn resolve(&self, locator: &str) -> Result<FileAccess, AppError> {
        let file = File::open(locator).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => AppError::NotFound(anyhow::anyhow!("Stored file is missing")),
            _ => storage_error("Failed to open local file", e),
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| storage_error("Failed to stat local file", e))?
            .len();

        Ok(FileAccess::Stream {
            body: ReaderStream::new(file),
            size,
        })
    }
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Builds a client for `region`. A custom endpoint (MinIO, LocalStack)
    /// switches to path-style addressing.
    pub async fn connect(region: &str, endpoint: Option<&str>, bucket: String) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));

        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;

        let client = if endpoint.is_some() {
            let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(true)
                .build();
            S3Client::from_conf(s3_config)
        } else {
            S3Client::new(&sdk_config)
        };

        tracing::info!(bucket = %bucket, region = %region, "S3 storage configured");
        Self::new(client, bucket)
    }

    /// `documents/{document_id}/{timestamp}_{name}`
    pub fn object_key(document_id: i64, timestamp: i64, filename: &str) -> String {
        format!("documents/{}/{}", document_id, object_name(timestamp, filename))
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put(
        &self,
        document_id: i64,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<String, AppError> {
        let key = Self::object_key(document_id, chrono::Utc::now().timestamp(), filename);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(guess_content_type(filename))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| storage_error("S3 upload failed", error_chain(&e)))?;

        tracing::debug!(bucket = %self.bucket, key = %key, "Uploaded file to S3");
        Ok(key)
    }

    async fn delete(&self, locator: &str) -> Result<(), AppError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(locator)
            .send()
            .await
            .map_err(|e| storage_error("S3 delete failed", error_chain(&e)))?;
        Ok(())
    }

    async fn resolve(&self, locator: &str) -> Result<FileAccess, AppError> {
        let presigning = PresigningConfig::expires_in(SIGNED_URL_TTL)
            .map_err(|e| storage_error("Invalid presigning config", e))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(locator)
            .presigned(presigning)
            .await
            .map_err(|e| storage_error("Failed to presign S3 URL", error_chain(&e)))?;

        Ok(FileAccess::Redirect(request.uri().to_string()))
    }
}
