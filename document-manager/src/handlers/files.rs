use crate::flash::{self, FlashMessage, Level};
use crate::handlers::documents::{fail, NOT_FOUND_MESSAGE};
use crate::handlers::extract::DocumentId;
use crate::models::Document;
use crate::services::metrics::{FILES_UPLOADED, STORAGE_FAILURES};
use crate::services::storage::{guess_content_type, FileAccess};
use crate::startup::AppState;
use askama::Template;
use axum::{
    body::Body,
    extract::{Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use metrics::counter;
use service_core::error::AppError;
use tower_sessions::Session;

pub const NO_FILE_SELECTED: &str = "No file selected";
pub const NO_FILE_AVAILABLE: &str = "No file available";

#[derive(Template)]
#[template(path = "upload.html")]
pub struct UploadTemplate {
    pub document: Document,
    pub flashes: Vec<FlashMessage>,
}

/// A file part pulled out of the upload form.
struct UploadedFile {
    filename: String,
    data: Vec<u8>,
}

/// Finds the `file` part. `Ok(None)` when the browser submitted the form
/// without choosing a file.
async fn read_file_field(multipart: &mut Multipart) -> Result<Option<UploadedFile>, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(anyhow::anyhow!("Failed to read multipart field: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().trim().to_string();
        if filename.is_empty() {
            return Ok(None);
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Failed to read file: {}", e)))?
            .to_vec();

        return Ok(Some(UploadedFile { filename, data }));
    }

    Ok(None)
}

/// Header-safe form of a stored filename.
fn disposition_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect()
}

pub async fn upload_form(
    State(state): State<AppState>,
    session: Session,
    DocumentId(id): DocumentId,
) -> Response {
    match state.store.get(id).await {
        Ok(Some(document)) => {
            let flashes = flash::take(&session).await;
            UploadTemplate { document, flashes }.into_response()
        }
        Ok(None) => flash::redirect(&session, Level::Danger, NOT_FOUND_MESSAGE, "/").await,
        Err(e) => fail(&session, "Failed to load document", e).await,
    }
}

/// Stores the uploaded file and points the document at it. A previously
/// attached blob is removed only after the new one is recorded.
pub async fn upload_file(
    State(state): State<AppState>,
    session: Session,
    DocumentId(id): DocumentId,
    mut multipart: Multipart,
) -> Response {
    let document = match state.store.get(id).await {
        Ok(Some(document)) => document,
        Ok(None) => return flash::redirect(&session, Level::Danger, NOT_FOUND_MESSAGE, "/").await,
        Err(e) => return fail(&session, "Failed to load document", e).await,
    };
    let retry_url = format!("/upload/{}", id);

    let upload = match read_file_field(&mut multipart).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            return flash::redirect(&session, Level::Danger, NO_FILE_SELECTED, &retry_url).await
        }
        Err(e) => {
            tracing::warn!(document_id = id, error = %e, "Rejected upload");
            let message = format!("Upload failed: {}", e.user_message());
            return flash::redirect(&session, Level::Danger, message, &retry_url).await;
        }
    };

    let size = upload.data.len();
    let storage_path = match state.storage.put(id, &upload.filename, upload.data).await {
        Ok(path) => path,
        Err(e) => return fail(&session, "Failed to store file", e).await,
    };

    if let Err(e) = state
        .store
        .attach_file(id, &upload.filename, &storage_path)
        .await
    {
        return fail(&session, "Failed to record uploaded file", e).await;
    }

    if let Some(previous) = document.storage_path.as_deref() {
        if previous != storage_path {
            if let Err(e) = state.storage.delete(previous).await {
                counter!(STORAGE_FAILURES).increment(1);
                tracing::warn!(
                    document_id = id,
                    storage_path = %previous,
                    error = %e,
                    "Failed to delete replaced file"
                );
            }
        }
    }

    counter!(FILES_UPLOADED, "backend" => state.storage.name()).increment(1);
    tracing::info!(
        document_id = id,
        backend = state.storage.name(),
        filename = %upload.filename,
        size = size,
        "File uploaded"
    );

    flash::redirect(&session, Level::Success, "File uploaded successfully!", "/").await
}

/// Streams a local file or redirects to a presigned S3 URL.
pub async fn fetch_file(
    State(state): State<AppState>,
    session: Session,
    DocumentId(id): DocumentId,
) -> Response {
    let document = match state.store.get(id).await {
        Ok(document) => document,
        Err(e) => return fail(&session, "Failed to load document", e).await,
    };

    let Some((filename, storage_path)) = document.as_ref().and_then(Document::attachment) else {
        return flash::redirect(&session, Level::Danger, NO_FILE_AVAILABLE, "/").await;
    };

    match state.storage.resolve(storage_path).await {
        Ok(FileAccess::Stream { body, size }) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, guess_content_type(filename).to_string()),
                (header::CONTENT_LENGTH, size.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", disposition_filename(filename)),
                ),
            ],
            Body::from_stream(body),
        )
            .into_response(),
        Ok(FileAccess::Redirect(url)) => {
            tracing::debug!(document_id = id, "Redirecting to signed URL");
            Redirect::to(&url).into_response()
        }
        Err(AppError::NotFound(_)) => {
            tracing::warn!(document_id = id, storage_path = %storage_path, "Stored file is missing");
            flash::redirect(&session, Level::Danger, NO_FILE_AVAILABLE, "/").await
        }
        Err(e) => fail(&session, "Failed to fetch file", e).await,
    }
}
