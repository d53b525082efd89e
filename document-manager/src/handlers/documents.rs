use crate::flash::{self, FlashMessage, Level};
use crate::handlers::extract::DocumentId;
use crate::models::{Document, DocumentFields};
use crate::services::metrics::{DOCUMENTS_CREATED, DOCUMENTS_DELETED, STORAGE_FAILURES};
use crate::startup::AppState;
use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Form,
};
use metrics::counter;
use serde::Deserialize;
use service_core::error::{validation_summary, AppError};
use tower_sessions::Session;
use validator::Validate;

pub const NOT_FOUND_MESSAGE: &str = "Document not found";

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub documents: Vec<Document>,
    pub flashes: Vec<FlashMessage>,
}

#[derive(Template)]
#[template(path = "document_form.html")]
pub struct DocumentFormTemplate {
    pub heading: &'static str,
    pub action: String,
    pub submit_label: &'static str,
    pub title: String,
    pub content: String,
    pub error: Option<String>,
    pub flashes: Vec<FlashMessage>,
}

impl DocumentFormTemplate {
    fn create(form: DocumentForm, error: Option<String>, flashes: Vec<FlashMessage>) -> Self {
        Self {
            heading: "New document",
            action: "/create".to_string(),
            submit_label: "Create",
            title: form.title,
            content: form.content.unwrap_or_default(),
            error,
            flashes,
        }
    }

    fn edit(
        id: i64,
        form: DocumentForm,
        error: Option<String>,
        flashes: Vec<FlashMessage>,
    ) -> Self {
        Self {
            heading: "Edit document",
            action: format!("/edit/{}", id),
            submit_label: "Save",
            title: form.title,
            content: form.content.unwrap_or_default(),
            error,
            flashes,
        }
    }
}

/// Submitted create/edit form. A missing title deserializes as empty so it
/// reaches validation instead of failing extraction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentForm {
    #[serde(default)]
    pub title: String,
    pub content: Option<String>,
}

impl From<&DocumentForm> for DocumentFields {
    fn from(form: &DocumentForm) -> Self {
        DocumentFields::new(form.title.as_str(), form.content.clone())
    }
}

impl From<&Document> for DocumentForm {
    fn from(document: &Document) -> Self {
        Self {
            title: document.title.clone(),
            content: document.content.clone(),
        }
    }
}

/// Log `err` and send the user back to the list with a notice.
pub(crate) async fn fail(session: &Session, context: &str, err: AppError) -> Response {
    let message = match &err {
        AppError::NotFound(_) => {
            tracing::info!(error = %err, "{}", context);
            NOT_FOUND_MESSAGE.to_string()
        }
        AppError::StorageError(_) => {
            counter!(STORAGE_FAILURES).increment(1);
            tracing::error!(error = %err, "{}", context);
            format!("{}: {}", context, err.user_message())
        }
        _ => {
            tracing::error!(error = %err, "{}", context);
            format!("{}: {}", context, err.user_message())
        }
    };

    flash::redirect(session, Level::Danger, message, "/").await
}

pub async fn list_documents(State(state): State<AppState>, session: Session) -> Response {
    let flashes = flash::take(&session).await;

    match state.store.list_all().await {
        Ok(documents) => IndexTemplate { documents, flashes }.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list documents");
            let mut flashes = flashes;
            flashes.push(FlashMessage {
                level: Level::Danger,
                message: format!("Could not load documents: {}", e.user_message()),
            });
            (
                StatusCode::SERVICE_UNAVAILABLE,
                IndexTemplate {
                    documents: Vec::new(),
                    flashes,
                },
            )
                .into_response()
        }
    }
}

pub async fn create_form(session: Session) -> Response {
    let flashes = flash::take(&session).await;
    DocumentFormTemplate::create(DocumentForm::default(), None, flashes).into_response()
}

pub async fn create_document(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<DocumentForm>,
) -> Response {
    let fields = DocumentFields::from(&form);
    if let Err(errors) = fields.validate() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            DocumentFormTemplate::create(form, Some(validation_summary(&errors)), Vec::new()),
        )
            .into_response();
    }

    match state.store.create(&fields).await {
        Ok(document) => {
            counter!(DOCUMENTS_CREATED).increment(1);
            tracing::info!(document_id = document.id, "Document created via form");
            flash::redirect(&session, Level::Success, "Document created successfully!", "/").await
        }
        Err(e) => fail(&session, "Failed to create document", e).await,
    }
}

pub async fn edit_form(
    State(state): State<AppState>,
    session: Session,
    DocumentId(id): DocumentId,
) -> Response {
    match state.store.get(id).await {
        Ok(Some(document)) => {
            let flashes = flash::take(&session).await;
            DocumentFormTemplate::edit(id, DocumentForm::from(&document), None, flashes)
                .into_response()
        }
        Ok(None) => flash::redirect(&session, Level::Danger, NOT_FOUND_MESSAGE, "/").await,
        Err(e) => fail(&session, "Failed to load document", e).await,
    }
}

pub async fn edit_document(
    State(state): State<AppState>,
    session: Session,
    DocumentId(id): DocumentId,
    Form(form): Form<DocumentForm>,
) -> Response {
    let fields = DocumentFields::from(&form);
    if let Err(errors) = fields.validate() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            DocumentFormTemplate::edit(id, form, Some(validation_summary(&errors)), Vec::new()),
        )
            .into_response();
    }

    match state.store.update_fields(id, &fields).await {
        Ok(_) => flash::redirect(&session, Level::Success, "Updated successfully!", "/").await,
        Err(e) => fail(&session, "Failed to update document", e).await,
    }
}

/// Deletes the attached blob (best effort) and then the record.
pub async fn delete_document(
    State(state): State<AppState>,
    session: Session,
    DocumentId(id): DocumentId,
) -> Response {
    let document = match state.store.get(id).await {
        Ok(Some(document)) => document,
        Ok(None) => return flash::redirect(&session, Level::Danger, NOT_FOUND_MESSAGE, "/").await,
        Err(e) => return fail(&session, "Failed to load document", e).await,
    };

    if let Some(storage_path) = document.storage_path.as_deref() {
        if let Err(e) = state.storage.delete(storage_path).await {
            counter!(STORAGE_FAILURES).increment(1);
            tracing::warn!(
                document_id = id,
                backend = state.storage.name(),
                storage_path = %storage_path,
                error = %e,
                "Failed to delete stored file; removing document anyway"
            );
        }
    }

    match state.store.delete(id).await {
        Ok(()) => {
            counter!(DOCUMENTS_DELETED).increment(1);
            flash::redirect(&session, Level::Success, "Document deleted successfully!", "/").await
        }
        Err(e) => fail(&session, "Failed to delete document", e).await,
    }
}
