use crate::flash::{self, Level};
use crate::handlers::documents::NOT_FOUND_MESSAGE;
use axum::async_trait;
use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use tower_sessions::Session;

/// The `{id}` path segment of a document route.
///
/// A segment that is not an integer cannot name a document, so it is rejected
/// the same way as an unknown id: a notice and a redirect to the list.
#[derive(Debug, Clone, Copy)]
pub struct DocumentId(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for DocumentId
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<i64>::from_request_parts(parts, state).await {
            Ok(Path(id)) => Ok(DocumentId(id)),
            Err(rejection) => {
                tracing::info!(uri = %parts.uri, error = %rejection, "Invalid document id");
                let session = Session::from_request_parts(parts, state)
                    .await
                    .map_err(IntoResponse::into_response)?;
                Err(flash::redirect(&session, Level::Danger, NOT_FOUND_MESSAGE, "/").await)
            }
        }
    }
}
