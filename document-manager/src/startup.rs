use crate::config::{Settings, StorageBackend, StorageSettings};
use crate::flash;
use crate::handlers;
use crate::services::{DocumentStore, LocalStorage, PgDocumentStore, S3Storage, Storage};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    security_headers::security_headers_middleware,
    tracing::{make_request_span, request_id_middleware},
};
use std::future::Future;
use std::sync::Arc;
use time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tower_sessions::cookie::{Key, SameSite};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub storage: Arc<dyn Storage>,
    pub max_upload_bytes: usize,
}

/// Picks the blob backend named by `storage.backend`.
pub async fn build_storage(settings: &StorageSettings) -> Result<Arc<dyn Storage>, AppError> {
    match settings.backend {
        StorageBackend::Local => {
            let storage = LocalStorage::new(&settings.local_path).await.map_err(|e| {
                tracing::error!(
                    "Failed to initialize local storage at {}: {}",
                    settings.local_path,
                    e
                );
                e
            })?;
            tracing::info!(path = %settings.local_path, "Using local file storage");
            Ok(Arc::new(storage))
        }
        StorageBackend::S3 => {
            let bucket = settings.s3_bucket.clone().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "storage.s3_bucket is required when storage.backend is s3"
                ))
            })?;
            let storage = S3Storage::connect(
                &settings.s3_region,
                settings.s3_endpoint.as_deref(),
                bucket,
            )
            .await;
            Ok(Arc::new(storage))
        }
    }
}

pub fn build_router(state: AppState, session_key: Key) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(Duration::hours(24)))
        .with_signed(session_key);

    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);

    Router::new()
        .route("/", get(handlers::list_documents))
        .route(
            "/create",
            get(handlers::create_form).post(handlers::create_document),
        )
        .route(
            "/edit/:id",
            get(handlers::edit_form).post(handlers::edit_document),
        )
        .route(
            "/upload/:id",
            get(handlers::upload_form)
                .post(handlers::upload_file)
                .layer(upload_limit),
        )
        .route("/delete/:id", post(handlers::delete_document))
        .route("/files/:id", get(handlers::fetch_file))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .layer(session_layer)
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span::<Body>))
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    store: PgDocumentStore,
}

impl Application {
    pub async fn build(settings: Settings) -> Result<Self, AppError> {
        let store = PgDocumentStore::connect(
            settings.database.connect_options(),
            settings.database.max_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to PostgreSQL: {}", e);
            e
        })?;

        if settings.database.run_migrations {
            store.run_migrations().await?;
        }

        let storage = build_storage(&settings.storage).await?;

        let state = AppState {
            store: Arc::new(store.clone()),
            storage,
            max_upload_bytes: settings.storage.max_upload_bytes,
        };
        let session_key = flash::session_key(settings.server.session_secret.expose_secret());
        let router = build_router(state, session_key);

        let addr = format!("{}:{}", settings.server.host, settings.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        Ok(Self {
            port,
            listener,
            router,
            store,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn store(&self) -> &PgDocumentStore {
        &self.store
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router).await
    }

    /// Serves until `signal` resolves, then drains in-flight requests.
    pub async fn run_until<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(signal)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::memory::MemoryDocumentStore;
    use axum::http::{header, Request, Response, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "test-boundary";

    /// Local storage that refuses every delete.
    struct UndeletableStorage(LocalStorage);

    #[async_trait::async_trait]
    impl Storage for UndeletableStorage {
        fn name(&self) -> &'static str {
            "undeletable"
        }

        async fn put(
            &self,
            document_id: i64,
            filename: &str,
            data: Vec<u8>,
        ) -> Result<String, AppError> {
            self.0.put(document_id, filename, data).await
        }

        async fn delete(&self, _locator: &str) -> Result<(), AppError> {
            Err(AppError::StorageError(anyhow::anyhow!("permission denied")))
        }

        async fn resolve(
            &self,
            locator: &str,
        ) -> Result<crate::services::FileAccess, AppError> {
            self.0.resolve(locator).await
        }
    }

    async fn undeletable_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let storage = UndeletableStorage(LocalStorage::new(dir.path()).await.unwrap());
        TestApp::with_storage(dir, Arc::new(storage), 1024 * 1024)
    }

    struct TestApp {
        router: Router,
        store: Arc<MemoryDocumentStore>,
        cookie: Option<String>,
        _dir: TempDir,
    }

    impl TestApp {
        async fn new() -> Self {
            Self::with_upload_limit(1024 * 1024).await
        }

        async fn with_upload_limit(max_upload_bytes: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let storage = LocalStorage::new(dir.path()).await.unwrap();
            Self::with_storage(dir, Arc::new(storage), max_upload_bytes)
        }

        fn with_storage(dir: TempDir, storage: Arc<dyn Storage>, max_upload_bytes: usize) -> Self {
            let store = Arc::new(MemoryDocumentStore::default());
            let state = AppState {
                store: store.clone(),
                storage,
                max_upload_bytes,
            };

            Self {
                router: build_router(state, flash::session_key("test-secret")),
                store,
                cookie: None,
                _dir: dir,
            }
        }

        /// Sends `request` with the current session cookie and keeps any
        /// replacement the server hands back.
        async fn send(&mut self, mut request: Request<Body>) -> Response<Body> {
            if let Some(cookie) = &self.cookie {
                request
                    .headers_mut()
                    .insert(header::COOKIE, cookie.parse().unwrap());
            }

            let response = self.router.clone().oneshot(request).await.unwrap();

            if let Some(set_cookie) = response.headers().get(header::SET_COOKIE) {
                let pair = set_cookie
                    .to_str()
                    .unwrap()
                    .split(';')
                    .next()
                    .unwrap()
                    .to_string();
                self.cookie = match pair.split_once('=') {
                    Some((_, value)) if !value.is_empty() => Some(pair),
                    _ => None,
                };
            }

            response
        }

        async fn get(&mut self, uri: &str) -> Response<Body> {
            self.send(Request::get(uri).body(Body::empty()).unwrap())
                .await
        }

        async fn post_form(&mut self, uri: &str, body: &str) -> Response<Body> {
            self.send(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
        }

        async fn upload(&mut self, uri: &str, filename: &str, data: &[u8]) -> Response<Body> {
            let mut body = format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                b = BOUNDARY,
                f = filename
            )
            .into_bytes();
            body.extend_from_slice(data);
            body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

            self.send(
                Request::post(uri)
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={}", BOUNDARY),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
        }

        /// Renders the list page, consuming pending notices.
        async fn index(&mut self) -> String {
            let response = self.get("/").await;
            assert_eq!(response.status(), StatusCode::OK);
            body_string(response).await
        }

        async fn create(&mut self, title: &str) -> i64 {
            let response = self
                .post_form("/create", &format!("title={}&content=", title))
                .await;
            assert_redirect(&response, "/");
            self.store.list_all().await.unwrap()[0].id
        }

        async fn document(&self, id: i64) -> crate::models::Document {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    async fn body_string(response: Response<Body>) -> String {
        String::from_utf8(body_bytes(response).await).unwrap()
    }

    fn assert_redirect(response: &Response<Body>, to: &str) {
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], to);
    }

    #[tokio::test]
    async fn created_documents_are_listed_newest_first() {
        let mut app = TestApp::new().await;

        app.create("First").await;
        app.create("Second").await;

        let page = app.index().await;
        assert!(page.contains("Document created successfully!"));
        let first = page.find("First").unwrap();
        let second = page.find("Second").unwrap();
        assert!(second < first);

        let page = app.index().await;
        assert!(!page.contains("Document created successfully!"));
    }

    #[tokio::test]
    async fn blank_title_rerenders_form() {
        let mut app = TestApp::new().await;

        let response = app.post_form("/create", "title=++&content=body").await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_string(response).await.contains("Title is required"));
        assert!(app.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn edit_renames_and_keeps_content() {
        let mut app = TestApp::new().await;
        let response = app
            .post_form("/create", "title=Invoice&content=Net+30+days")
            .await;
        assert_redirect(&response, "/");
        let id = app.store.list_all().await.unwrap()[0].id;

        let form = body_string(app.get(&format!("/edit/{}", id)).await).await;
        assert!(form.contains("Invoice"));
        assert!(form.contains("Net 30 days"));

        let response = app
            .post_form(&format!("/edit/{}", id), "title=Invoice+Q1&content=Net+30+days")
            .await;
        assert_redirect(&response, "/");

        let document = app.document(id).await;
        assert_eq!(document.title, "Invoice Q1");
        assert_eq!(document.content.as_deref(), Some("Net 30 days"));
        assert!(app.index().await.contains("Updated successfully!"));
    }

    #[tokio::test]
    async fn edit_can_replace_content() {
        let mut app = TestApp::new().await;
        let id = app.create("Draft").await;

        let response = app
            .post_form(&format!("/edit/{}", id), "title=Final&content=Signed+off")
            .await;
        assert_redirect(&response, "/");

        let document = app.document(id).await;
        assert_eq!(document.title, "Final");
        assert_eq!(document.content.as_deref(), Some("Signed off"));
    }

    #[tokio::test]
    async fn non_numeric_id_redirects_with_notice() {
        let mut app = TestApp::new().await;

        let response = app.get("/edit/abc").await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document not found"));

        let response = app
            .send(Request::post("/delete/abc").body(Body::empty()).unwrap())
            .await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document not found"));

        let response = app.get("/files/1.5").await;
        assert_redirect(&response, "/");
    }

    #[tokio::test]
    async fn edit_of_unknown_document_redirects_with_notice() {
        let mut app = TestApp::new().await;

        let response = app.get("/edit/99").await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document not found"));

        let response = app.post_form("/edit/99", "title=Ghost").await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document not found"));
    }

    #[tokio::test]
    async fn uploaded_file_is_served_back() {
        let mut app = TestApp::new().await;
        let id = app.create("Contract").await;

        let response = app
            .upload(&format!("/upload/{}", id), "a.pdf", b"%PDF-1.4 test")
            .await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("File uploaded successfully!"));

        let document = app.document(id).await;
        assert_eq!(document.filename.as_deref(), Some("a.pdf"));
        assert!(document.storage_path.as_deref().unwrap().ends_with("_a.pdf"));

        let response = app.get(&format!("/files/{}", id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"a.pdf\""
        );
        assert_eq!(body_bytes(response).await, b"%PDF-1.4 test");
    }

    #[tokio::test]
    async fn replacing_a_file_removes_the_old_blob() {
        let mut app = TestApp::new().await;
        let id = app.create("Report").await;

        app.upload(&format!("/upload/{}", id), "a.pdf", b"old").await;
        let old_path = app.document(id).await.storage_path.unwrap();

        app.upload(&format!("/upload/{}", id), "b.txt", b"new").await;
        let document = app.document(id).await;

        assert_eq!(document.filename.as_deref(), Some("b.txt"));
        assert_ne!(document.storage_path.as_deref(), Some(old_path.as_str()));
        assert!(!std::path::Path::new(&old_path).exists());

        let response = app.get(&format!("/files/{}", id)).await;
        assert_eq!(body_bytes(response).await, b"new");
    }

    #[tokio::test]
    async fn upload_without_file_asks_again() {
        let mut app = TestApp::new().await;
        let id = app.create("Empty").await;
        let upload_url = format!("/upload/{}", id);

        let response = app.upload(&upload_url, "", b"").await;
        assert_redirect(&response, &upload_url);

        let form = app.get(&upload_url).await;
        assert!(body_string(form).await.contains("No file selected"));
        assert!(app.document(id).await.storage_path.is_none());
    }

    #[tokio::test]
    async fn upload_to_unknown_document_is_rejected() {
        let mut app = TestApp::new().await;

        let response = app.upload("/upload/42", "a.pdf", b"data").await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document not found"));
    }

    #[tokio::test]
    async fn oversized_upload_is_refused() {
        let mut app = TestApp::with_upload_limit(16).await;
        let id = app.create("Big").await;
        let upload_url = format!("/upload/{}", id);

        let response = app.upload(&upload_url, "big.bin", &[7u8; 256]).await;
        assert_redirect(&response, &upload_url);

        let form = app.get(&upload_url).await;
        assert!(body_string(form).await.contains("Upload failed"));
        assert!(app.document(id).await.storage_path.is_none());
    }

    #[tokio::test]
    async fn fetch_without_attachment_redirects() {
        let mut app = TestApp::new().await;
        let id = app.create("Notes").await;

        let response = app.get(&format!("/files/{}", id)).await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("No file available"));

        let response = app.get("/files/404").await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("No file available"));
    }

    #[tokio::test]
    async fn delete_removes_record_and_file() {
        let mut app = TestApp::new().await;
        let id = app.create("Obsolete").await;
        app.upload(&format!("/upload/{}", id), "a.pdf", b"bytes").await;
        let path = app.document(id).await.storage_path.unwrap();

        let response = app.send(delete_request(id)).await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document deleted successfully!"));
        assert!(app.store.get(id).await.unwrap().is_none());
        assert!(!std::path::Path::new(&path).exists());

        let response = app.send(delete_request(id)).await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document not found"));
    }

    #[tokio::test]
    async fn delete_succeeds_when_blob_is_already_gone() {
        let mut app = TestApp::new().await;
        let id = app.create("Orphan").await;
        app.upload(&format!("/upload/{}", id), "a.pdf", b"bytes").await;
        let path = app.document(id).await.storage_path.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        let response = app.send(delete_request(id)).await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document deleted successfully!"));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let mut app = TestApp::new().await;

        let response = app.get("/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "document-manager");
        assert_eq!(body["storage"], "local");

        let response = app.get("/ready").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn responses_carry_request_id_and_security_headers() {
        let mut app = TestApp::new().await;

        let response = app.get("/").await;
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    }

    #[tokio::test]
    async fn failed_blob_delete_does_not_block_document_delete() {
        let mut app = undeletable_app().await;
        let id = app.create("Locked").await;
        app.upload(&format!("/upload/{}", id), "a.pdf", b"bytes").await;
        assert!(app.document(id).await.storage_path.is_some());

        let response = app.send(delete_request(id)).await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("Document deleted successfully!"));
        assert!(app.store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_blob_delete_does_not_block_replacement() {
        let mut app = undeletable_app().await;
        let id = app.create("Locked").await;
        app.upload(&format!("/upload/{}", id), "a.pdf", b"old").await;
        let old_path = app.document(id).await.storage_path.unwrap();

        let response = app
            .upload(&format!("/upload/{}", id), "b.txt", b"new")
            .await;
        assert_redirect(&response, "/");
        assert!(app.index().await.contains("File uploaded successfully!"));

        let document = app.document(id).await;
        assert_eq!(document.filename.as_deref(), Some("b.txt"));
        assert_ne!(document.storage_path.as_deref(), Some(old_path.as_str()));

        let response = app.get(&format!("/files/{}", id)).await;
        assert_eq!(body_bytes(response).await, b"new");
    }

    #[tokio::test]
    async fn health_and_readiness_fail_when_database_is_down() {
        let mut app = TestApp::new().await;
        app.store.set_unavailable();

        let response = app.get("/health").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["status"], "unhealthy");

        let response = app.get("/ready").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    fn delete_request(id: i64) -> Request<Body> {
        Request::post(format!("/delete/{}", id))
            .body(Body::empty())
            .unwrap()
    }
}
