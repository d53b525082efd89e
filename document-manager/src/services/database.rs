//! Document metadata persistence.

use crate::models::{Document, DocumentFields};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use metrics::histogram;
use service_core::error::AppError;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{info, instrument};
use validator::Validate;

const DOCUMENT_COLUMNS: &str = "id, title, content, filename, storage_path, created_at";

/// CRUD over the `documents` table.
///
/// `delete` only removes the record; callers delete the attached blob
/// beforehand, and the two steps are not transactional.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All documents, newest first.
    async fn list_all(&self) -> Result<Vec<Document>, AppError>;

    /// Inserts a document with no attachment. Blank titles fail validation.
    async fn create(&self, input: &DocumentFields) -> Result<Document, AppError>;

    async fn get(&self, id: i64) -> Result<Option<Document>, AppError>;

    /// Overwrites title and content; the attachment is untouched.
    async fn update_fields(&self, id: i64, input: &DocumentFields) -> Result<Document, AppError>;

    /// Overwrites both attachment fields together.
    async fn attach_file(
        &self,
        id: i64,
        filename: &str,
        storage_path: &str,
    ) -> Result<Document, AppError>;

    async fn delete(&self, id: i64) -> Result<(), AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

fn not_found(id: i64) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Document {} not found", id))
}

fn observe(operation: &'static str, started: Instant) {
    histogram!(DB_QUERY_DURATION, "operation" => operation).record(started.elapsed().as_secs_f64());
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    /// Create a new database connection pool.
    #[instrument(skip(options), fields(service = "document-manager"))]
    pub async fn connect(
        options: PgConnectOptions,
        max_connections: u32,
    ) -> Result<Self, AppError> {
        info!(max_connections = max_connections, "Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<Document>, AppError> {
        let started = Instant::now();

        let documents = sqlx::query_as::<_, Document>(&format!(
            "SELECT {} FROM documents ORDER BY created_at DESC, id DESC",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list documents: {}", e)))?;

        observe("list_all", started);
        Ok(documents)
    }

    #[instrument(skip(self, input), fields(title = %input.title))]
    async fn create(&self, input: &DocumentFields) -> Result<Document, AppError> {
        input.validate()?;
        let started = Instant::now();

        let document = sqlx::query_as::<_, Document>(&format!(
            "INSERT INTO documents (title, content) VALUES ($1, $2) RETURNING {}",
            DOCUMENT_COLUMNS
        ))
        .bind(&input.title)
        .bind(&input.content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create document: {}", e)))?;

        observe("create", started);
        info!(document_id = document.id, "Document created");
        Ok(document)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: i64) -> Result<Option<Document>, AppError> {
        let started = Instant::now();

        let document = sqlx::query_as::<_, Document>(&format!(
            "SELECT {} FROM documents WHERE id = $1",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get document: {}", e)))?;

        observe("get", started);
        Ok(document)
    }

    #[instrument(skip(self, input))]
    async fn update_fields(&self, id: i64, input: &DocumentFields) -> Result<Document, AppError> {
        input.validate()?;
        let started = Instant::now();

        let document = sqlx::query_as::<_, Document>(&format!(
            "UPDATE documents SET title = $1, content = $2 WHERE id = $3 RETURNING {}",
            DOCUMENT_COLUMNS
        ))
        .bind(&input.title)
        .bind(&input.content)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update document: {}", e)))?
        .ok_or_else(|| not_found(id))?;

        observe("update_fields", started);
        info!(document_id = id, "Document updated");
        Ok(document)
    }

    #[instrument(skip(self))]
    async fn attach_file(
        &self,
        id: i64,
        filename: &str,
        storage_path: &str,
    ) -> Result<Document, AppError> {
        let started = Instant::now();

        let document = sqlx::query_as::<_, Document>(&format!(
            "UPDATE documents SET filename = $1, storage_path = $2 WHERE id = $3 RETURNING {}",
            DOCUMENT_COLUMNS
        ))
        .bind(filename)
        .bind(storage_path)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to attach file: {}", e)))?
        .ok_or_else(|| not_found(id))?;

        observe("attach_file", started);
        info!(document_id = id, "File metadata attached");
        Ok(document)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> Result<(), AppError> {
        let started = Instant::now();

        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to delete document: {}", e))
            })?;

        observe("delete", started);

        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }

        info!(document_id = id, "Document deleted");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}
