use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use sqlx::postgres::PgConnectOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub observability: ObservabilitySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Signs the session cookie that carries flash notices.
    pub session_secret: Secret<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Secret<String>,
    pub max_connections: u32,
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

fn default_run_migrations() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub local_path: String,
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    /// Custom S3-compatible endpoint (MinIO, LocalStack).
    pub s3_endpoint: Option<String>,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self, AppError> {
        let settings: Settings = core_config::load(|builder| {
            builder
                .set_default("server.host", "0.0.0.0")?
                .set_default("server.port", 8080)?
                .set_default("server.session_secret", "devsecret")?
                .set_default("database.host", "localhost")?
                .set_default("database.port", 5432)?
                .set_default("database.name", "appdb")?
                .set_default("database.user", "postgres")?
                .set_default("database.password", "")?
                .set_default("database.max_connections", 5)?
                .set_default("storage.backend", "local")?
                .set_default("storage.local_path", "uploads")?
                .set_default("storage.s3_region", "ap-south-1")?
                .set_default("storage.max_upload_bytes", 20 * 1024 * 1024)?
                .set_default("observability.log_level", "info")
        })?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.storage.backend == StorageBackend::S3
            && self
                .storage
                .s3_bucket
                .as_deref()
                .map_or(true, |b| b.trim().is_empty())
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "storage.s3_bucket is required when storage.backend is s3"
            )));
        }

        if self.storage.max_upload_bytes == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "storage.max_upload_bytes must be greater than 0"
            )));
        }

        if self.server.session_secret.expose_secret().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "server.session_secret must not be empty"
            )));
        }

        Ok(())
    }
}

impl DatabaseSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(self.password.expose_secret())
            .database(&self.name)
    }
}
