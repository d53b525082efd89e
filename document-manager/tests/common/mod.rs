use document_manager::config::Settings;
use document_manager::services::PgDocumentStore;
use document_manager::startup::Application;
use sqlx::{Connection, Executor, PgConnection};
use uuid::Uuid;

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: PgDocumentStore,
    pub db_name: String,
    pub storage_path: String,
    pub client: reqwest::Client,
    settings: Settings,
}

impl TestApp {
    /// Builds the app against a throwaway database and upload directory.
    pub async fn spawn() -> Self {
        let db_name = format!("document_test_{}", Uuid::new_v4().simple());
        let storage_path = format!("target/test-storage-{}", Uuid::new_v4());

        let mut settings = Settings::load().expect("Failed to load configuration");
        settings.server.host = "127.0.0.1".to_string();
        settings.server.port = 0; // Random port for testing
        settings.storage.local_path = storage_path.clone();

        let mut admin = PgConnection::connect_with(&settings.database.connect_options().database("postgres"))
            .await
            .expect("Failed to connect to PostgreSQL");
        admin
            .execute(format!(r#"CREATE DATABASE "{}""#, db_name).as_str())
            .await
            .expect("Failed to create test database");
        settings.database.name = db_name.clone();

        let app = Application::build(settings.clone())
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let store = app.store().clone();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .expect("Failed to build HTTP client");

        // Wait for HTTP server to be ready by polling health endpoint
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            store,
            db_name,
            storage_path,
            client,
            settings,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Cleanup test resources (database and storage).
    pub async fn cleanup(&self) {
        self.store.pool().close().await;
        let options = self.settings.database.connect_options().database("postgres");
        if let Ok(mut admin) = PgConnection::connect_with(&options).await {
            let _ = admin
                .execute(format!(r#"DROP DATABASE IF EXISTS "{}" WITH (FORCE)"#, self.db_name).as_str())
                .await;
        }
        let _ = tokio::fs::remove_dir_all(&self.storage_path).await;
    }
}
