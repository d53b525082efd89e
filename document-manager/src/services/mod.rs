pub mod database;
pub mod metrics;
pub mod storage;

pub use database::{DocumentStore, PgDocumentStore};
pub use metrics::{get_metrics, init_metrics};
pub use storage::{FileAccess, LocalStorage, S3Storage, Storage};
