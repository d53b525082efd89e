pub mod documents;
pub mod extract;
pub mod files;
pub mod health;

pub use documents::{
    create_document, create_form, delete_document, edit_document, edit_form, list_documents,
};
pub use files::{fetch_file, upload_file, upload_form};
pub use health::{health_check, metrics_endpoint, readiness_check};
