use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// A stored document and its (at most one) attached file.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub content: Option<String>,
    /// Original name of the attached file as uploaded.
    pub filename: Option<String>,
    /// Backend locator: a filesystem path or an object key.
    pub storage_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// The attachment as `(filename, storage_path)`, when one is present.
    pub fn attachment(&self) -> Option<(&str, &str)> {
        match (&self.filename, &self.storage_path) {
            (Some(name), Some(path)) => Some((name.as_str(), path.as_str())),
            _ => None,
        }
    }
}

/// Title and content as written by create and edit.
#[derive(Debug, Clone, Deserialize, Validate, PartialEq)]
pub struct DocumentFields {
    #[validate(length(
        min = 1,
        max = 255,
        message = "Title is required and must be at most 255 characters"
    ))]
    pub title: String,
    pub content: Option<String>,
}

impl DocumentFields {
    /// Trims the title and maps empty content to `None`.
    pub fn new(title: impl Into<String>, content: Option<String>) -> Self {
        Self {
            title: title.into().trim().to_string(),
            content: content.filter(|c| !c.is_empty()),
        }
    }
}
