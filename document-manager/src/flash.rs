//! One-shot notices carried across a redirect in the session.

use axum::response::{IntoResponse, Redirect, Response};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tower_sessions::cookie::Key;
use tower_sessions::Session;

const FLASH_KEY: &str = "flash";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Danger,
}

impl Level {
    pub fn css_class(&self) -> &'static str {
        match self {
            Level::Success => "success",
            Level::Danger => "danger",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashMessage {
    pub level: Level,
    pub message: String,
}

/// Queue a notice for the next rendered page. Session failures only lose the
/// notice.
pub async fn push(session: &Session, level: Level, message: impl Into<String>) {
    let mut queue: Vec<FlashMessage> = match session.get(FLASH_KEY).await {
        Ok(queue) => queue.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read flash queue");
            Vec::new()
        }
    };

    queue.push(FlashMessage {
        level,
        message: message.into(),
    });

    if let Err(e) = session.insert(FLASH_KEY, queue).await {
        tracing::warn!(error = %e, "Failed to store flash notice");
    }
}

/// Drain all pending notices.
pub async fn take(session: &Session) -> Vec<FlashMessage> {
    match session.remove::<Vec<FlashMessage>>(FLASH_KEY).await {
        Ok(queue) => queue.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read flash queue");
            Vec::new()
        }
    }
}

/// Queue a notice and redirect to `to`.
pub async fn redirect(
    session: &Session,
    level: Level,
    message: impl Into<String>,
    to: &str,
) -> Response {
    push(session, level, message).await;
    Redirect::to(to).into_response()
}

/// Cookie signing key derived from the configured session secret.
pub fn session_key(secret: &str) -> Key {
    let digest = Sha512::digest(secret.as_bytes());
    Key::from(digest.as_slice())
}
