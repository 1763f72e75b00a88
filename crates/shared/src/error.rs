use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
    #[error("invalid delay: {0} seconds (must be greater than zero)")]
    InvalidDelay(u32),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Error body returned by the compositing backend on non-2xx responses.
///
/// The backend reports either `message` or a FastAPI-style `detail`, which
/// may be a string or a list of validation entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl BackendErrorBody {
    pub fn human_message(&self) -> Option<String> {
        if let Some(message) = self.message.as_deref().map(str::trim) {
            if !message.is_empty() {
                return Some(message.to_string());
            }
        }

        match &self.detail {
            Some(serde_json::Value::String(detail)) if !detail.trim().is_empty() => {
                Some(detail.trim().to_string())
            }
            Some(serde_json::Value::Array(entries)) => entries
                .iter()
                .find_map(|entry| entry.get("msg").and_then(|msg| msg.as_str()))
                .map(str::to_string),
            _ => None,
        }
    }
}
