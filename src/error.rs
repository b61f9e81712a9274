use serde::Serialize;
use thiserror::Error;

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 300;

/// Failures the sync engine distinguishes between.
///
/// `Clone` so a single in-flight operation can hand the same outcome to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response shape: {0}")]
    Schema(String),

    #[error("Stale write rejected: {0}")]
    StaleWriteRejected(String),

    #[error("Authentication required")]
    AuthRequired,
}

impl SyncError {
    /// Whether retrying the same request can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::AuthRequired)
    }

    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let cut = (0..=MAX_ERROR_BODY_LENGTH)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 | 403 => SyncError::AuthRequired,
            408 | 429 | 500..=599 => {
                SyncError::Network(format!("status {}: {}", status, truncated))
            }
            _ => SyncError::Schema(format!("status {}: {}", status, truncated)),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Schema(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::from_status(status, "")
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Schema(err.to_string())
    }
}
