use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Credential store error: {0}")]
    Credential(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Sign-out is blocked while a blocking session is active")]
    SignOutBlocked,
    #[error("Active blocking session is server-controlled and cannot be changed locally")]
    SessionLocked,
}

impl InfraError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("network error")
                    || message.contains("timeout")
                    || message.contains("timed out")
                    || message.contains("temporarily unavailable")
                    || message.contains("connection reset")
            }
            _ => false,
        }
    }
}
