use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    /// No usable access token and no way to refresh one. Interactive sign-in
    /// is the only way forward.
    #[error("No OAuth token available; sign in again")]
    NoToken,
    #[error("Auth expired for account")]
    AuthExpired,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    /// Errors that a new access token might fix.
    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::NoToken | AppError::AuthExpired)
    }
}
