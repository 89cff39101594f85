use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Content parse error: {0}")]
    ContentParse(String),
    #[error("Decryption error: {0}")]
    Decryption(String),
    #[error("Index store error: {0}")]
    IndexStore(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Key packet error: {0}")]
    KeyPacket(String),
    #[error("Secure storage error: {0}")]
    SecureStorage(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl EngineError {
    /// Network failures are the only ones worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Network(_))
    }

    /// Errors that make a single message unreadable without affecting the build.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            EngineError::ContentParse(_) | EngineError::Decryption(_) | EngineError::KeyPacket(_)
        )
    }
}

/// Maps a sqlx/io failure into `IndexStore` with a short context string.
pub(crate) fn store_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> EngineError {
    move |e| EngineError::IndexStore(format!("{context}: {e}"))
}
