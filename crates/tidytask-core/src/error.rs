use thiserror::Error;

#[derive(Error, Debug)]
pub enum TidyTaskError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid registration key: {0}")]
    InvalidKey(String),

    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("System query error: {0}")]
    System(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, TidyTaskError>;
