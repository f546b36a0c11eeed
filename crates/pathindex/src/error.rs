use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Helper process error: {0}")]
    Helper(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Engine stopped")]
    Stopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;
