use thiserror::Error;

use super::{CommunicationError, ConfigError, FileStoreError, WorkerError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Communication error: {0}")]
    Communication(#[from] CommunicationError),
    #[error("File store error: {0}")]
    FileStore(#[from] FileStoreError),
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn communication<E>(error: E) -> Self
    where
        E: Into<CommunicationError>,
    {
        error.into().into()
    }

    pub fn file_store<E>(error: E) -> Self
    where
        E: Into<FileStoreError>,
    {
        error.into().into()
    }

    pub fn worker<E>(error: E) -> Self
    where
        E: Into<WorkerError>,
    {
        error.into().into()
    }
}
